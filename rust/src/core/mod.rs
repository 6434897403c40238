pub(crate) mod api;
pub(crate) mod config;
pub(crate) mod coordinator;
pub(crate) mod engine;
pub(crate) mod push;
pub(crate) mod recovery;
mod renewal;
mod session;
pub(crate) mod storage;
pub(crate) mod voice;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::IntercomError;
use crate::events::{Emitter, EventKind, IntercomEvent, ListenerId};
use crate::state::{CurrentUserContext, RtmStatus, SignalingSession};

use self::api::{AccessTokenSource, IntercomApi};
use self::config::{IntercomConfig, SessionTimings};
use self::engine::{MessagingEngine, MessagingEngineEvent, MessagingEngineFactory};
use self::renewal::ScheduledTask;

pub use self::renewal::{reconnect_delay, renewal_delay, PendingTimers};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectionParams {
    app_id: String,
    api_base_url: String,
}

#[derive(Default)]
struct SessionState {
    engine: Option<Arc<dyn MessagingEngine>>,
    pump: Option<JoinHandle<()>>,
    current_user: Option<CurrentUserContext>,
    session: Option<SignalingSession>,
    standby_in_progress: bool,
    standby_initialized_users: HashSet<String>,
    // Set while login/renewal deliberately logs out, so the resulting drop is not treated as a failure.
    relogin_in_progress: bool,
    // Bumped by cleanup; in-flight logins compare it before committing.
    epoch: u64,
    renewal: Option<ScheduledTask>,
    reconnect: Option<ScheduledTask>,
    reconnect_attempts: u32,
    pruned_peers: HashMap<String, Instant>,
}

type AppIdHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Shared {
    params: RwLock<ConnectionParams>,
    app_id_hook: RwLock<Option<AppIdHook>>,
    timings: SessionTimings,
    factory: Arc<dyn MessagingEngineFactory>,
    api: Arc<dyn IntercomApi>,
    access_tokens: Arc<dyn AccessTokenSource>,
    emitter: Arc<Emitter>,
    status_tx: watch::Sender<RtmStatus>,
    engine_states: broadcast::Sender<engine::EngineConnectionState>,
    state: Mutex<SessionState>,
    next_task_id: AtomicU64,
}

/// Owns the single messaging login of the process: standby warm-up, credential renewal and
/// reconnection after unexpected drops. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RtmSessionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RtmSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmSessionManager")
            .field("status", &self.status())
            .finish()
    }
}

impl RtmSessionManager {
    pub fn new(
        config: &IntercomConfig,
        factory: Arc<dyn MessagingEngineFactory>,
        api: Arc<dyn IntercomApi>,
        access_tokens: Arc<dyn AccessTokenSource>,
        emitter: Arc<Emitter>,
    ) -> Self {
        let api_base_url = porteiro_endpoints::resolve_api_base_url(
            config.api_base_url.as_deref(),
            None,
            porteiro_endpoints::current_platform(),
        );
        let (status_tx, _) = watch::channel(RtmStatus::Disconnected);
        let (engine_states, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                params: RwLock::new(ConnectionParams {
                    app_id: config.app_id.clone().unwrap_or_default(),
                    api_base_url,
                }),
                app_id_hook: RwLock::new(None),
                timings: config.session_timings(),
                factory,
                api,
                access_tokens,
                emitter,
                status_tx,
                engine_states,
                state: Mutex::new(SessionState::default()),
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    /// Non-empty values replace the current ones; last write wins. A new app id is also handed
    /// to the hook installed with [`Self::on_app_id`].
    pub fn configure(&self, app_id: Option<&str>, api_base_url: Option<&str>) {
        let app_id = app_id.map(str::trim).filter(|s| !s.is_empty());
        {
            let mut params = match self.shared.params.write() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            if let Some(app_id) = app_id {
                params.app_id = app_id.to_string();
            }
            if let Some(url) = api_base_url.filter(|s| !s.trim().is_empty()) {
                params.api_base_url = porteiro_endpoints::resolve_api_base_url(
                    Some(url),
                    None,
                    porteiro_endpoints::current_platform(),
                );
            }
        }
        let Some(app_id) = app_id else {
            return;
        };
        let hook = match self.shared.app_id_hook.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        };
        if let Some(hook) = hook {
            hook(app_id);
        }
    }

    /// Installs the single app id hook, replacing any previous one. Runs outside all locks.
    pub fn on_app_id<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let hook: AppIdHook = Arc::new(hook);
        match self.shared.app_id_hook.write() {
            Ok(mut slot) => *slot = Some(hook),
            Err(poison) => *poison.into_inner() = Some(hook),
        }
    }

    pub fn app_id(&self) -> String {
        self.params().app_id
    }

    pub fn api_base_url(&self) -> String {
        self.params().api_base_url
    }

    fn params(&self) -> ConnectionParams {
        match self.shared.params.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn set_current_user(&self, user: Option<CurrentUserContext>) {
        self.lock_state().current_user = user;
    }

    pub fn current_user(&self) -> Option<CurrentUserContext> {
        self.lock_state().current_user.clone()
    }

    pub fn session(&self) -> Option<SignalingSession> {
        self.lock_state().session.clone()
    }

    pub fn has_engine(&self) -> bool {
        self.lock_state().engine.is_some()
    }

    pub fn status(&self) -> RtmStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<RtmStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.shared.emitter
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&IntercomEvent) + Send + Sync + 'static,
    {
        self.shared.emitter.on(kind, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.emitter.off(id)
    }

    pub fn clear_standby_for_user(&self, user_id: &str) {
        if self
            .lock_state()
            .standby_initialized_users
            .remove(user_id)
        {
            tracing::debug!(user_id, "cleared standby mark");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.shared.state.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn emit(&self, event: IntercomEvent) {
        self.shared.emitter.emit(event);
    }

    fn epoch(&self) -> u64 {
        self.lock_state().epoch
    }

    fn set_status(&self, next: RtmStatus) {
        let changed = self.shared.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::debug!(status = %next, "messaging status changed");
            self.emit(IntercomEvent::Status(next));
        }
    }

    fn next_task_id(&self) -> u64 {
        self.shared.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Creates the messaging engine on first use and starts pumping its callbacks.
    pub(crate) fn ensure_engine(&self) -> Result<Arc<dyn MessagingEngine>, IntercomError> {
        let mut st = self.lock_state();
        if let Some(engine) = st.engine.as_ref() {
            return Ok(engine.clone());
        }
        let app_id = self.app_id();
        if app_id.is_empty() {
            return Err(IntercomError::MissingAppId);
        }
        let (engine, events) = self.shared.factory.create(&app_id)?;
        let pump = tokio::spawn(run_event_pump(self.downgrade(), events));
        st.engine = Some(engine.clone());
        st.pump = Some(pump);
        tracing::info!("messaging engine created");
        Ok(engine)
    }

    fn handle_engine_event(&self, event: MessagingEngineEvent) {
        match event {
            MessagingEngineEvent::MessageReceived { peer_id, text } => {
                self.emit(IntercomEvent::PeerMessage { peer_id, text });
            }
            MessagingEngineEvent::ConnectionStateChanged { state, reason } => {
                tracing::debug!(?state, reason, "messaging connection state");
                let _ = self.shared.engine_states.send(state);
                let mapped = state.status();
                self.set_status(mapped);
                if mapped != RtmStatus::Disconnected {
                    return;
                }
                let unexpected = {
                    let st = self.lock_state();
                    st.session.is_some() && !st.relogin_in_progress
                };
                if unexpected {
                    tracing::warn!(reason, "messaging connection dropped");
                    self.schedule_reconnect();
                }
            }
        }
    }
}

async fn run_event_pump(
    weak: Weak<Shared>,
    events: flume::Receiver<MessagingEngineEvent>,
) {
    while let Ok(event) = events.recv_async().await {
        let Some(manager) = RtmSessionManager::upgrade(&weak) else {
            break;
        };
        manager.handle_engine_event(event);
    }
}
