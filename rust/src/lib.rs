mod core;
mod error;
mod events;
mod logging;
mod state;

use std::sync::Arc;

use porteiro_media::{VoiceChannelManager, VoiceEngineFactory};
use serde_json::Value;

pub use crate::core::api::{AccessTokenSource, CallParty, HttpApiClient, IntercomApi, NoAccessToken};
pub use crate::core::config::{IntercomConfig, SessionTimings, CONFIG_FILE_NAME};
pub use crate::core::coordinator::{ActiveCall, CallCoordinator, CallSignal, SignalKind};
pub use crate::core::engine::{
    EngineConnectionState, MessagingEngine, MessagingEngineEvent, MessagingEngineFactory,
    PeerSendOptions, PEER_CACHED_OFFLINE_CODES,
};
pub use crate::core::push::{
    handle_background_notification, normalize_notification_payload, BackgroundDelivery,
    IncomingCallPush, INTERCOM_CALL_TYPE,
};
pub use crate::core::recovery::{
    IncomingCallHandler, NotificationResponseSource, RecoveryOutcome, StartupRecovery,
};
pub use crate::core::storage::{
    clear_active_call, clear_pending_call, load_active_call, load_pending_call, save_active_call,
    save_pending_call, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, ACTIVE_CALL_KEY,
    PENDING_CALL_KEY,
};
pub use crate::core::voice::{voice_channel_manager, voice_event_sink};
pub use crate::core::{reconnect_delay, renewal_delay, PendingTimers, RtmSessionManager};
pub use error::{ApiError, EngineError, IntercomError, StorageError};
pub use events::{Emitter, EventKind, IntercomEvent, ListenerId};
pub use logging::init_logging;
pub use state::*;

/// Platform bindings the runtime is built from.
pub struct IntercomDeps {
    pub messaging_factory: Arc<dyn MessagingEngineFactory>,
    pub voice_factory: Arc<dyn VoiceEngineFactory>,
    pub api: Arc<dyn IntercomApi>,
    pub access_tokens: Arc<dyn AccessTokenSource>,
    pub store: Arc<dyn KeyValueStore>,
}

/// Composition root: one event surface shared by the messaging session, the voice channel and
/// the call coordinator.
#[derive(Clone)]
pub struct IntercomRuntime {
    emitter: Arc<Emitter>,
    session: RtmSessionManager,
    voice: Arc<VoiceChannelManager>,
    coordinator: CallCoordinator,
    api: Arc<dyn IntercomApi>,
    store: Arc<dyn KeyValueStore>,
}

impl IntercomRuntime {
    pub fn new(config: &IntercomConfig, deps: IntercomDeps) -> Self {
        let emitter = Arc::new(Emitter::new());
        let session = RtmSessionManager::new(
            config,
            deps.messaging_factory,
            deps.api.clone(),
            deps.access_tokens.clone(),
            emitter.clone(),
        );
        let voice = Arc::new(voice_channel_manager(
            config.app_id.as_deref().unwrap_or_default(),
            deps.voice_factory,
            emitter.clone(),
        ));
        // Voice runs under the same app id as messaging, including one learned from standby.
        let voice_app_id = voice.clone();
        session.on_app_id(move |app_id| voice_app_id.set_app_id(app_id));
        let coordinator = CallCoordinator::new(
            session.clone(),
            voice.clone(),
            deps.api.clone(),
            deps.access_tokens,
            deps.store.clone(),
            config.rtm_warmup_timeout(),
        );
        tracing::info!(app_id_set = config.app_id.is_some(), "intercom runtime created");
        Self {
            emitter,
            session,
            voice,
            coordinator,
            api: deps.api,
            store: deps.store,
        }
    }

    /// Applies an app id or API base URL. The app id reaches the voice side through the
    /// session's app id hook.
    pub fn configure(&self, app_id: Option<&str>, api_base_url: Option<&str>) {
        self.session.configure(app_id, api_base_url);
    }

    pub fn session(&self) -> &RtmSessionManager {
        &self.session
    }

    pub fn voice(&self) -> &Arc<VoiceChannelManager> {
        &self.voice
    }

    pub fn coordinator(&self) -> &CallCoordinator {
        &self.coordinator
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn startup_recovery(&self, notifications: Arc<dyn NotificationResponseSource>) -> StartupRecovery {
        StartupRecovery::new(
            self.api.clone(),
            self.session.api_base_url(),
            notifications,
            self.store.clone(),
            Arc::new(self.coordinator.clone()),
        )
    }

    pub async fn handle_background_notification(&self, payload: &Value) -> BackgroundDelivery {
        handle_background_notification(payload, &self.coordinator, self.store.as_ref()).await
    }

    /// Tears down the call, then the messaging login, then the voice engine.
    pub async fn cleanup(&self) {
        self.coordinator.cleanup().await;
        self.session.cleanup().await;
        self.voice.release();
        tracing::info!("intercom runtime cleaned up");
    }
}
