#![allow(dead_code)]

//! In-process fakes for the messaging engine, the backend API and the notification bridge.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use porteiro_core::{
    AccessTokenSource, ApiError, CallParticipant, CallParty, CallSnapshot, CallStatusReport,
    CredentialBundle, EngineConnectionState, EngineError, Emitter, EventKind, IncomingCallHandler,
    IncomingCallPush, IntercomApi, IntercomConfig, IntercomError, IntercomEvent, MessagingEngine,
    MessagingEngineEvent, MessagingEngineFactory, NotificationResponseSource, PeerSendOptions,
    StandbyBundle,
};
use serde_json::Value;

pub const APP_ID: &str = "test-app";

pub fn test_config() -> IntercomConfig {
    IntercomConfig {
        app_id: Some(APP_ID.into()),
        api_base_url: Some("http://backend.test".into()),
        ..IntercomConfig::default()
    }
}

/// Polls `f` under tokio time, so paused-clock tests advance instead of hanging.
pub async fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{what}: condition not met within {timeout:?}");
}

pub struct FakeEngine {
    events: flume::Sender<MessagingEngineEvent>,
    auto_connect: AtomicBool,
    login_results: Mutex<VecDeque<Result<(), EngineError>>>,
    fail_logins: AtomicBool,
    logins: Mutex<Vec<(String, String)>>,
    logouts: AtomicUsize,
    sends: Mutex<Vec<(String, String)>>,
    send_errors: Mutex<HashMap<String, EngineError>>,
    destroyed: AtomicUsize,
}

impl FakeEngine {
    fn new(events: flume::Sender<MessagingEngineEvent>) -> Self {
        Self {
            events,
            auto_connect: AtomicBool::new(true),
            login_results: Mutex::new(VecDeque::new()),
            fail_logins: AtomicBool::new(false),
            logins: Mutex::new(Vec::new()),
            logouts: AtomicUsize::new(0),
            sends: Mutex::new(Vec::new()),
            send_errors: Mutex::new(HashMap::new()),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// When enabled (the default) a successful login is followed by a `Connected` callback.
    pub fn set_auto_connect(&self, on: bool) {
        self.auto_connect.store(on, Ordering::SeqCst);
    }

    pub fn push_login_result(&self, result: Result<(), EngineError>) {
        self.login_results.lock().unwrap().push_back(result);
    }

    /// Every login fails from now on.
    pub fn fail_all_logins(&self, on: bool) {
        self.fail_logins.store(on, Ordering::SeqCst);
    }

    pub fn fail_sends_to(&self, peer: &str, err: EngineError) {
        self.send_errors.lock().unwrap().insert(peer.into(), err);
    }

    pub fn clear_send_failures(&self) {
        self.send_errors.lock().unwrap().clear();
    }

    pub fn emit_state(&self, state: EngineConnectionState) {
        let _ = self.events.send(MessagingEngineEvent::ConnectionStateChanged { state, reason: 0 });
    }

    pub fn emit_message(&self, peer_id: &str, text: &str) {
        let _ = self.events.send(MessagingEngineEvent::MessageReceived {
            peer_id: peer_id.into(),
            text: text.into(),
        });
    }

    pub fn logins(&self) -> Vec<(String, String)> {
        self.logins.lock().unwrap().clone()
    }

    pub fn login_count(&self) -> usize {
        self.logins.lock().unwrap().len()
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sends().into_iter().map(|(peer, _)| peer).collect()
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingEngine for FakeEngine {
    async fn login(&self, uid: &str, token: &str) -> Result<(), EngineError> {
        self.logins.lock().unwrap().push((uid.into(), token.into()));
        let scripted = self.login_results.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None if self.fail_logins.load(Ordering::SeqCst) => {
                Err(EngineError::with_code(5, "login rejected"))
            }
            None => Ok(()),
        };
        if result.is_ok() && self.auto_connect.load(Ordering::SeqCst) {
            self.emit_state(EngineConnectionState::Connected);
        }
        result
    }

    async fn logout(&self) -> Result<(), EngineError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        // The real SDK reports its own logout as a state change.
        self.emit_state(EngineConnectionState::Disconnected);
        Ok(())
    }

    async fn send_message_to_peer(
        &self,
        peer_id: &str,
        text: &str,
        _options: PeerSendOptions,
    ) -> Result<(), EngineError> {
        self.sends.lock().unwrap().push((peer_id.into(), text.into()));
        match self.send_errors.lock().unwrap().get(peer_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeEngineFactory {
    engine: Arc<FakeEngine>,
    events: flume::Receiver<MessagingEngineEvent>,
    created: AtomicUsize,
}

impl FakeEngineFactory {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self {
            engine: Arc::new(FakeEngine::new(tx)),
            events: rx,
            created: AtomicUsize::new(0),
        })
    }

    pub fn engine(&self) -> Arc<FakeEngine> {
        self.engine.clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl MessagingEngineFactory for FakeEngineFactory {
    fn create(
        &self,
        _app_id: &str,
    ) -> Result<(Arc<dyn MessagingEngine>, flume::Receiver<MessagingEngineEvent>), EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok((self.engine.clone(), self.events.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCallAction {
    pub call_id: String,
    pub user_id: String,
    pub detail: String,
}

/// Backend double. Call statuses are scripted per call id; unknown ids answer 404.
pub struct FakeApi {
    standby_uid: Mutex<Option<String>>,
    standby_expires_at: Mutex<Option<DateTime<Utc>>>,
    standby_latency: Mutex<Duration>,
    fail_standby: AtomicBool,
    standby_calls: AtomicUsize,
    statuses: Mutex<HashMap<String, CallStatusReport>>,
    status_calls: AtomicUsize,
    fail_answer: AtomicBool,
    answers: Mutex<Vec<RecordedCallAction>>,
    declines: Mutex<Vec<RecordedCallAction>>,
    ends: Mutex<Vec<RecordedCallAction>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            standby_uid: Mutex::new(None),
            standby_expires_at: Mutex::new(None),
            standby_latency: Mutex::new(Duration::from_millis(20)),
            fail_standby: AtomicBool::new(false),
            standby_calls: AtomicUsize::new(0),
            statuses: Mutex::new(HashMap::new()),
            status_calls: AtomicUsize::new(0),
            fail_answer: AtomicBool::new(false),
            answers: Mutex::new(Vec::new()),
            declines: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
        })
    }

    pub fn set_standby_expiry(&self, expires_at: Option<DateTime<Utc>>) {
        *self.standby_expires_at.lock().unwrap() = expires_at;
    }

    pub fn fail_standby(&self, on: bool) {
        self.fail_standby.store(on, Ordering::SeqCst);
    }

    pub fn standby_calls(&self) -> usize {
        self.standby_calls.load(Ordering::SeqCst)
    }

    pub fn set_call(&self, call_id: &str, status: &str, participants: &[&str]) {
        let report = CallStatusReport {
            call: CallSnapshot {
                status: Some(status.into()),
                channel_name: Some(format!("call-{call_id}")),
                doorman_name: Some("Seu Jorge".into()),
                apartment_number: Some("101".into()),
                building_id: Some("b-1".into()),
                ended_at: None,
            },
            participants: participants
                .iter()
                .map(|id| CallParticipant {
                    user_id: (*id).into(),
                    status: Some("invited".into()),
                    joined_at: None,
                    left_at: None,
                })
                .collect(),
        };
        self.statuses.lock().unwrap().insert(call_id.into(), report);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn fail_answer(&self, on: bool) {
        self.fail_answer.store(on, Ordering::SeqCst);
    }

    pub fn answers(&self) -> Vec<RecordedCallAction> {
        self.answers.lock().unwrap().clone()
    }

    pub fn declines(&self) -> Vec<RecordedCallAction> {
        self.declines.lock().unwrap().clone()
    }

    pub fn ends(&self) -> Vec<RecordedCallAction> {
        self.ends.lock().unwrap().clone()
    }
}

#[async_trait]
impl IntercomApi for FakeApi {
    async fn standby_bundle(
        &self,
        _base_url: &str,
        uid: &str,
        _access_token: Option<&str>,
    ) -> Result<StandbyBundle, ApiError> {
        self.standby_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.standby_latency.lock().unwrap();
        tokio::time::sleep(latency).await;
        if self.fail_standby.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                message: "standby unavailable".into(),
            });
        }
        let uid = self
            .standby_uid
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| uid.to_string());
        let n = self.standby_calls();
        Ok(StandbyBundle {
            app_id: Some(APP_ID.into()),
            rtm_token: format!("rtm-token-{n}"),
            uid,
            expires_at: *self.standby_expires_at.lock().unwrap(),
            ttl_seconds: Some(3600),
        })
    }

    async fn token_for_call(
        &self,
        _base_url: &str,
        call_id: &str,
        uid: &str,
        rtc_role: &str,
        _access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError> {
        Ok(credentials(&format!("call-{call_id}"), uid, rtc_role))
    }

    async fn generate_token(
        &self,
        _base_url: &str,
        channel_name: &str,
        uid: &str,
        rtc_role: &str,
        _access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError> {
        Ok(credentials(channel_name, uid, rtc_role))
    }

    async fn call_status(&self, _base_url: &str, call_id: &str) -> Result<CallStatusReport, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .get(call_id)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                message: "Call not found".into(),
            })
    }

    async fn answer_call(
        &self,
        _base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        _access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected {
                message: "call already answered".into(),
            });
        }
        self.answers.lock().unwrap().push(RecordedCallAction {
            call_id: call_id.into(),
            user_id: party.user_id.into(),
            detail: party.role.api_name().into(),
        });
        Ok(credentials(&format!("call-{call_id}"), party.user_id, "publisher"))
    }

    async fn decline_call(
        &self,
        _base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        reason: &str,
        _access_token: Option<&str>,
    ) -> Result<(), ApiError> {
        self.declines.lock().unwrap().push(RecordedCallAction {
            call_id: call_id.into(),
            user_id: party.user_id.into(),
            detail: reason.into(),
        });
        Ok(())
    }

    async fn end_call(
        &self,
        _base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        cause: &str,
        _access_token: Option<&str>,
    ) -> Result<(), ApiError> {
        self.ends.lock().unwrap().push(RecordedCallAction {
            call_id: call_id.into(),
            user_id: party.user_id.into(),
            detail: cause.into(),
        });
        Ok(())
    }
}

fn credentials(channel_name: &str, uid: &str, rtc_role: &str) -> CredentialBundle {
    CredentialBundle {
        rtc_token: format!("rtc-{channel_name}"),
        rtm_token: None,
        uid: uid.into(),
        channel_name: channel_name.into(),
        rtc_role: Some(rtc_role.into()),
        issued_at: None,
        expires_at: None,
        ttl_seconds: None,
    }
}

pub struct StaticAccessToken(pub &'static str);

#[async_trait]
impl AccessTokenSource for StaticAccessToken {
    async fn access_token(&self) -> Option<String> {
        Some(self.0.into())
    }
}

pub struct FakeNotifications(pub Option<Value>);

#[async_trait]
impl NotificationResponseSource for FakeNotifications {
    async fn last_notification_response(&self) -> Option<Value> {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    pushes: Mutex<Vec<IncomingCallPush>>,
    fail: AtomicBool,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        let handler = Self::default();
        handler.fail.store(true, Ordering::SeqCst);
        handler
    }

    pub fn pushes(&self) -> Vec<IncomingCallPush> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl IncomingCallHandler for RecordingHandler {
    async fn handle_incoming_push(&self, push: IncomingCallPush) -> Result<(), IntercomError> {
        self.pushes.lock().unwrap().push(push);
        if self.fail.load(Ordering::SeqCst) {
            return Err(IntercomError::NoActiveCall);
        }
        Ok(())
    }
}

/// Records every event of the given kinds.
pub fn record_events(emitter: &Emitter, kinds: &[EventKind]) -> Arc<Mutex<Vec<IntercomEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let seen = seen.clone();
        emitter.on(*kind, move |ev| seen.lock().unwrap().push(ev.clone()));
    }
    seen
}
