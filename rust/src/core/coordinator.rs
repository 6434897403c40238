// Call coordination: turns pushes and peer signals into one active call at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use porteiro_media::{JoinWithAccount, VoiceChannelManager, VoiceEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;

use super::api::{AccessTokenSource, CallParty, IntercomApi};
use super::push::IncomingCallPush;
use super::recovery::IncomingCallHandler;
use super::storage::{self, KeyValueStore};
use super::RtmSessionManager;
use crate::error::IntercomError;
use crate::events::{Emitter, EventKind, IntercomEvent, ListenerId};
use crate::state::{
    now_millis, ActiveCallRecord, CallState, CredentialBundle, EndReason, RtmStatus, UserRole,
};

const DEFAULT_CALLER_NAME: &str = "Porteiro";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Invite,
    Answer,
    End,
    Decline,
}

/// Peer-to-peer call signal exchanged over the messaging session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    pub t: SignalKind,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub from: String,
    pub channel: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Loosely parsed inbound signal. Peers in the field also send `type`/`action`/`event`
/// spellings instead of `t`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InboundSignal {
    kind: Option<SignalKind>,
    alt_kind: String,
    call_id: Option<String>,
    from: Option<String>,
    channel: Option<String>,
    apartment_number: Option<String>,
    building_name: Option<String>,
}

impl InboundSignal {
    fn parse(text: &str) -> Option<Self> {
        let v: Value = serde_json::from_str(text).ok()?;
        let field = |key: &str| {
            v.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let kind = match v.get("t").and_then(Value::as_str) {
            Some("INVITE") => Some(SignalKind::Invite),
            Some("ANSWER") => Some(SignalKind::Answer),
            Some("END") => Some(SignalKind::End),
            Some("DECLINE") => Some(SignalKind::Decline),
            _ => None,
        };
        let alt_kind = ["type", "action", "event"]
            .into_iter()
            .find_map(|k| field(k))
            .unwrap_or_default()
            .to_lowercase();
        Some(Self {
            kind,
            alt_kind,
            call_id: field("callId"),
            from: field("from"),
            channel: field("channel").or_else(|| field("channelName")),
            apartment_number: field("apartmentNumber"),
            building_name: field("buildingName"),
        })
    }

    fn is_end_like(&self) -> bool {
        matches!(self.kind, Some(SignalKind::End | SignalKind::Decline))
            || matches!(
                self.alt_kind.as_str(),
                "end"
                    | "ended"
                    | "hangup"
                    | "cancel"
                    | "cancelled"
                    | "intercom_call_end"
                    | "call_end"
                    | "end_call"
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCall {
    pub record: ActiveCallRecord,
    pub state: CallState,
    pub credentials: Option<CredentialBundle>,
    pub rtc_joined: bool,
}

impl ActiveCall {
    fn new(record: ActiveCallRecord) -> Self {
        Self {
            record,
            state: CallState::Ringing,
            credentials: None,
            rtc_joined: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    fn participant_ids(&self) -> Vec<String> {
        self.record
            .participants
            .iter()
            .map(|p| p.user_id.clone())
            .filter(|id| !id.is_empty())
            .collect()
    }
}

struct Inner {
    session: RtmSessionManager,
    voice: Arc<VoiceChannelManager>,
    api: Arc<dyn IntercomApi>,
    access_tokens: Arc<dyn AccessTokenSource>,
    store: Arc<dyn KeyValueStore>,
    emitter: Arc<Emitter>,
    warmup_timeout: Duration,
    active: Mutex<Option<ActiveCall>>,
    pushes_in_flight: Mutex<HashSet<String>>,
    listeners: Mutex<Vec<ListenerId>>,
    initialized: AtomicBool,
}

/// Owns the single active call. Cheap to clone.
#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<Inner>,
}

enum Admission {
    Duplicate,
    Busy,
    Admitted,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

impl CallCoordinator {
    pub fn new(
        session: RtmSessionManager,
        voice: Arc<VoiceChannelManager>,
        api: Arc<dyn IntercomApi>,
        access_tokens: Arc<dyn AccessTokenSource>,
        store: Arc<dyn KeyValueStore>,
        warmup_timeout: Duration,
    ) -> Self {
        let emitter = session.emitter().clone();
        Self {
            inner: Arc::new(Inner {
                session,
                voice,
                api,
                access_tokens,
                store,
                emitter,
                warmup_timeout,
                active: Mutex::new(None),
                pushes_in_flight: Mutex::new(HashSet::new()),
                listeners: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub fn active_call(&self) -> Option<ActiveCall> {
        lock(&self.inner.active).clone()
    }

    pub fn has_active_call(&self) -> bool {
        lock(&self.inner.active).is_some()
    }

    pub fn call_state(&self) -> Option<CallState> {
        lock(&self.inner.active).as_ref().map(|c| c.state)
    }

    fn api_base_url(&self) -> String {
        self.inner.session.api_base_url()
    }

    fn current_user_id(&self) -> String {
        self.inner
            .session
            .current_user()
            .map(|u| u.id)
            .unwrap_or_default()
    }

    fn emit(&self, event: IntercomEvent) {
        self.inner.emitter.emit(event);
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Subscribes to peer signals and voice events, then restores a persisted call that is still
    /// live. Calling it again is a no-op.
    pub async fn initialize(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let rt = Handle::current();
        let mut ids = Vec::new();

        let (weak, handle) = (self.downgrade(), rt.clone());
        ids.push(self.inner.emitter.on(EventKind::PeerMessage, move |ev| {
            let IntercomEvent::PeerMessage { peer_id, text } = ev else {
                return;
            };
            let Some(coordinator) = CallCoordinator::upgrade(&weak) else {
                return;
            };
            let (peer_id, text) = (peer_id.clone(), text.clone());
            handle.spawn(async move {
                coordinator.handle_peer_message(&peer_id, &text).await;
            });
        }));

        let weak = self.downgrade();
        ids.push(self.inner.emitter.on(EventKind::VoiceUserJoined, move |_| {
            if let Some(coordinator) = CallCoordinator::upgrade(&weak) {
                coordinator.transition_active(CallState::Connecting, CallState::Connected);
            }
        }));

        let (weak, handle) = (self.downgrade(), rt.clone());
        ids.push(self.inner.emitter.on(EventKind::VoiceUserOffline, move |_| {
            let Some(coordinator) = CallCoordinator::upgrade(&weak) else {
                return;
            };
            if coordinator.call_state() != Some(CallState::Connected) {
                return;
            }
            tracing::info!("remote party left the voice channel");
            handle.spawn(async move {
                if let Err(err) = coordinator.end_active_call(EndReason::Drop).await {
                    tracing::warn!(%err, "failed to end call after remote left");
                }
            });
        }));

        let (weak, handle) = (self.downgrade(), rt);
        ids.push(self.inner.emitter.on(EventKind::VoiceError, move |ev| {
            let IntercomEvent::Voice(VoiceEvent::Error { code, .. }) = ev else {
                return;
            };
            let Some(coordinator) = CallCoordinator::upgrade(&weak) else {
                return;
            };
            // Only a call that has joined voice can fail on a voice error.
            let in_voice = coordinator.active_call().is_some_and(|c| {
                c.rtc_joined || matches!(c.state, CallState::Connecting | CallState::Connected)
            });
            if !in_voice {
                tracing::debug!(code, "voice error outside a joined call");
                return;
            }
            let code = *code;
            handle.spawn(async move {
                coordinator.fail_active_call("rtc", format!("RTC error: {code}")).await;
            });
        }));

        lock(&self.inner.listeners).extend(ids);
        self.recover_persisted_call().await;
    }

    async fn recover_persisted_call(&self) {
        let record = match storage::load_active_call(self.inner.store.as_ref()).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%err, "unreadable persisted call; clearing");
                self.clear_persisted().await;
                return;
            }
        };
        let live = match self
            .inner
            .api
            .call_status(&self.api_base_url(), &record.id)
            .await
        {
            Ok(report) => !report.is_finished(),
            Err(err) => {
                tracing::info!(call_id = %record.id, %err, "persisted call no longer available");
                false
            }
        };
        if !live {
            self.clear_persisted().await;
            return;
        }
        {
            let mut active = lock(&self.inner.active);
            if active.is_some() {
                return;
            }
            *active = Some(ActiveCall::new(record.clone()));
        }
        tracing::info!(call_id = %record.id, "recovered persisted call");
        self.emit(IntercomEvent::CallSessionCreated {
            call: record.clone(),
            recovered: true,
        });

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.prepare_rtm(&record.id).await;
        });
    }

    fn admit(&self, call_id: &str) -> Admission {
        let active = lock(&self.inner.active);
        let mut in_flight = lock(&self.inner.pushes_in_flight);
        if active.as_ref().is_some_and(|c| c.id() == call_id) || in_flight.contains(call_id) {
            return Admission::Duplicate;
        }
        if active.is_some() {
            return Admission::Busy;
        }
        in_flight.insert(call_id.to_string());
        Admission::Admitted
    }

    async fn create_call(&self, push: IncomingCallPush) -> Result<(), IntercomError> {
        let details = match self
            .inner
            .api
            .call_status(&self.api_base_url(), &push.call_id)
            .await
        {
            Ok(details) => details,
            Err(err) => {
                tracing::error!(call_id = %push.call_id, %err, "failed to fetch call details");
                self.emit(IntercomEvent::CallError {
                    call_id: Some(push.call_id.clone()),
                    operation: "handle_incoming_push",
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let call = details.call;
        // The backend's channel and names win; pushes may carry stale values or raw ids.
        let record = ActiveCallRecord {
            channel_name: call
                .channel_name
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| push.channel_name.clone()),
            participants: details.participants,
            is_outgoing: false,
            caller_name: Some(
                call.doorman_name
                    .or(push.caller_name.clone())
                    .unwrap_or_else(|| DEFAULT_CALLER_NAME.to_string()),
            ),
            apartment_number: call.apartment_number.or(push.apartment_number.clone()),
            building_id: call.building_id,
            initiated_at: now_millis(),
            id: push.call_id.clone(),
        };

        *lock(&self.inner.active) = Some(ActiveCall::new(record.clone()));
        if let Err(err) = storage::save_active_call(self.inner.store.as_ref(), &record).await {
            tracing::warn!(%err, call_id = %record.id, "failed to persist active call");
        }
        tracing::info!(
            call_id = %record.id,
            participants = record.participants.len(),
            "call ready to answer"
        );
        self.emit(IntercomEvent::CallSessionCreated {
            call: record.clone(),
            recovered: false,
        });

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.prepare_rtm(&record.id).await;
        });
        Ok(())
    }

    async fn prepare_rtm(&self, call_id: &str) {
        let session = &self.inner.session;
        let ready = if session.status() == RtmStatus::Connected {
            true
        } else {
            session.initialize_standby().await;
            session.wait_until_connected(self.inner.warmup_timeout).await
        };
        let next = if ready {
            CallState::RtmReady
        } else {
            CallState::RtmFailed
        };
        if self.set_state_if(call_id, CallState::Ringing, next) && !ready {
            tracing::warn!(call_id, "messaging warm-up failed");
            self.emit(IntercomEvent::CallError {
                call_id: Some(call_id.to_string()),
                operation: "rtm_warmup",
                message: "RTM warmup failed".into(),
            });
        }
    }

    pub async fn retry_rtm_warmup(&self) {
        let failed = self
            .active_call()
            .filter(|c| c.state == CallState::RtmFailed)
            .map(|c| c.record.id);
        let Some(call_id) = failed else {
            tracing::debug!(state = ?self.call_state(), "ignoring warm-up retry");
            return;
        };
        self.set_state_if(&call_id, CallState::RtmFailed, CallState::Ringing);
        self.prepare_rtm(&call_id).await;
    }

    fn set_state_if(&self, call_id: &str, from: CallState, to: CallState) -> bool {
        let changed = {
            let mut active = lock(&self.inner.active);
            match active.as_mut() {
                Some(call) if call.id() == call_id && call.state == from => {
                    call.state = to;
                    true
                }
                _ => false,
            }
        };
        if changed {
            tracing::info!(call_id, from = %from, to = %to, "call state");
            self.emit(IntercomEvent::CallStateChanged {
                call_id: call_id.to_string(),
                state: to,
            });
        }
        changed
    }

    fn transition_active(&self, from: CallState, to: CallState) -> bool {
        let Some(call_id) = self.active_call().map(|c| c.record.id) else {
            return false;
        };
        self.set_state_if(&call_id, from, to)
    }

    /// Fetches transport credentials and joins the voice channel. Failure ends the call.
    pub async fn answer_active_call(&self) -> Result<(), IntercomError> {
        let call = {
            let mut active = lock(&self.inner.active);
            let call = active.as_mut().ok_or(IntercomError::NoActiveCall)?;
            if !call.state.can_answer() {
                return Err(IntercomError::InvalidCallState {
                    operation: "answer",
                    state: call.state.to_string(),
                });
            }
            call.state = CallState::Answering;
            call.clone()
        };
        let call_id = call.id().to_string();
        self.emit(IntercomEvent::CallStateChanged {
            call_id: call_id.clone(),
            state: CallState::Answering,
        });

        let user_id = self.current_user_id();
        let result = async {
            let access_token = self.inner.access_tokens.access_token().await;
            let bundle = self
                .inner
                .api
                .answer_call(
                    &self.api_base_url(),
                    &call_id,
                    CallParty {
                        user_id: &user_id,
                        role: UserRole::Resident,
                    },
                    access_token.as_deref(),
                )
                .await?;
            self.inner.voice.join_channel_with_user_account(&JoinWithAccount {
                app_id: None,
                token: bundle.rtc_token.clone(),
                channel_name: call.record.channel_name.clone(),
                user_account: bundle.uid.clone(),
            })?;
            Ok::<_, IntercomError>(bundle)
        }
        .await;

        let bundle = match result {
            Ok(bundle) => bundle,
            Err(err) => {
                tracing::error!(call_id = %call_id, %err, "answer failed");
                self.fail_active_call("answer", err.to_string()).await;
                return Err(err);
            }
        };

        {
            let mut active = lock(&self.inner.active);
            if let Some(active) = active.as_mut().filter(|c| c.id() == call_id) {
                active.credentials = Some(bundle);
                active.rtc_joined = true;
            }
        }
        self.set_state_if(&call_id, CallState::Answering, CallState::Connecting);

        let targets = call.participant_ids();
        if targets.is_empty() {
            tracing::warn!(call_id = %call_id, "no participants to notify of answer");
        } else {
            let signal = self.signal(SignalKind::Answer, &call, None);
            if let Err(err) = self.inner.session.send_peer_message(&targets, &signal).await {
                tracing::warn!(call_id = %call_id, %err, "failed to send ANSWER signal");
            }
        }
        tracing::info!(call_id = %call_id, "call answered");
        Ok(())
    }

    /// Ends the active call: best-effort signal to participants, leaves the voice channel,
    /// notifies the backend, clears persistence. No-op without an active call.
    pub async fn end_active_call(&self, reason: EndReason) -> Result<(), IntercomError> {
        let call = {
            let mut active = lock(&self.inner.active);
            let Some(call) = active.as_mut() else {
                return Ok(());
            };
            if call.state == CallState::Ending {
                return Ok(());
            }
            call.state = CallState::Ending;
            call.clone()
        };
        let call_id = call.id().to_string();
        tracing::info!(call_id = %call_id, reason = reason.as_str(), "ending call");
        self.emit(IntercomEvent::CallStateChanged {
            call_id: call_id.clone(),
            state: CallState::Ending,
        });

        // A remote end needs no echo.
        if reason != EndReason::Drop {
            let kind = match reason {
                EndReason::Decline => SignalKind::Decline,
                _ => SignalKind::End,
            };
            let targets = call.participant_ids();
            if !targets.is_empty() {
                let signal = self.signal(kind, &call, None);
                if let Err(err) = self.inner.session.send_peer_message(&targets, &signal).await {
                    tracing::warn!(call_id = %call_id, %err, "failed to send end signal");
                }
            }
        }

        if call.rtc_joined {
            self.inner.voice.leave_channel();
        }

        let user_id = self.current_user_id();
        let party = CallParty {
            user_id: &user_id,
            role: UserRole::Resident,
        };
        let access_token = self.inner.access_tokens.access_token().await;
        let base = self.api_base_url();
        let notified = match reason {
            EndReason::Decline => {
                self.inner
                    .api
                    .decline_call(&base, &call_id, party, reason.as_str(), access_token.as_deref())
                    .await
            }
            EndReason::Hangup | EndReason::Drop => {
                self.inner
                    .api
                    .end_call(&base, &call_id, party, reason.as_str(), access_token.as_deref())
                    .await
            }
        };
        if let Err(err) = notified {
            tracing::warn!(call_id = %call_id, %err, "backend not notified of call end");
        }

        let final_state = match reason {
            EndReason::Decline => CallState::Declined,
            _ => CallState::Ended,
        };
        self.finish_call(&call_id, final_state).await;
        Ok(())
    }

    async fn fail_active_call(&self, operation: &'static str, message: String) {
        let Some(call) = self.active_call() else {
            return;
        };
        let call_id = call.record.id.clone();
        if call.rtc_joined {
            self.inner.voice.leave_channel();
        }
        self.emit(IntercomEvent::CallError {
            call_id: Some(call_id.clone()),
            operation,
            message,
        });
        self.finish_call(&call_id, CallState::Failed).await;
    }

    async fn finish_call(&self, call_id: &str, final_state: CallState) {
        let removed = {
            let mut active = lock(&self.inner.active);
            if active.as_ref().is_some_and(|c| c.id() == call_id) {
                active.take()
            } else {
                None
            }
        };
        if removed.is_none() {
            return;
        }
        self.clear_persisted().await;
        tracing::info!(call_id, final_state = %final_state, "call finished");
        self.emit(IntercomEvent::CallSessionEnded {
            call_id: Some(call_id.to_string()),
            final_state,
        });
    }

    async fn clear_persisted(&self) {
        if let Err(err) = storage::clear_active_call(self.inner.store.as_ref()).await {
            tracing::warn!(%err, "failed to clear persisted call");
        }
    }

    fn signal(&self, kind: SignalKind, call: &ActiveCall, reason: Option<&str>) -> CallSignal {
        CallSignal {
            t: kind,
            call_id: call.record.id.clone(),
            from: self.current_user_id(),
            channel: call.record.channel_name.clone(),
            timestamp: now_millis(),
            reason: reason.map(str::to_string),
        }
    }

    async fn decline_busy(&self, call_id: &str) {
        let user_id = self.current_user_id();
        let access_token = self.inner.access_tokens.access_token().await;
        let result = self
            .inner
            .api
            .decline_call(
                &self.api_base_url(),
                call_id,
                CallParty {
                    user_id: &user_id,
                    role: UserRole::Resident,
                },
                "busy",
                access_token.as_deref(),
            )
            .await;
        if let Err(err) = result {
            tracing::warn!(call_id, %err, "busy decline not delivered");
        }
    }

    /// Handles a raw peer message: remote END/DECLINE for the active call, or an INVITE.
    pub async fn handle_peer_message(&self, peer_id: &str, text: &str) {
        let Some(signal) = InboundSignal::parse(text) else {
            tracing::debug!(peer = peer_id, "ignoring non-json peer message");
            return;
        };
        let active_id = self.active_call().map(|c| c.record.id);

        if signal.is_end_like() {
            if active_id.is_some() && active_id == signal.call_id {
                tracing::info!(peer = peer_id, call_id = ?signal.call_id, "remote ended the call");
                if let Err(err) = self.end_active_call(EndReason::Drop).await {
                    tracing::warn!(%err, "failed to end call after remote signal");
                }
            }
            return;
        }
        if signal.kind != Some(SignalKind::Invite) {
            return;
        }
        let Some(call_id) = signal.call_id.clone() else {
            return;
        };
        let is_resident = self
            .inner
            .session
            .current_user()
            .is_some_and(|u| u.role == UserRole::Resident);
        if !is_resident || active_id.as_deref() == Some(call_id.as_str()) {
            return;
        }

        if active_id.is_some() {
            tracing::info!(call_id = %call_id, "already in a call; declining invite");
            self.decline_busy(&call_id).await;
            let decline = CallSignal {
                t: SignalKind::Decline,
                call_id: call_id.clone(),
                from: self.current_user_id(),
                channel: signal
                    .channel
                    .clone()
                    .unwrap_or_else(|| format!("call-{call_id}")),
                timestamp: now_millis(),
                reason: Some("busy".into()),
            };
            if let Err(err) = self
                .inner
                .session
                .send_peer_message(&[peer_id], &decline)
                .await
            {
                tracing::warn!(%err, peer = peer_id, "failed to send busy DECLINE");
            }
            return;
        }

        let push = IncomingCallPush {
            channel_name: signal
                .channel
                .clone()
                .unwrap_or_else(|| format!("call-{call_id}")),
            call_id,
            from: Some(peer_id.to_string()),
            caller_name: Some(
                signal
                    .from
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CALLER_NAME.to_string()),
            ),
            apartment_number: signal.apartment_number.clone(),
            building_name: signal.building_name.clone(),
            timestamp: now_millis(),
        };
        if let Err(err) = self.handle_incoming_push(push).await {
            tracing::warn!(%err, "invite could not start a call");
        }
    }

    /// Removes listeners and drops the active call locally without notifying anyone.
    pub async fn cleanup(&self) {
        let ids = std::mem::take(&mut *lock(&self.inner.listeners));
        for id in ids {
            self.inner.emitter.off(id);
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        lock(&self.inner.pushes_in_flight).clear();
        let call = lock(&self.inner.active).take();
        if let Some(call) = call {
            if call.rtc_joined {
                self.inner.voice.leave_channel();
            }
            tracing::info!(call_id = %call.record.id, "coordinator cleaned up with active call");
        }
    }
}

#[async_trait]
impl IncomingCallHandler for CallCoordinator {
    async fn handle_incoming_push(&self, push: IncomingCallPush) -> Result<(), IntercomError> {
        tracing::info!(call_id = %push.call_id, "incoming call");
        match self.admit(&push.call_id) {
            Admission::Duplicate => {
                tracing::debug!(call_id = %push.call_id, "duplicate call notification ignored");
                Ok(())
            }
            Admission::Busy => {
                tracing::info!(call_id = %push.call_id, "already in a call; declining");
                self.decline_busy(&push.call_id).await;
                Ok(())
            }
            Admission::Admitted => {
                let call_id = push.call_id.clone();
                let result = self.create_call(push).await;
                lock(&self.inner.pushes_in_flight).remove(&call_id);
                result
            }
        }
    }
}
