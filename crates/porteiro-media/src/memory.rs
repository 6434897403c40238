//! In-process voice engine that records every call. Used by tests and by hosts without a native SDK.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::{VoiceEngine, VoiceEngineFactory, VoiceEvent, VoiceEventSink};
use crate::options::{AudioProfile, AudioScenario, ChannelMediaOptions, ChannelProfile, ClientRole};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceCall {
    Initialize { app_id: String },
    SetChannelProfile(ChannelProfile),
    SetClientRole(ClientRole),
    SetAudioProfile(AudioProfile, AudioScenario),
    EnableAudio,
    SetSpeakerphone(bool),
    RegisterAccount { app_id: String, user_account: String },
    JoinWithAccount {
        token: String,
        channel_name: String,
        user_account: String,
        options: ChannelMediaOptions,
    },
    JoinWithUid {
        token: String,
        channel_name: String,
        uid: u32,
        options: ChannelMediaOptions,
    },
    Leave,
    RenewToken(String),
    Mute(bool),
    Release,
}

/// Operations whose result code can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceOp {
    Initialize,
    RegisterAccount,
    Join,
    Leave,
    RenewToken,
    Speakerphone,
    Mute,
}

pub struct RecordingVoiceEngine {
    calls: Mutex<Vec<VoiceCall>>,
    codes: Mutex<HashMap<VoiceOp, i32>>,
    sink: Mutex<Option<VoiceEventSink>>,
    channel: Mutex<Option<String>>,
    confirm_joins: AtomicBool,
}

impl Default for RecordingVoiceEngine {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            codes: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            channel: Mutex::new(None),
            confirm_joins: AtomicBool::new(true),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

impl RecordingVoiceEngine {
    pub fn calls(&self) -> Vec<VoiceCall> {
        lock(&self.calls).clone()
    }

    pub fn set_code(&self, op: VoiceOp, code: i32) {
        lock(&self.codes).insert(op, code);
    }

    /// When enabled (the default) a successful join is followed by `JoinSuccess`.
    pub fn set_confirm_joins(&self, on: bool) {
        self.confirm_joins.store(on, Ordering::SeqCst);
    }

    pub fn current_channel(&self) -> Option<String> {
        lock(&self.channel).clone()
    }

    /// Delivers an engine callback as if the native SDK raised it.
    pub fn emit(&self, event: VoiceEvent) {
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    fn attach(&self, sink: VoiceEventSink) {
        *lock(&self.sink) = Some(sink);
    }

    fn record(&self, call: VoiceCall) {
        lock(&self.calls).push(call);
    }

    fn code(&self, op: VoiceOp) -> i32 {
        lock(&self.codes).get(&op).copied().unwrap_or(0)
    }

    fn joined(&self, channel_name: &str) {
        *lock(&self.channel) = Some(channel_name.to_string());
        if self.confirm_joins.load(Ordering::SeqCst) {
            self.emit(VoiceEvent::JoinSuccess {
                channel_id: channel_name.to_string(),
            });
        }
    }
}

impl VoiceEngine for RecordingVoiceEngine {
    fn initialize(&self, app_id: &str) -> i32 {
        self.record(VoiceCall::Initialize {
            app_id: app_id.to_string(),
        });
        self.code(VoiceOp::Initialize)
    }

    fn set_channel_profile(&self, profile: ChannelProfile) -> i32 {
        self.record(VoiceCall::SetChannelProfile(profile));
        0
    }

    fn set_client_role(&self, role: ClientRole) -> i32 {
        self.record(VoiceCall::SetClientRole(role));
        0
    }

    fn set_audio_profile(&self, profile: AudioProfile, scenario: AudioScenario) -> i32 {
        self.record(VoiceCall::SetAudioProfile(profile, scenario));
        0
    }

    fn enable_audio(&self) -> i32 {
        self.record(VoiceCall::EnableAudio);
        0
    }

    fn set_default_audio_route_to_speakerphone(&self, on: bool) -> i32 {
        self.record(VoiceCall::SetSpeakerphone(on));
        self.code(VoiceOp::Speakerphone)
    }

    fn register_local_user_account(&self, app_id: &str, user_account: &str) -> i32 {
        self.record(VoiceCall::RegisterAccount {
            app_id: app_id.to_string(),
            user_account: user_account.to_string(),
        });
        self.code(VoiceOp::RegisterAccount)
    }

    fn join_channel_with_user_account(
        &self,
        token: &str,
        channel_name: &str,
        user_account: &str,
        options: &ChannelMediaOptions,
    ) -> i32 {
        self.record(VoiceCall::JoinWithAccount {
            token: token.to_string(),
            channel_name: channel_name.to_string(),
            user_account: user_account.to_string(),
            options: *options,
        });
        let code = self.code(VoiceOp::Join);
        if code == 0 {
            self.joined(channel_name);
        }
        code
    }

    fn join_channel(
        &self,
        token: &str,
        channel_name: &str,
        uid: u32,
        options: &ChannelMediaOptions,
    ) -> i32 {
        self.record(VoiceCall::JoinWithUid {
            token: token.to_string(),
            channel_name: channel_name.to_string(),
            uid,
            options: *options,
        });
        let code = self.code(VoiceOp::Join);
        if code == 0 {
            self.joined(channel_name);
        }
        code
    }

    fn leave_channel(&self) -> i32 {
        self.record(VoiceCall::Leave);
        let code = self.code(VoiceOp::Leave);
        if code == 0 {
            let channel_id = lock(&self.channel).take();
            self.emit(VoiceEvent::Leave { channel_id });
        }
        code
    }

    fn renew_token(&self, token: &str) -> i32 {
        self.record(VoiceCall::RenewToken(token.to_string()));
        self.code(VoiceOp::RenewToken)
    }

    fn mute_local_audio_stream(&self, muted: bool) -> i32 {
        self.record(VoiceCall::Mute(muted));
        self.code(VoiceOp::Mute)
    }

    fn release(&self) {
        self.record(VoiceCall::Release);
        *lock(&self.channel) = None;
    }
}

/// Hands out one shared [`RecordingVoiceEngine`] so tests can inspect it after the manager created it.
#[derive(Clone, Default)]
pub struct RecordingVoiceEngineFactory {
    engine: Arc<RecordingVoiceEngine>,
    created: Arc<AtomicUsize>,
}

impl RecordingVoiceEngineFactory {
    pub fn engine(&self) -> Arc<RecordingVoiceEngine> {
        self.engine.clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl VoiceEngineFactory for RecordingVoiceEngineFactory {
    fn create(&self, events: VoiceEventSink) -> Arc<dyn VoiceEngine> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.engine.attach(events);
        self.engine.clone()
    }
}
