use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::options::{AudioProfile, AudioScenario, ChannelMediaOptions, ChannelProfile, ClientRole};

/// Remote participants join either with a numeric uid or with a named account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteUid {
    Numeric(u32),
    Account(String),
}

impl Display for RemoteUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(uid) => write!(f, "{uid}"),
            Self::Account(account) => f.write_str(account),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    JoinSuccess { channel_id: String },
    Leave { channel_id: Option<String> },
    UserJoined { remote_uid: RemoteUid },
    UserOffline { remote_uid: RemoteUid, reason: i32 },
    Error { code: i32, message: Option<String> },
    TokenPrivilegeWillExpire,
    RequestToken,
    AudioRoutingChanged { routing: i32 },
}

pub type VoiceEventSink = Arc<dyn Fn(VoiceEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("voice app id is not configured")]
    MissingAppId,
    #[error("voice engine failed to initialize (code {0})")]
    EngineInit(i32),
    #[error("failed to register local user account (code {0})")]
    AccountRegistration(i32),
    #[error("failed to join voice channel (code {0})")]
    Join(i32),
    #[error("failed to toggle speakerphone (code {0})")]
    Speakerphone(i32),
    #[error("failed to toggle microphone (code {0})")]
    Mute(i32),
}

/// Low-level voice engine. Calls return the engine's native result code, `0` meaning success.
pub trait VoiceEngine: Send + Sync {
    fn initialize(&self, app_id: &str) -> i32;
    fn set_channel_profile(&self, profile: ChannelProfile) -> i32;
    fn set_client_role(&self, role: ClientRole) -> i32;
    fn set_audio_profile(&self, profile: AudioProfile, scenario: AudioScenario) -> i32;
    fn enable_audio(&self) -> i32;
    fn set_default_audio_route_to_speakerphone(&self, on: bool) -> i32;
    fn register_local_user_account(&self, app_id: &str, user_account: &str) -> i32;
    fn join_channel_with_user_account(
        &self,
        token: &str,
        channel_name: &str,
        user_account: &str,
        options: &ChannelMediaOptions,
    ) -> i32;
    fn join_channel(
        &self,
        token: &str,
        channel_name: &str,
        uid: u32,
        options: &ChannelMediaOptions,
    ) -> i32;
    fn leave_channel(&self) -> i32;
    fn renew_token(&self, token: &str) -> i32;
    fn mute_local_audio_stream(&self, muted: bool) -> i32;
    fn release(&self);
}

pub trait VoiceEngineFactory: Send + Sync {
    /// Creates an engine that reports its callbacks through `events`.
    fn create(&self, events: VoiceEventSink) -> Arc<dyn VoiceEngine>;
}
