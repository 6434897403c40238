use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::state::RtmStatus;

/// Native error codes the network uses for "peer offline, message cached for later delivery".
pub const PEER_CACHED_OFFLINE_CODES: [i32; 2] = [3, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Aborted,
}

impl EngineConnectionState {
    /// Anything other than connected/connecting counts as disconnected.
    pub fn status(self) -> RtmStatus {
        match self {
            Self::Connected => RtmStatus::Connected,
            Self::Connecting => RtmStatus::Connecting,
            Self::Disconnected | Self::Reconnecting | Self::Aborted => RtmStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingEngineEvent {
    ConnectionStateChanged {
        state: EngineConnectionState,
        reason: i32,
    },
    MessageReceived {
        peer_id: String,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSendOptions {
    pub enable_offline_messaging: bool,
    pub enable_historical_messaging: bool,
}

impl PeerSendOptions {
    pub fn durable() -> Self {
        Self {
            enable_offline_messaging: true,
            enable_historical_messaging: true,
        }
    }
}

/// Login/logout/send surface of the peer-messaging network.
#[async_trait]
pub trait MessagingEngine: Send + Sync {
    async fn login(&self, uid: &str, token: &str) -> Result<(), EngineError>;
    async fn logout(&self) -> Result<(), EngineError>;
    async fn send_message_to_peer(
        &self,
        peer_id: &str,
        text: &str,
        options: PeerSendOptions,
    ) -> Result<(), EngineError>;
    fn destroy(&self);
}

pub trait MessagingEngineFactory: Send + Sync {
    /// Creates an engine for `app_id` together with the stream of its callbacks.
    fn create(
        &self,
        app_id: &str,
    ) -> Result<(Arc<dyn MessagingEngine>, flume::Receiver<MessagingEngineEvent>), EngineError>;
}

pub(crate) fn is_cached_offline(err: &EngineError) -> bool {
    err.code
        .is_some_and(|code| PEER_CACHED_OFFLINE_CODES.contains(&code))
}
