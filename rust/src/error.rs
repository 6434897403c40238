use porteiro_media::VoiceError;

use crate::state::RtmStatus;

/// Failure reported by the messaging engine. `code` carries the network's native error code when one exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub code: Option<i32>,
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("api rejected request: {message}")]
    Rejected { message: String },
    #[error("unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidUrl(#[from] porteiro_endpoints::EndpointError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored record is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum IntercomError {
    #[error("messaging app id is not configured")]
    MissingAppId,
    #[error("messaging engine not initialized")]
    EngineNotInitialized,
    #[error("messaging session was torn down during login")]
    SessionClosed,
    #[error("messaging session is {0}, not connected")]
    NotConnected(RtmStatus),
    #[error("messaging engine: {0}")]
    Engine(#[from] EngineError),
    #[error("failed to deliver message to {peer}: {source}")]
    PeerSend {
        peer: String,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error("payload could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no active call")]
    NoActiveCall,
    #[error("cannot {operation} while call is {state}")]
    InvalidCallState {
        operation: &'static str,
        state: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}
