pub mod engine;
pub mod manager;
pub mod memory;
pub mod options;

pub use engine::{RemoteUid, VoiceEngine, VoiceEngineFactory, VoiceError, VoiceEvent, VoiceEventSink};
pub use manager::{JoinWithAccount, JoinWithUid, VoiceChannelManager};
pub use memory::{RecordingVoiceEngine, RecordingVoiceEngineFactory, VoiceCall};
pub use options::ChannelMediaOptions;
