#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelProfile {
    Communication,
    LiveBroadcasting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Broadcaster,
    Audience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioProfile {
    Default,
    SpeechStandard,
    MusicStandard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioScenario {
    Default,
    ChatRoom,
}

/// Per-join media options. Intercom calls are audio only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMediaOptions {
    pub auto_subscribe_audio: bool,
    pub auto_subscribe_video: bool,
    pub publish_camera_track: bool,
    pub publish_microphone_track: bool,
}

impl ChannelMediaOptions {
    pub fn intercom_audio() -> Self {
        Self {
            auto_subscribe_audio: true,
            auto_subscribe_video: false,
            publish_camera_track: false,
            publish_microphone_track: true,
        }
    }
}
