use std::sync::Arc;

use porteiro_media::{VoiceChannelManager, VoiceEngineFactory, VoiceEvent, VoiceEventSink};

use crate::events::{Emitter, IntercomEvent};

/// Re-emits voice engine callbacks on the shared emitter, so signaling and voice share one
/// subscription surface.
pub fn voice_event_sink(emitter: Arc<Emitter>) -> VoiceEventSink {
    Arc::new(move |event: VoiceEvent| {
        match &event {
            VoiceEvent::Error { code, message } => {
                tracing::warn!(code, message = message.as_deref().unwrap_or(""), "voice engine error");
            }
            VoiceEvent::UserOffline { remote_uid, reason } => {
                tracing::info!(%remote_uid, reason, "voice peer left");
            }
            other => tracing::debug!(event = ?other, "voice event"),
        }
        emitter.emit(IntercomEvent::Voice(event));
    })
}

pub fn voice_channel_manager(
    app_id: &str,
    factory: Arc<dyn VoiceEngineFactory>,
    emitter: Arc<Emitter>,
) -> VoiceChannelManager {
    VoiceChannelManager::new(app_id.to_string(), factory, voice_event_sink(emitter))
}
