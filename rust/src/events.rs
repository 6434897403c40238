//! Process-wide event surface shared by the messaging session, the voice channel and the call coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use porteiro_media::{RemoteUid, VoiceEvent};

use crate::state::{ActiveCallRecord, CallState, RtmStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum IntercomEvent {
    Status(RtmStatus),
    PeerMessage {
        peer_id: String,
        text: String,
    },
    Error {
        message: String,
        cause: Option<String>,
    },
    ConnectionAttempt {
        uid: String,
        at: DateTime<Utc>,
    },
    ConnectionSuccess {
        uid: String,
        duration: Duration,
    },
    ConnectionFailure {
        uid: String,
        error: String,
        duration: Duration,
    },
    Voice(VoiceEvent),
    CallSessionCreated {
        call: ActiveCallRecord,
        recovered: bool,
    },
    CallSessionEnded {
        call_id: Option<String>,
        final_state: CallState,
    },
    CallStateChanged {
        call_id: String,
        state: CallState,
    },
    CallError {
        call_id: Option<String>,
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    PeerMessage,
    Error,
    ConnectionAttempt,
    ConnectionSuccess,
    ConnectionFailure,
    VoiceJoinSuccess,
    VoiceLeave,
    VoiceUserJoined,
    VoiceUserOffline,
    VoiceError,
    VoiceTokenWillExpire,
    VoiceRequestToken,
    VoiceAudioRouting,
    CallSessionCreated,
    CallSessionEnded,
    CallStateChanged,
    CallError,
}

impl IntercomEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Status(_) => EventKind::Status,
            Self::PeerMessage { .. } => EventKind::PeerMessage,
            Self::Error { .. } => EventKind::Error,
            Self::ConnectionAttempt { .. } => EventKind::ConnectionAttempt,
            Self::ConnectionSuccess { .. } => EventKind::ConnectionSuccess,
            Self::ConnectionFailure { .. } => EventKind::ConnectionFailure,
            Self::Voice(ev) => match ev {
                VoiceEvent::JoinSuccess { .. } => EventKind::VoiceJoinSuccess,
                VoiceEvent::Leave { .. } => EventKind::VoiceLeave,
                VoiceEvent::UserJoined { .. } => EventKind::VoiceUserJoined,
                VoiceEvent::UserOffline { .. } => EventKind::VoiceUserOffline,
                VoiceEvent::Error { .. } => EventKind::VoiceError,
                VoiceEvent::TokenPrivilegeWillExpire => EventKind::VoiceTokenWillExpire,
                VoiceEvent::RequestToken => EventKind::VoiceRequestToken,
                VoiceEvent::AudioRoutingChanged { .. } => EventKind::VoiceAudioRouting,
            },
            Self::CallSessionCreated { .. } => EventKind::CallSessionCreated,
            Self::CallSessionEnded { .. } => EventKind::CallSessionEnded,
            Self::CallStateChanged { .. } => EventKind::CallStateChanged,
            Self::CallError { .. } => EventKind::CallError,
        }
    }

    pub fn error(message: impl Into<String>, cause: Option<&dyn std::fmt::Display>) -> Self {
        Self::Error {
            message: message.into(),
            cause: cause.map(|c| c.to_string()),
        }
    }

    pub fn remote_uid(&self) -> Option<&RemoteUid> {
        match self {
            Self::Voice(VoiceEvent::UserJoined { remote_uid })
            | Self::Voice(VoiceEvent::UserOffline { remote_uid, .. }) => Some(remote_uid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&IntercomEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
pub struct Emitter {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.lock().len())
            .finish()
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        match self.listeners.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&IntercomEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Returns false when the listener was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().iter().filter(|l| l.kind == kind).count()
    }

    pub fn emit(&self, event: IntercomEvent) {
        let kind = event.kind();
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<Handler> = self
            .lock()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.handler.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }
}
