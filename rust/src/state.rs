use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtmStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl Display for RtmStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[serde(alias = "porteiro")]
    Doorkeeper,
    #[serde(alias = "morador")]
    Resident,
}

impl UserRole {
    /// Role name the backend expects in request bodies.
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Doorkeeper => "porteiro",
            Self::Resident => "resident",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUserContext {
    pub id: String,
    pub role: UserRole,
    pub display_name: Option<String>,
}

impl CurrentUserContext {
    pub fn resident(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: UserRole::Resident,
            display_name: None,
        }
    }

    pub fn doorkeeper(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: UserRole::Doorkeeper,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingSession {
    pub uid: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Parameters of an explicit messaging login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmLogin {
    pub uid: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<RtmLogin> for SignalingSession {
    fn from(login: RtmLogin) -> Self {
        Self {
            uid: login.uid,
            token: login.token,
            expires_at: login.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandbyBundle {
    #[serde(default)]
    pub app_id: Option<String>,
    pub rtm_token: String,
    pub uid: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl StandbyBundle {
    pub fn login(&self) -> RtmLogin {
        RtmLogin {
            uid: self.uid.clone(),
            token: self.rtm_token.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Transport credentials for one call attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    pub rtc_token: String,
    #[serde(default)]
    pub rtm_token: Option<String>,
    pub uid: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub rtc_role: Option<String>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Durable evidence of a call push that arrived while the app was not in the foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallRecord {
    pub call_id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub apartment_number: Option<String>,
    #[serde(default)]
    pub building_name: Option<String>,
    #[serde(default)]
    pub channel_name: Option<String>,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "channel_name")]
    pub channel_name: Option<String>,
    #[serde(default, alias = "doorman_name")]
    pub doorman_name: Option<String>,
    #[serde(default, alias = "apartment_number")]
    pub apartment_number: Option<String>,
    #[serde(default, alias = "building_id")]
    pub building_id: Option<String>,
    #[serde(default, alias = "ended_at")]
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    #[serde(alias = "user_id")]
    pub user_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "joined_at")]
    pub joined_at: Option<String>,
    #[serde(default, alias = "left_at")]
    pub left_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStatusReport {
    pub call: CallSnapshot,
    pub participants: Vec<CallParticipant>,
}

impl CallStatusReport {
    pub fn status(&self) -> Option<&str> {
        self.call.status.as_deref()
    }

    /// Ringing and calling are the only states a relaunched app may resume.
    pub fn is_resumable(&self) -> bool {
        matches!(self.status(), Some("ringing") | Some("calling"))
    }

    pub fn is_finished(&self) -> bool {
        self.call.ended_at.is_some()
            || matches!(
                self.status(),
                Some("ended" | "declined" | "missed" | "cancelled" | "failed")
            )
    }
}

/// Active call persisted so a crash mid-call can be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCallRecord {
    pub id: String,
    pub channel_name: String,
    #[serde(default)]
    pub participants: Vec<CallParticipant>,
    #[serde(default)]
    pub is_outgoing: bool,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub apartment_number: Option<String>,
    #[serde(default)]
    pub building_id: Option<String>,
    pub initiated_at: i64,
}

/// Lifecycle of the coordinator's active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    RtmReady,
    RtmFailed,
    Answering,
    Connecting,
    Connected,
    Ending,
    Ended,
    Declined,
    Failed,
}

impl CallState {
    pub fn can_answer(self) -> bool {
        matches!(self, Self::Ringing | Self::RtmReady)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Failed)
    }
}

impl Display for CallState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ringing => "ringing",
            Self::RtmReady => "rtm_ready",
            Self::RtmFailed => "rtm_failed",
            Self::Answering => "answering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    Decline,
    /// The remote side ended the call.
    Drop,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hangup => "hangup",
            Self::Decline => "declined",
            Self::Drop => "drop",
        }
    }
}
