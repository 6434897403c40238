// Cold-start recovery of a call that was ringing when the process died.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::api::IntercomApi;
use super::push::IncomingCallPush;
use super::storage::{self, KeyValueStore};
use crate::error::IntercomError;

/// The OS record of the notification the user last tapped, if any.
#[async_trait]
pub trait NotificationResponseSource: Send + Sync {
    async fn last_notification_response(&self) -> Option<Value>;
}

/// Receives incoming calls. Implemented by the call coordinator.
#[async_trait]
pub trait IncomingCallHandler: Send + Sync {
    async fn handle_incoming_push(&self, push: IncomingCallPush) -> Result<(), IntercomError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    ResumedFromNotification { call_id: String },
    ResumedFromPendingRecord { call_id: String },
    NothingToResume,
}

pub struct StartupRecovery {
    api: Arc<dyn IntercomApi>,
    api_base_url: String,
    notifications: Arc<dyn NotificationResponseSource>,
    store: Arc<dyn KeyValueStore>,
    handler: Arc<dyn IncomingCallHandler>,
}

impl StartupRecovery {
    pub fn new(
        api: Arc<dyn IntercomApi>,
        api_base_url: impl Into<String>,
        notifications: Arc<dyn NotificationResponseSource>,
        store: Arc<dyn KeyValueStore>,
        handler: Arc<dyn IncomingCallHandler>,
    ) -> Self {
        Self {
            api,
            api_base_url: api_base_url.into(),
            notifications,
            store,
            handler,
        }
    }

    /// Runs both checks in order; the first live call wins. The pending record is consumed
    /// whatever the outcome.
    pub async fn run(&self) -> RecoveryOutcome {
        let outcome = match self.check_notification_response().await {
            Some(call_id) => RecoveryOutcome::ResumedFromNotification { call_id },
            None => match self.check_pending_record().await {
                Some(call_id) => RecoveryOutcome::ResumedFromPendingRecord { call_id },
                None => RecoveryOutcome::NothingToResume,
            },
        };
        if let Err(err) = storage::clear_pending_call(self.store.as_ref()).await {
            tracing::warn!(%err, "recovery: failed to clear pending call record");
        }
        tracing::info!(?outcome, "startup recovery finished");
        outcome
    }

    async fn check_notification_response(&self) -> Option<String> {
        let response = self.notifications.last_notification_response().await?;
        let push = IncomingCallPush::from_payload(&response)?;
        tracing::info!(call_id = %push.call_id, "recovery: call found in last notification response");
        self.resume_if_live(push).await
    }

    async fn check_pending_record(&self) -> Option<String> {
        let record = match storage::load_pending_call(self.store.as_ref()).await {
            Ok(record) => record?,
            Err(err) => {
                tracing::warn!(%err, "recovery: unreadable pending call record");
                return None;
            }
        };
        tracing::info!(call_id = %record.call_id, "recovery: pending call record found");
        self.resume_if_live(IncomingCallPush::from_pending_record(record))
            .await
    }

    async fn resume_if_live(&self, mut push: IncomingCallPush) -> Option<String> {
        if !self.is_live(&push.call_id).await {
            return None;
        }
        push.timestamp = crate::state::now_millis();
        let call_id = push.call_id.clone();
        if let Err(err) = self.handler.handle_incoming_push(push).await {
            tracing::warn!(%err, call_id = %call_id, "recovery: hand-off failed");
        }
        Some(call_id)
    }

    /// Status lookup failures count as not live.
    async fn is_live(&self, call_id: &str) -> bool {
        match self.api.call_status(&self.api_base_url, call_id).await {
            Ok(report) => {
                let live = report.is_resumable();
                tracing::info!(call_id, status = report.status().unwrap_or("unknown"), live, "recovery: call status");
                live
            }
            Err(err) => {
                tracing::warn!(call_id, %err, "recovery: call status lookup failed");
                false
            }
        }
    }
}
