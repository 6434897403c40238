// Renewal and reconnect scheduling for the messaging session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::RtmSessionManager;
use crate::error::IntercomError;
use crate::events::IntercomEvent;
use crate::state::RtmStatus;

/// A cancellable timer owned by the session manager. The task only clears the slot that
/// still carries its own id.
pub(super) struct ScheduledTask {
    pub(super) id: u64,
    pub(super) handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub(super) fn cancel(self) {
        self.handle.abort();
    }

    fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingTimers {
    pub renewal: bool,
    pub reconnect: bool,
}

impl PendingTimers {
    pub fn any(self) -> bool {
        self.renewal || self.reconnect
    }
}

/// `base * 2^attempt`, saturating.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Time until the renewal should fire: `buffer` before expiry, zero if that moment has passed.
pub fn renewal_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>, buffer: Duration) -> Duration {
    let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
    (expires_at - buffer - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

impl RtmSessionManager {
    pub fn pending_timers(&self) -> PendingTimers {
        let st = self.lock_state();
        PendingTimers {
            renewal: st.renewal.as_ref().is_some_and(ScheduledTask::is_pending),
            reconnect: st.reconnect.as_ref().is_some_and(ScheduledTask::is_pending),
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock_state().reconnect_attempts
    }

    /// Replaces any scheduled renewal. `None`, or no live session, only cancels.
    pub(super) fn schedule_standby_renewal(&self, expires_at: Option<DateTime<Utc>>) {
        let mut st = self.lock_state();
        if let Some(prev) = st.renewal.take() {
            prev.cancel();
        }
        let Some(expires_at) = expires_at else {
            return;
        };
        if st.session.is_none() {
            tracing::debug!("standby renewal not scheduled: no session");
            return;
        }
        let delay = renewal_delay(expires_at, Utc::now(), self.shared.timings.renewal_buffer);
        let id = self.next_task_id();
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = RtmSessionManager::upgrade(&weak) {
                manager.run_renewal(id).await;
            }
        });
        tracing::info!(delay_ms = delay.as_millis() as u64, "standby renewal scheduled");
        st.renewal = Some(ScheduledTask { id, handle });
    }

    fn release_renewal_slot(&self, id: u64) {
        let mut st = self.lock_state();
        if st.renewal.as_ref().is_some_and(|t| t.id == id) {
            st.renewal = None;
        }
    }

    async fn run_renewal(&self, id: u64) {
        // Drop our own slot first so rescheduling does not abort this task.
        self.release_renewal_slot(id);
        let Some(user) = self.current_user() else {
            tracing::debug!("standby renewal skipped: no current user");
            return;
        };
        tracing::info!(user_id = %user.id, "renewing standby credentials");

        let epoch = self.epoch();
        let result = async {
            let access_token = self.shared.access_tokens.access_token().await;
            let bundle = self
                .shared
                .api
                .standby_bundle(&self.api_base_url(), &user.id, access_token.as_deref())
                .await?;
            if self.epoch() != epoch {
                return Err(IntercomError::SessionClosed);
            }
            let engine = self.ensure_engine()?;
            let mut states = self.shared.engine_states.subscribe();
            self.lock_state().relogin_in_progress = true;
            if let Err(err) = engine.logout().await {
                tracing::debug!(%err, "logout before renewal failed");
            }
            engine.login(&bundle.uid, &bundle.rtm_token).await?;
            // The logout's own drop arrives through the pump ahead of the new connection.
            if !self.await_engine_connected(&mut states).await {
                tracing::warn!(uid = %bundle.uid, "renewed login not confirmed before timeout");
            }
            Ok::<_, IntercomError>(bundle)
        }
        .await;

        if !self.end_relogin(epoch) {
            tracing::debug!("standby renewal abandoned after cleanup");
            return;
        }
        match result {
            Ok(bundle) => {
                let login = bundle.login();
                let expires_at = login.expires_at;
                self.lock_state().session = Some(login.into());
                self.set_status(RtmStatus::Connected);
                self.schedule_standby_renewal(expires_at);
            }
            Err(err) => {
                tracing::warn!(%err, "standby renewal failed");
                self.emit(IntercomEvent::error(
                    "Failed to renew RTM standby token",
                    Some(&err),
                ));
            }
        }
    }

    /// Schedules the next reconnect attempt unless one is already pending. Gives up with a
    /// single error event once the attempt budget is spent.
    pub(super) fn schedule_reconnect(&self) {
        let exhausted = {
            let mut st = self.lock_state();
            if st.session.is_none() || st.reconnect.is_some() {
                return;
            }
            if st.reconnect_attempts >= self.shared.timings.reconnect_max_attempts {
                st.reconnect_attempts = 0;
                true
            } else {
                let attempt = st.reconnect_attempts;
                let delay = reconnect_delay(self.shared.timings.reconnect_base_delay, attempt);
                st.reconnect_attempts += 1;
                let id = self.next_task_id();
                let weak = self.downgrade();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(manager) = RtmSessionManager::upgrade(&weak) {
                        manager.run_reconnect(id).await;
                    }
                });
                tracing::info!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "messaging reconnect scheduled"
                );
                st.reconnect = Some(ScheduledTask { id, handle });
                false
            }
        };
        if exhausted {
            tracing::error!("messaging reconnect attempts exhausted");
            self.emit(IntercomEvent::Error {
                message: "RTM reconnection failed".into(),
                cause: Some("max-retries".into()),
            });
        }
    }

    fn release_reconnect_slot(&self, id: u64) -> bool {
        let mut st = self.lock_state();
        if st.reconnect.as_ref().is_some_and(|t| t.id == id) {
            st.reconnect = None;
            return true;
        }
        false
    }

    async fn run_reconnect(&self, id: u64) {
        let Some(session) = self.session() else {
            self.release_reconnect_slot(id);
            return;
        };
        let result = match self.ensure_engine() {
            Ok(engine) => engine
                .login(&session.uid, &session.token)
                .await
                .map_err(IntercomError::from),
            Err(err) => Err(err),
        };
        if !self.release_reconnect_slot(id) {
            // Cancelled or superseded while the login was in flight.
            return;
        }
        match result {
            Ok(()) => {
                self.lock_state().reconnect_attempts = 0;
                self.set_status(RtmStatus::Connected);
                tracing::info!(uid = %session.uid, "messaging reconnected");
            }
            Err(err) => {
                tracing::warn!(%err, attempts = self.reconnect_attempts(), "messaging reconnect failed");
                self.schedule_reconnect();
            }
        }
    }

    pub(super) fn cancel_timers(&self) {
        let (renewal, reconnect) = {
            let mut st = self.lock_state();
            (st.renewal.take(), st.reconnect.take())
        };
        if let Some(task) = renewal {
            task.cancel();
        }
        if let Some(task) = reconnect {
            task.cancel();
        }
    }
}
