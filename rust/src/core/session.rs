// Login, standby warm-up, peer messaging and teardown of the messaging session.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use super::engine::{is_cached_offline, EngineConnectionState, PeerSendOptions};
use super::RtmSessionManager;
use crate::error::IntercomError;
use crate::events::IntercomEvent;
use crate::state::{RtmLogin, RtmStatus, UserRole};

impl RtmSessionManager {
    /// Logs in, replacing any previous session. Resolves once the engine reports connected, or
    /// after the confirm timeout elapses without a report.
    pub async fn login_rtm(&self, login: RtmLogin) -> Result<(), IntercomError> {
        let started = Instant::now();
        self.emit(IntercomEvent::ConnectionAttempt {
            uid: login.uid.clone(),
            at: Utc::now(),
        });

        let engine = match self.ensure_engine() {
            Ok(engine) => engine,
            Err(err) => {
                self.emit(IntercomEvent::ConnectionFailure {
                    uid: login.uid.clone(),
                    error: err.to_string(),
                    duration: started.elapsed(),
                });
                return Err(err);
            }
        };

        // Subscribe before logging in so the confirmation cannot be missed.
        let mut states = self.shared.engine_states.subscribe();
        let (had_session, epoch) = {
            let mut st = self.lock_state();
            st.relogin_in_progress = true;
            (st.session.is_some(), st.epoch)
        };
        self.set_status(RtmStatus::Connecting);

        if had_session {
            if let Err(err) = engine.logout().await {
                tracing::debug!(%err, "logout of previous session failed");
            }
        }

        tracing::info!(uid = %login.uid, "messaging login");
        if let Err(err) = engine.login(&login.uid, &login.token).await {
            if self.end_relogin(epoch) {
                self.set_status(RtmStatus::Disconnected);
            }
            tracing::warn!(uid = %login.uid, %err, "messaging login failed");
            self.emit(IntercomEvent::ConnectionFailure {
                uid: login.uid.clone(),
                error: err.to_string(),
                duration: started.elapsed(),
            });
            return Err(err.into());
        }
        let expires_at = login.expires_at;
        let uid = login.uid.clone();
        {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                tracing::info!(uid = %uid, "messaging login superseded by cleanup");
                return Err(IntercomError::SessionClosed);
            }
            st.session = Some(login.into());
        }

        let confirmed = self.await_engine_connected(&mut states).await;
        if !confirmed {
            tracing::warn!(uid = %uid, "no connection confirmation before timeout; proceeding");
        }
        self.end_relogin(epoch);

        tokio::time::sleep(self.shared.timings.login_settle).await;

        let pending_reconnect = {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                tracing::info!(uid = %uid, "messaging login superseded by cleanup");
                return Err(IntercomError::SessionClosed);
            }
            st.reconnect_attempts = 0;
            st.reconnect.take()
        };
        if let Some(task) = pending_reconnect {
            task.cancel();
        }
        self.set_status(RtmStatus::Connected);
        let duration = started.elapsed();
        tracing::info!(uid = %uid, duration_ms = duration.as_millis() as u64, "messaging login complete");
        self.emit(IntercomEvent::ConnectionSuccess { uid, duration });

        self.schedule_standby_renewal(expires_at);
        Ok(())
    }

    /// Waits up to the login confirm timeout for the engine to report `Connected`.
    pub(super) async fn await_engine_connected(
        &self,
        states: &mut broadcast::Receiver<EngineConnectionState>,
    ) -> bool {
        tokio::time::timeout(self.shared.timings.login_confirm_timeout, async {
            loop {
                match states.recv().await {
                    Ok(EngineConnectionState::Connected) => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return false,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Clears the relogin flag unless a cleanup ran since `epoch`. Returns whether the session
    /// is still the one the caller started with.
    pub(super) fn end_relogin(&self, epoch: u64) -> bool {
        let mut st = self.lock_state();
        if st.epoch != epoch {
            return false;
        }
        st.relogin_in_progress = false;
        true
    }

    /// Best-effort standby login for residents. Never returns an error; failures become
    /// `Error` events.
    pub async fn initialize_standby(&self) {
        let user = {
            let mut st = self.lock_state();
            let Some(user) = st.current_user.clone() else {
                tracing::debug!("standby skipped: no current user");
                return;
            };
            if user.role != UserRole::Resident {
                return;
            }
            let status = self.status();
            if matches!(status, RtmStatus::Connected | RtmStatus::Connecting)
                || st.session.is_some()
                || st.standby_initialized_users.contains(&user.id)
                || st.standby_in_progress
            {
                tracing::debug!(user_id = %user.id, %status, "standby skipped");
                return;
            }
            st.standby_in_progress = true;
            user
        };

        let result = async {
            let access_token = self.shared.access_tokens.access_token().await;
            let bundle = self
                .shared
                .api
                .standby_bundle(&self.api_base_url(), &user.id, access_token.as_deref())
                .await?;
            if let Some(app_id) = bundle.app_id.as_deref() {
                self.configure(Some(app_id), None);
            }
            self.login_rtm(bundle.login()).await
        }
        .await;

        let mut st = self.lock_state();
        st.standby_in_progress = false;
        match result {
            Ok(()) => {
                st.standby_initialized_users.insert(user.id.clone());
                tracing::info!(user_id = %user.id, "standby session ready");
            }
            Err(IntercomError::SessionClosed) => {
                tracing::debug!(user_id = %user.id, "standby initialization abandoned after cleanup");
            }
            Err(err) => {
                drop(st);
                tracing::warn!(user_id = %user.id, %err, "standby initialization failed");
                self.emit(IntercomEvent::error("Failed to initialize RTM standby", Some(&err)));
            }
        }
    }

    /// Sends `payload` as JSON to each distinct target in order. The first hard failure aborts
    /// the remaining targets. Peers the network reports as offline (message cached) are skipped
    /// on later sends for a while.
    pub async fn send_peer_message<T, S>(&self, targets: &[S], payload: &T) -> Result<(), IntercomError>
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let Some(engine) = self.lock_state().engine.clone() else {
            return Err(IntercomError::EngineNotInitialized);
        };
        let status = self.status();
        if status != RtmStatus::Connected {
            return Err(IntercomError::NotConnected(status));
        }
        let text = serde_json::to_string(payload)?;

        let now = Instant::now();
        let ttl = self.shared.timings.pruned_peer_ttl;
        let unique: Vec<String> = {
            let mut st = self.lock_state();
            st.pruned_peers
                .retain(|_, pruned_at| now.duration_since(*pruned_at) <= ttl);
            let mut seen = HashSet::new();
            targets
                .iter()
                .map(|t| t.as_ref())
                .filter(|t| !t.is_empty())
                .filter(|t| seen.insert(t.to_string()))
                .filter(|t| !st.pruned_peers.contains_key(*t))
                .map(str::to_string)
                .collect()
        };
        tracing::debug!(targets = unique.len(), "sending peer message");

        for target in unique {
            match engine
                .send_message_to_peer(&target, &text, PeerSendOptions::durable())
                .await
            {
                Ok(()) => {}
                Err(err) if is_cached_offline(&err) => {
                    tracing::warn!(peer = %target, code = ?err.code, "peer offline; message cached, pruning");
                    self.lock_state().pruned_peers.insert(target, Instant::now());
                }
                Err(err) => {
                    tracing::error!(peer = %target, %err, "peer message failed");
                    return Err(IntercomError::PeerSend {
                        peer: target,
                        source: err,
                    });
                }
            }
        }
        Ok(())
    }

    /// Waits up to `timeout` for the session to be connected. Also creates the engine so a later
    /// login is faster.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        if self.status() == RtmStatus::Connected {
            return true;
        }
        if let Err(err) = self.ensure_engine() {
            tracing::warn!(%err, "messaging engine unavailable during warm-up");
            return false;
        }
        let mut rx = self.status_watch();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == RtmStatus::Connected)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Tears everything down. Safe to call repeatedly and from any state.
    pub async fn cleanup(&self) {
        self.cancel_timers();
        let was_connected = self.status() == RtmStatus::Connected;
        let (engine, pump) = {
            let mut st = self.lock_state();
            if let Some(user_id) = st.current_user.as_ref().map(|u| u.id.clone()) {
                st.standby_initialized_users.remove(&user_id);
            }
            // Session goes first so the logout below is not mistaken for a drop.
            st.session = None;
            st.epoch = st.epoch.wrapping_add(1);
            st.relogin_in_progress = false;
            st.reconnect_attempts = 0;
            st.pruned_peers.clear();
            (st.engine.take(), st.pump.take())
        };

        if let Some(engine) = engine {
            if was_connected {
                if let Err(err) = engine.logout().await {
                    tracing::debug!(%err, "logout during cleanup failed");
                }
            }
            engine.destroy();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        self.set_status(RtmStatus::Disconnected);
        tracing::info!("messaging session cleaned up");
    }
}
