use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::engine::{VoiceEngine, VoiceEngineFactory, VoiceError, VoiceEventSink};
use crate::options::{AudioProfile, AudioScenario, ChannelMediaOptions, ChannelProfile, ClientRole};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinWithAccount {
    /// Overrides the configured app id for account registration.
    pub app_id: Option<String>,
    pub token: String,
    pub channel_name: String,
    pub user_account: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinWithUid {
    pub token: String,
    pub channel_name: String,
    pub uid: u32,
}

/// Owns the single voice engine of the process and the join/leave/mute surface on top of it.
pub struct VoiceChannelManager {
    app_id: RwLock<String>,
    factory: Arc<dyn VoiceEngineFactory>,
    events: VoiceEventSink,
    engine: Mutex<Option<Arc<dyn VoiceEngine>>>,
}

impl std::fmt::Debug for VoiceChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceChannelManager")
            .field("app_id", &self.app_id())
            .field("engine_ready", &self.has_engine())
            .finish()
    }
}

impl VoiceChannelManager {
    pub fn new(app_id: String, factory: Arc<dyn VoiceEngineFactory>, events: VoiceEventSink) -> Self {
        Self {
            app_id: RwLock::new(app_id),
            factory,
            events,
            engine: Mutex::new(None),
        }
    }

    pub fn set_app_id(&self, app_id: &str) {
        if app_id.is_empty() {
            return;
        }
        match self.app_id.write() {
            Ok(mut slot) => *slot = app_id.to_string(),
            Err(poison) => *poison.into_inner() = app_id.to_string(),
        }
    }

    pub fn app_id(&self) -> String {
        match self.app_id.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn has_engine(&self) -> bool {
        self.lock_engine().is_some()
    }

    fn lock_engine(&self) -> MutexGuard<'_, Option<Arc<dyn VoiceEngine>>> {
        match self.engine.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn current_engine(&self) -> Option<Arc<dyn VoiceEngine>> {
        self.lock_engine().clone()
    }

    pub fn ensure_rtc_engine(&self) -> Result<Arc<dyn VoiceEngine>, VoiceError> {
        let app_id = self.app_id();
        if app_id.is_empty() {
            return Err(VoiceError::MissingAppId);
        }
        let mut slot = self.lock_engine();
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }

        let engine = self.factory.create(self.events.clone());
        let code = engine.initialize(&app_id);
        if code != 0 {
            engine.release();
            return Err(VoiceError::EngineInit(code));
        }

        engine.set_channel_profile(ChannelProfile::Communication);
        engine.set_client_role(ClientRole::Broadcaster);
        engine.set_audio_profile(AudioProfile::Default, AudioScenario::Default);
        engine.enable_audio();
        engine.set_default_audio_route_to_speakerphone(true);

        tracing::info!("voice engine initialized");
        *slot = Some(engine.clone());
        Ok(engine)
    }

    pub fn join_channel_with_user_account(&self, params: &JoinWithAccount) -> Result<(), VoiceError> {
        let engine = self.ensure_rtc_engine()?;
        let app_id = params.app_id.clone().unwrap_or_else(|| self.app_id());
        let code = engine.register_local_user_account(&app_id, &params.user_account);
        if code != 0 {
            tracing::warn!(code, account = %params.user_account, "local account registration failed");
            return Err(VoiceError::AccountRegistration(code));
        }
        let code = engine.join_channel_with_user_account(
            &params.token,
            &params.channel_name,
            &params.user_account,
            &ChannelMediaOptions::intercom_audio(),
        );
        if code != 0 {
            return Err(VoiceError::Join(code));
        }
        tracing::info!(channel = %params.channel_name, account = %params.user_account, "joining voice channel");
        Ok(())
    }

    pub fn join_channel(&self, params: &JoinWithUid) -> Result<(), VoiceError> {
        let engine = self.ensure_rtc_engine()?;
        let code = engine.join_channel(
            &params.token,
            &params.channel_name,
            params.uid,
            &ChannelMediaOptions::intercom_audio(),
        );
        if code != 0 {
            return Err(VoiceError::Join(code));
        }
        tracing::info!(channel = %params.channel_name, uid = params.uid, "joining voice channel");
        Ok(())
    }

    pub fn leave_channel(&self) {
        let Some(engine) = self.current_engine() else {
            return;
        };
        let code = engine.leave_channel();
        if code != 0 {
            tracing::warn!(code, "failed to leave voice channel");
        }
    }

    pub fn renew_token(&self, token: &str) {
        let Some(engine) = self.current_engine() else {
            return;
        };
        let code = engine.renew_token(token);
        if code != 0 {
            tracing::warn!(code, "failed to renew voice token");
        }
    }

    pub fn set_speakerphone_on(&self, on: bool) -> Result<(), VoiceError> {
        let Some(engine) = self.current_engine() else {
            return Ok(());
        };
        match engine.set_default_audio_route_to_speakerphone(on) {
            0 => Ok(()),
            code => Err(VoiceError::Speakerphone(code)),
        }
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), VoiceError> {
        let Some(engine) = self.current_engine() else {
            return Ok(());
        };
        match engine.mute_local_audio_stream(muted) {
            0 => Ok(()),
            code => Err(VoiceError::Mute(code)),
        }
    }

    /// Releases the engine; the next join builds a fresh one.
    pub fn release(&self) {
        let engine = self.lock_engine().take();
        if let Some(engine) = engine {
            engine.release();
            tracing::info!("voice engine released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::engine::VoiceEvent;
    use crate::memory::{RecordingVoiceEngineFactory, VoiceCall, VoiceOp};

    fn manager(app_id: &str) -> (VoiceChannelManager, RecordingVoiceEngineFactory, Arc<Mutex<Vec<VoiceEvent>>>) {
        let factory = RecordingVoiceEngineFactory::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: VoiceEventSink = Arc::new(move |ev| sink_seen.lock().unwrap().push(ev));
        let mgr = VoiceChannelManager::new(app_id.to_string(), Arc::new(factory.clone()), sink);
        (mgr, factory, seen)
    }

    #[test]
    fn engine_is_created_and_configured_once() {
        let (mgr, factory, _) = manager("app-1");
        mgr.ensure_rtc_engine().unwrap();
        mgr.ensure_rtc_engine().unwrap();
        assert_eq!(factory.created(), 1);

        let calls = factory.engine().calls();
        assert_eq!(calls[0], VoiceCall::Initialize { app_id: "app-1".into() });
        assert!(calls.contains(&VoiceCall::SetChannelProfile(ChannelProfile::Communication)));
        assert!(calls.contains(&VoiceCall::SetClientRole(ClientRole::Broadcaster)));
        assert!(calls.contains(&VoiceCall::EnableAudio));
        assert!(calls.contains(&VoiceCall::SetSpeakerphone(true)));
    }

    #[test]
    fn missing_app_id_fails_before_engine_creation() {
        let (mgr, factory, _) = manager("");
        assert_eq!(mgr.ensure_rtc_engine().err(), Some(VoiceError::MissingAppId));
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn init_failure_is_reported_and_not_cached() {
        let (mgr, factory, _) = manager("app-1");
        factory.engine().set_code(VoiceOp::Initialize, -7);
        assert_eq!(mgr.ensure_rtc_engine().err(), Some(VoiceError::EngineInit(-7)));
        assert!(!mgr.has_engine());
    }

    #[test]
    fn join_with_account_registers_then_joins_audio_only() {
        let (mgr, factory, seen) = manager("app-1");
        mgr.join_channel_with_user_account(&JoinWithAccount {
            app_id: None,
            token: "rtc-token".into(),
            channel_name: "call-42".into(),
            user_account: "resident-9".into(),
        })
        .unwrap();

        let calls = factory.engine().calls();
        assert!(calls.contains(&VoiceCall::RegisterAccount {
            app_id: "app-1".into(),
            user_account: "resident-9".into(),
        }));
        assert!(calls.contains(&VoiceCall::JoinWithAccount {
            token: "rtc-token".into(),
            channel_name: "call-42".into(),
            user_account: "resident-9".into(),
            options: ChannelMediaOptions::intercom_audio(),
        }));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[VoiceEvent::JoinSuccess { channel_id: "call-42".into() }]
        );
    }

    #[test]
    fn non_zero_codes_become_errors() {
        let (mgr, factory, _) = manager("app-1");
        let engine = factory.engine();
        engine.set_code(VoiceOp::RegisterAccount, 2);
        let params = JoinWithAccount {
            app_id: None,
            token: "t".into(),
            channel_name: "c".into(),
            user_account: "u".into(),
        };
        assert_eq!(
            mgr.join_channel_with_user_account(&params).err(),
            Some(VoiceError::AccountRegistration(2))
        );

        engine.set_code(VoiceOp::RegisterAccount, 0);
        engine.set_code(VoiceOp::Join, -17);
        assert_eq!(
            mgr.join_channel_with_user_account(&params).err(),
            Some(VoiceError::Join(-17))
        );
        assert_eq!(
            mgr.join_channel(&JoinWithUid {
                token: "t".into(),
                channel_name: "c".into(),
                uid: 7,
            })
            .err(),
            Some(VoiceError::Join(-17))
        );
    }

    #[test]
    fn toggles_error_but_leave_and_renew_only_log() {
        let (mgr, factory, _) = manager("app-1");
        // Without an engine every toggle is a no-op.
        assert!(mgr.set_muted(true).is_ok());
        assert!(mgr.set_speakerphone_on(false).is_ok());
        mgr.leave_channel();

        mgr.ensure_rtc_engine().unwrap();
        let engine = factory.engine();
        engine.set_code(VoiceOp::Mute, 3);
        engine.set_code(VoiceOp::Speakerphone, 4);
        engine.set_code(VoiceOp::Leave, 5);
        engine.set_code(VoiceOp::RenewToken, 6);
        assert_eq!(mgr.set_muted(true).err(), Some(VoiceError::Mute(3)));
        assert_eq!(mgr.set_speakerphone_on(true).err(), Some(VoiceError::Speakerphone(4)));
        mgr.leave_channel();
        mgr.renew_token("fresh");
        assert!(engine.calls().contains(&VoiceCall::RenewToken("fresh".into())));
    }

    #[test]
    fn release_drops_engine() {
        let (mgr, factory, _) = manager("app-1");
        mgr.ensure_rtc_engine().unwrap();
        mgr.release();
        assert!(!mgr.has_engine());
        assert!(factory.engine().calls().contains(&VoiceCall::Release));
        mgr.ensure_rtc_engine().unwrap();
        assert_eq!(factory.created(), 2);
    }
}
