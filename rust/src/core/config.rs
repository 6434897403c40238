use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "porteiro_config.json";

const DEFAULT_LOGIN_CONFIRM_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOGIN_SETTLE_MS: u64 = 200;
const DEFAULT_RENEWAL_BUFFER_SECS: u64 = 30;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_PRUNED_PEER_TTL_SECS: u64 = 60;
const DEFAULT_RTM_WARMUP_TIMEOUT_MS: u64 = 6_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntercomConfig {
    pub app_id: Option<String>,
    pub api_base_url: Option<String>,
    pub login_confirm_timeout_ms: u64,
    pub login_settle_ms: u64,
    pub renewal_buffer_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub pruned_peer_ttl_secs: u64,
    pub rtm_warmup_timeout_ms: u64,
}

impl Default for IntercomConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            api_base_url: None,
            login_confirm_timeout_ms: DEFAULT_LOGIN_CONFIRM_TIMEOUT_MS,
            login_settle_ms: DEFAULT_LOGIN_SETTLE_MS,
            renewal_buffer_secs: DEFAULT_RENEWAL_BUFFER_SECS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            pruned_peer_ttl_secs: DEFAULT_PRUNED_PEER_TTL_SECS,
            rtm_warmup_timeout_ms: DEFAULT_RTM_WARMUP_TIMEOUT_MS,
        }
    }
}

impl IntercomConfig {
    /// Reads `porteiro_config.json` from `data_dir` (missing file means defaults), then applies
    /// `PORTEIRO_*` environment overrides.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Self>(&raw)
                .with_context(|| format!("parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(app_id) = non_empty(lookup("PORTEIRO_APP_ID")) {
            self.app_id = Some(app_id);
        }
        if let Some(url) = non_empty(lookup("PORTEIRO_API_BASE_URL")) {
            self.api_base_url = Some(url);
        }
        self.login_confirm_timeout_ms = parse_u64(
            lookup("PORTEIRO_LOGIN_TIMEOUT_MS"),
            self.login_confirm_timeout_ms,
        );
    }

    pub fn session_timings(&self) -> SessionTimings {
        SessionTimings {
            login_confirm_timeout: Duration::from_millis(self.login_confirm_timeout_ms),
            login_settle: Duration::from_millis(self.login_settle_ms),
            renewal_buffer: Duration::from_secs(self.renewal_buffer_secs),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_attempts: self.reconnect_max_attempts,
            pruned_peer_ttl: Duration::from_secs(self.pruned_peer_ttl_secs),
        }
    }

    pub fn rtm_warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.rtm_warmup_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub login_confirm_timeout: Duration,
    pub login_settle: Duration,
    pub renewal_buffer: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_attempts: u32,
    pub pruned_peer_ttl: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        IntercomConfig::default().session_timings()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IntercomConfig::load(dir.path()).unwrap();
        // Ignore whatever the test environment exports.
        config.app_id = None;
        config.api_base_url = None;
        config.login_confirm_timeout_ms = DEFAULT_LOGIN_CONFIRM_TIMEOUT_MS;
        assert_eq!(config, IntercomConfig::default());
        let timings = config.session_timings();
        assert_eq!(timings.login_confirm_timeout, Duration::from_secs(5));
        assert_eq!(timings.renewal_buffer, Duration::from_secs(30));
        assert_eq!(timings.reconnect_base_delay, Duration::from_secs(2));
        assert_eq!(timings.reconnect_max_attempts, 5);
    }

    #[test]
    fn file_values_fill_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"app_id":"file-app","reconnect_max_attempts":3}"#,
        )
        .unwrap();
        let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        let config: IntercomConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config.app_id.as_deref(), Some("file-app"));
        assert_eq!(config.reconnect_max_attempts, 3);
        assert_eq!(config.login_settle_ms, DEFAULT_LOGIN_SETTLE_MS);
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORTEIRO_APP_ID", "env-app"),
            ("PORTEIRO_API_BASE_URL", "   "),
            ("PORTEIRO_LOGIN_TIMEOUT_MS", "1500"),
        ]);
        let mut config = IntercomConfig {
            app_id: Some("file-app".into()),
            api_base_url: Some("https://file.example.com".into()),
            ..IntercomConfig::default()
        };
        config.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.app_id.as_deref(), Some("env-app"));
        assert_eq!(config.api_base_url.as_deref(), Some("https://file.example.com"));
        assert_eq!(config.login_confirm_timeout_ms, 1500);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();
        assert!(IntercomConfig::load(dir.path()).is_err());
    }
}
