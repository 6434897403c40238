use std::fmt::{Display, Formatter};

use url::Url;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApiProfileId {
    LocalDevelopment,
    AndroidEmulator,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    Android,
    Ios,
    Desktop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiProfile {
    pub id: ApiProfileId,
    pub name: &'static str,
    pub base_url: &'static str,
}

pub const LOCAL_DEVELOPMENT: ApiProfile = ApiProfile {
    id: ApiProfileId::LocalDevelopment,
    name: "local-development",
    base_url: "http://localhost:3001",
};

// The Android emulator reaches the host loopback through 10.0.2.2.
pub const ANDROID_EMULATOR: ApiProfile = ApiProfile {
    id: ApiProfileId::AndroidEmulator,
    name: "android-emulator",
    base_url: "http://10.0.2.2:3001",
};

pub fn default_profile(platform: Platform) -> ApiProfile {
    match platform {
        Platform::Android => ANDROID_EMULATOR,
        Platform::Ios | Platform::Desktop => LOCAL_DEVELOPMENT,
    }
}

pub fn current_platform() -> Platform {
    if cfg!(target_os = "android") {
        Platform::Android
    } else if cfg!(target_os = "ios") {
        Platform::Ios
    } else {
        Platform::Desktop
    }
}

/// Picks the API base URL: explicit value first, then the environment value, then the
/// platform default. Blank strings count as absent.
pub fn resolve_api_base_url(
    explicit: Option<&str>,
    from_env: Option<&str>,
    platform: Platform,
) -> String {
    for candidate in [explicit, from_env].into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return trimmed.trim_end_matches('/').to_string();
        }
    }
    default_profile(platform).base_url.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    InvalidBaseUrl(String),
    NotABase(String),
}

impl Display for EndpointError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBaseUrl(msg) => write!(f, "invalid api base url: {msg}"),
            Self::NotABase(url) => write!(f, "api base url cannot carry a path: {url}"),
        }
    }
}

impl std::error::Error for EndpointError {}

pub fn validate_base_url(raw: &str) -> Result<Url, EndpointError> {
    let url = Url::parse(raw.trim()).map_err(|e| EndpointError::InvalidBaseUrl(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(EndpointError::NotABase(raw.to_string()));
    }
    Ok(url)
}

/// Appends path segments to the base URL, percent-encoding each one.
pub fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url, EndpointError> {
    let mut url = validate_base_url(base)?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| EndpointError::NotABase(base.to_string()))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

pub fn standby_token_url(base: &str) -> Result<Url, EndpointError> {
    endpoint_url(base, &["api", "tokens", "standby"])
}

pub fn token_for_call_url(base: &str) -> Result<Url, EndpointError> {
    endpoint_url(base, &["api", "tokens", "for-call"])
}

pub fn token_generate_url(base: &str) -> Result<Url, EndpointError> {
    endpoint_url(base, &["api", "tokens", "generate"])
}

pub fn call_status_url(base: &str, call_id: &str) -> Result<Url, EndpointError> {
    endpoint_url(base, &["api", "calls", call_id, "status"])
}

pub fn call_answer_url(base: &str, call_id: &str) -> Result<Url, EndpointError> {
    endpoint_url(base, &["api", "calls", call_id, "answer"])
}

pub fn call_decline_url(base: &str, call_id: &str) -> Result<Url, EndpointError> {
    endpoint_url(base, &["api", "calls", call_id, "decline"])
}

pub fn call_end_url(base: &str, call_id: &str) -> Result<Url, EndpointError> {
    endpoint_url(base, &["api", "calls", call_id, "end"])
}
