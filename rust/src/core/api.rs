// Backend token exchange and call-control client.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::{CallParticipant, CallSnapshot, CallStatusReport, CredentialBundle, StandbyBundle, UserRole};

/// Who performs a call-control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallParty<'a> {
    pub user_id: &'a str,
    pub role: UserRole,
}

#[async_trait]
pub trait IntercomApi: Send + Sync {
    async fn standby_bundle(
        &self,
        base_url: &str,
        uid: &str,
        access_token: Option<&str>,
    ) -> Result<StandbyBundle, ApiError>;

    async fn token_for_call(
        &self,
        base_url: &str,
        call_id: &str,
        uid: &str,
        rtc_role: &str,
        access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError>;

    async fn generate_token(
        &self,
        base_url: &str,
        channel_name: &str,
        uid: &str,
        rtc_role: &str,
        access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError>;

    async fn call_status(&self, base_url: &str, call_id: &str) -> Result<CallStatusReport, ApiError>;

    async fn answer_call(
        &self,
        base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError>;

    async fn decline_call(
        &self,
        base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        reason: &str,
        access_token: Option<&str>,
    ) -> Result<(), ApiError>;

    async fn end_call(
        &self,
        base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        cause: &str,
        access_token: Option<&str>,
    ) -> Result<(), ApiError>;
}

/// Current bearer token of the hosted auth session, if the user is signed in.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// Token source for hosts without an auth session.
#[derive(Debug, Clone, Default)]
pub struct NoAccessToken;

#[async_trait]
impl AccessTokenSource for NoAccessToken {
    async fn access_token(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpApiClient {
    client: reqwest::Client,
}

impl HttpApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post(
        &self,
        url: url::Url,
        body: Value,
        access_token: Option<&str>,
    ) -> Result<Value, ApiError> {
        let mut req = self.client.post(url).json(&body);
        if let Some(token) = access_token.filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        read_envelope(resp).await
    }
}

/// Unwraps `{success, data, error, message}`. Non-2xx statuses and `success: false` are errors;
/// an unparsable body is treated as `{success: <status ok>}`.
async fn read_envelope(resp: reqwest::Response) -> Result<Value, ApiError> {
    let status = resp.status();
    let text = resp.text().await?;
    let body: Value =
        serde_json::from_str(&text).unwrap_or_else(|_| json!({ "success": status.is_success() }));

    let message = body
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| body.get("message").and_then(Value::as_str))
        .map(str::to_string);

    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        });
    }
    if !body.get("success").and_then(Value::as_bool).unwrap_or(false) {
        return Err(ApiError::Rejected {
            message: message.unwrap_or_else(|| "request was not successful".into()),
        });
    }
    Ok(body)
}

fn take_data<T: DeserializeOwned>(mut body: Value) -> Result<T, ApiError> {
    match body.get_mut("data").map(Value::take) {
        Some(data) if !data.is_null() => Ok(serde_json::from_value(data)?),
        _ => Err(ApiError::Rejected {
            message: "response has no data".into(),
        }),
    }
}

fn parse_call_status(body: Value) -> Result<CallStatusReport, ApiError> {
    let data: Value = take_data(body)?;
    let call = match data.get("call") {
        Some(call) if !call.is_null() => serde_json::from_value::<CallSnapshot>(call.clone())?,
        _ => CallSnapshot::default(),
    };
    // Entries without a user id are dropped rather than failing the whole report.
    let participants = data
        .get("participants")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|p| serde_json::from_value::<CallParticipant>(p.clone()).ok())
                .filter(|p| !p.user_id.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Ok(CallStatusReport { call, participants })
}

#[async_trait]
impl IntercomApi for HttpApiClient {
    async fn standby_bundle(
        &self,
        base_url: &str,
        uid: &str,
        access_token: Option<&str>,
    ) -> Result<StandbyBundle, ApiError> {
        let url = porteiro_endpoints::standby_token_url(base_url)?;
        let body = self.post(url, json!({ "uid": uid }), access_token).await?;
        take_data(body)
    }

    async fn token_for_call(
        &self,
        base_url: &str,
        call_id: &str,
        uid: &str,
        rtc_role: &str,
        access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError> {
        let url = porteiro_endpoints::token_for_call_url(base_url)?;
        let body = self
            .post(
                url,
                json!({ "callId": call_id, "uid": uid, "role": rtc_role }),
                access_token,
            )
            .await?;
        take_data(body)
    }

    async fn generate_token(
        &self,
        base_url: &str,
        channel_name: &str,
        uid: &str,
        rtc_role: &str,
        access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError> {
        let url = porteiro_endpoints::token_generate_url(base_url)?;
        let body = self
            .post(
                url,
                json!({ "channelName": channel_name, "uid": uid, "role": rtc_role }),
                access_token,
            )
            .await?;
        take_data(body)
    }

    async fn call_status(&self, base_url: &str, call_id: &str) -> Result<CallStatusReport, ApiError> {
        let url = porteiro_endpoints::call_status_url(base_url, call_id)?;
        let resp = self.client.get(url).send().await?;
        let body = read_envelope(resp).await?;
        parse_call_status(body)
    }

    async fn answer_call(
        &self,
        base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        access_token: Option<&str>,
    ) -> Result<CredentialBundle, ApiError> {
        let url = porteiro_endpoints::call_answer_url(base_url, call_id)?;
        let body = self
            .post(
                url,
                json!({ "userId": party.user_id, "userType": party.role.api_name() }),
                access_token,
            )
            .await?;
        let data: Value = take_data(body)?;
        match data.get("tokens") {
            Some(tokens) if !tokens.is_null() => Ok(serde_json::from_value(tokens.clone())?),
            _ => Err(ApiError::Rejected {
                message: "no tokens in answer response".into(),
            }),
        }
    }

    async fn decline_call(
        &self,
        base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        reason: &str,
        access_token: Option<&str>,
    ) -> Result<(), ApiError> {
        let url = porteiro_endpoints::call_decline_url(base_url, call_id)?;
        self.post(
            url,
            json!({
                "userId": party.user_id,
                "userType": party.role.api_name(),
                "reason": reason,
            }),
            access_token,
        )
        .await?;
        Ok(())
    }

    async fn end_call(
        &self,
        base_url: &str,
        call_id: &str,
        party: CallParty<'_>,
        cause: &str,
        access_token: Option<&str>,
    ) -> Result<(), ApiError> {
        let url = porteiro_endpoints::call_end_url(base_url, call_id)?;
        self.post(
            url,
            json!({
                "userId": party.user_id,
                "userType": party.role.api_name(),
                "cause": cause,
            }),
            access_token,
        )
        .await?;
        Ok(())
    }
}
