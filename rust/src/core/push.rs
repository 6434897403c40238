// Intercom call push payloads: shape normalization and background delivery.

use serde_json::Value;

use super::recovery::IncomingCallHandler;
use super::storage::{self, KeyValueStore};
use crate::state::{now_millis, PendingCallRecord};

pub const INTERCOM_CALL_TYPE: &str = "intercom_call";

const DEFAULT_CALLER_NAME: &str = "Porteiro";

/// Digs the call payload out of the shapes push bridges deliver: the notification response
/// envelope, a `data` object (possibly nested once more), or a JSON string under `dataString`
/// or `body`. Returns the first object carrying a `type`, or the input unchanged.
pub fn normalize_notification_payload(payload: &Value) -> Value {
    let candidates = [
        payload.pointer("/notification/request/content/data"),
        payload.pointer("/request/content/data"),
        payload.get("data"),
        payload.pointer("/data/data"),
        Some(payload),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(typed_object)
        .unwrap_or_else(|| payload.clone())
}

fn typed_object(candidate: &Value) -> Option<Value> {
    match candidate {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) if has_type(&parsed) => Some(parsed),
            _ => None,
        },
        Value::Object(map) => {
            if has_type(candidate) {
                return Some(candidate.clone());
            }
            ["dataString", "body"]
                .into_iter()
                .filter_map(|key| map.get(key).and_then(Value::as_str))
                .find_map(|raw| match serde_json::from_str::<Value>(raw) {
                    Ok(parsed) if has_type(&parsed) => Some(parsed),
                    Ok(_) => None,
                    Err(err) => {
                        tracing::debug!(%err, "push: nested payload is not json");
                        None
                    }
                })
        }
        _ => None,
    }
}

fn has_type(v: &Value) -> bool {
    v.get("type").and_then(Value::as_str).is_some()
}

fn non_empty_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// An intercom call announced by push, by notification tap or by a stored pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallPush {
    pub call_id: String,
    pub from: Option<String>,
    pub caller_name: Option<String>,
    pub apartment_number: Option<String>,
    pub building_name: Option<String>,
    pub channel_name: String,
    pub timestamp: i64,
}

impl IncomingCallPush {
    /// Accepts any payload shape [`normalize_notification_payload`] understands.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let data = normalize_notification_payload(payload);
        if data.get("type").and_then(Value::as_str) != Some(INTERCOM_CALL_TYPE) {
            return None;
        }
        let call_id = non_empty_str(&data, "callId")?.to_string();
        let channel_name = non_empty_str(&data, "channelName")
            .or_else(|| non_empty_str(&data, "channel"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("call-{call_id}"));
        Some(Self {
            from: non_empty_str(&data, "from").map(str::to_string),
            caller_name: non_empty_str(&data, "fromName")
                .or_else(|| non_empty_str(&data, "callerName"))
                .map(str::to_string),
            apartment_number: non_empty_str(&data, "apartmentNumber").map(str::to_string),
            building_name: non_empty_str(&data, "buildingName").map(str::to_string),
            call_id,
            channel_name,
            timestamp: now_millis(),
        })
    }

    pub fn caller_display_name(&self) -> &str {
        self.caller_name.as_deref().unwrap_or(DEFAULT_CALLER_NAME)
    }

    pub fn to_pending_record(&self) -> PendingCallRecord {
        PendingCallRecord {
            call_id: self.call_id.clone(),
            from: self.from.clone(),
            caller_name: self.caller_name.clone(),
            apartment_number: self.apartment_number.clone(),
            building_name: self.building_name.clone(),
            channel_name: Some(self.channel_name.clone()),
            timestamp: self.timestamp,
        }
    }

    /// The hand-off always carries the time of recovery, not the time of the original push.
    pub fn from_pending_record(record: PendingCallRecord) -> Self {
        let channel_name = record
            .channel_name
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("call-{}", record.call_id));
        Self {
            call_id: record.call_id,
            from: record.from,
            caller_name: record.caller_name,
            apartment_number: record.apartment_number,
            building_name: record.building_name,
            channel_name,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundDelivery {
    /// Not an intercom call, or a user action on an already shown notification.
    Ignored,
    Delivered { call_id: String },
}

/// Background path for a push received while the app is not in the foreground. The pending
/// record is written before the hand-off so a kill in between is still recoverable at startup.
pub async fn handle_background_notification(
    payload: &Value,
    handler: &dyn IncomingCallHandler,
    store: &dyn KeyValueStore,
) -> BackgroundDelivery {
    if payload.get("actionIdentifier").is_some() {
        tracing::debug!("push: notification response event, leaving it to startup recovery");
        return BackgroundDelivery::Ignored;
    }
    let Some(push) = IncomingCallPush::from_payload(payload) else {
        tracing::debug!("push: not an intercom call");
        return BackgroundDelivery::Ignored;
    };
    tracing::info!(call_id = %push.call_id, "push: intercom call received in background");

    if let Err(err) = storage::save_pending_call(store, &push.to_pending_record()).await {
        tracing::warn!(%err, call_id = %push.call_id, "push: failed to persist pending call");
    }
    let call_id = push.call_id.clone();
    if let Err(err) = handler.handle_incoming_push(push).await {
        tracing::warn!(%err, call_id = %call_id, "push: coordinator hand-off failed");
    }
    BackgroundDelivery::Delivered { call_id }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_notification_response_envelope() {
        let payload = json!({
            "actionIdentifier": "expo.modules.notifications.actions.DEFAULT",
            "notification": { "request": { "content": { "data": {
                "type": "intercom_call",
                "callId": "c1",
                "from": "doorman-7",
                "fromName": "Portaria Central",
                "apartmentNumber": "204",
                "channel": "ch-c1"
            }}}}
        });
        let push = IncomingCallPush::from_payload(&payload).unwrap();
        assert_eq!(push.call_id, "c1");
        assert_eq!(push.caller_display_name(), "Portaria Central");
        assert_eq!(push.channel_name, "ch-c1");
        assert_eq!(push.from.as_deref(), Some("doorman-7"));
    }

    #[test]
    fn parses_json_string_in_data_string_and_body() {
        let inner = json!({ "type": "intercom_call", "callId": "c2", "callerName": "Guarita" });
        for key in ["dataString", "body"] {
            let payload = json!({ "data": { key: inner.to_string() } });
            let push = IncomingCallPush::from_payload(&payload).unwrap();
            assert_eq!(push.call_id, "c2");
            assert_eq!(push.caller_name.as_deref(), Some("Guarita"));
            assert_eq!(push.channel_name, "call-c2");
        }
    }

    #[test]
    fn typed_outer_object_is_not_unwrapped() {
        let payload = json!({ "type": "visitor_arrival", "body": "{\"type\":\"intercom_call\",\"callId\":\"x\"}" });
        assert_eq!(normalize_notification_payload(&payload)["type"], "visitor_arrival");
        assert!(IncomingCallPush::from_payload(&payload).is_none());
    }

    #[test]
    fn rejects_missing_call_id_and_garbage() {
        assert!(IncomingCallPush::from_payload(&json!({ "type": "intercom_call" })).is_none());
        assert!(IncomingCallPush::from_payload(&json!({ "data": { "dataString": "{nope" } })).is_none());
        assert!(IncomingCallPush::from_payload(&json!(42)).is_none());
    }

    #[test]
    fn pending_record_round_trips_fields() {
        let push = IncomingCallPush::from_payload(&json!({
            "data": { "data": {
                "type": "intercom_call",
                "callId": "c3",
                "buildingName": "Torre B",
                "channelName": "call-c3"
            }}
        }))
        .unwrap();
        let record = push.to_pending_record();
        assert_eq!(record.building_name.as_deref(), Some("Torre B"));
        let back = IncomingCallPush::from_pending_record(record);
        assert_eq!(back.call_id, "c3");
        assert_eq!(back.channel_name, "call-c3");
    }
}
