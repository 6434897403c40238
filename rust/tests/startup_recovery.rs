//! Cold-start recovery and background push delivery.

use std::sync::Arc;

use porteiro_core::{
    handle_background_notification, load_pending_call, save_pending_call, BackgroundDelivery,
    KeyValueStore, MemoryKeyValueStore, PendingCallRecord, RecoveryOutcome, StartupRecovery,
    PENDING_CALL_KEY,
};
use serde_json::{json, Value};

#[path = "support/mod.rs"]
mod support;

use support::{FakeApi, FakeNotifications, RecordingHandler};

fn tapped_notification(call_id: &str) -> Value {
    json!({
        "actionIdentifier": "expo.modules.notifications.actions.DEFAULT",
        "notification": { "request": { "content": { "data": {
            "type": "intercom_call",
            "callId": call_id,
            "fromName": "Portaria",
            "channelName": format!("call-{call_id}")
        }}}}
    })
}

fn pending(call_id: &str) -> PendingCallRecord {
    PendingCallRecord {
        call_id: call_id.into(),
        from: Some("doorman-1".into()),
        caller_name: Some("Portaria".into()),
        apartment_number: Some("101".into()),
        building_name: None,
        channel_name: None,
        timestamp: 1,
    }
}

struct Setup {
    api: Arc<FakeApi>,
    store: Arc<MemoryKeyValueStore>,
    handler: Arc<RecordingHandler>,
}

impl Setup {
    fn new() -> Self {
        Self {
            api: FakeApi::new(),
            store: Arc::new(MemoryKeyValueStore::new()),
            handler: Arc::new(RecordingHandler::default()),
        }
    }

    fn recovery(&self, notification: Option<Value>) -> StartupRecovery {
        StartupRecovery::new(
            self.api.clone(),
            "http://backend.test",
            Arc::new(FakeNotifications(notification)),
            self.store.clone(),
            self.handler.clone(),
        )
    }
}

#[tokio::test]
async fn tapped_notification_for_ringing_call_is_resumed() {
    let s = Setup::new();
    s.api.set_call("c1", "ringing", &["doorman-1"]);
    save_pending_call(s.store.as_ref(), &pending("c1")).await.unwrap();

    let outcome = s.recovery(Some(tapped_notification("c1"))).run().await;

    assert_eq!(
        outcome,
        RecoveryOutcome::ResumedFromNotification {
            call_id: "c1".into()
        }
    );
    let pushes = s.handler.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].caller_display_name(), "Portaria");
    assert_eq!(pushes[0].channel_name, "call-c1");
    assert!(!s.store.contains(PENDING_CALL_KEY));
}

#[tokio::test]
async fn ended_pending_call_is_discarded() {
    let s = Setup::new();
    s.api.set_call("c2", "ended", &[]);
    save_pending_call(s.store.as_ref(), &pending("c2")).await.unwrap();

    let outcome = s.recovery(None).run().await;

    assert_eq!(outcome, RecoveryOutcome::NothingToResume);
    assert!(s.handler.pushes().is_empty());
    let store: &dyn KeyValueStore = s.store.as_ref();
    assert!(load_pending_call(store).await.unwrap().is_none());
}

#[tokio::test]
async fn pending_record_is_used_when_notification_is_stale() {
    let s = Setup::new();
    s.api.set_call("old", "ended", &[]);
    s.api.set_call("c3", "calling", &[]);
    save_pending_call(s.store.as_ref(), &pending("c3")).await.unwrap();

    let outcome = s.recovery(Some(tapped_notification("old"))).run().await;

    assert_eq!(
        outcome,
        RecoveryOutcome::ResumedFromPendingRecord {
            call_id: "c3".into()
        }
    );
    let pushes = s.handler.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].call_id, "c3");
    assert_eq!(pushes[0].channel_name, "call-c3");
    assert!(pushes[0].timestamp > 1);
    assert!(!s.store.contains(PENDING_CALL_KEY));
}

#[tokio::test]
async fn unknown_call_counts_as_not_live() {
    let s = Setup::new();
    save_pending_call(s.store.as_ref(), &pending("gone")).await.unwrap();

    let outcome = s.recovery(Some(json!({ "type": "visitor_arrival" }))).run().await;

    assert_eq!(outcome, RecoveryOutcome::NothingToResume);
    assert!(s.handler.pushes().is_empty());
    assert!(!s.store.contains(PENDING_CALL_KEY));
}

#[tokio::test]
async fn handoff_failure_still_counts_as_resumed() {
    let s = Setup {
        handler: Arc::new(RecordingHandler::failing()),
        ..Setup::new()
    };
    s.api.set_call("c4", "ringing", &[]);

    let outcome = s.recovery(Some(tapped_notification("c4"))).run().await;

    assert_eq!(
        outcome,
        RecoveryOutcome::ResumedFromNotification {
            call_id: "c4".into()
        }
    );
}

#[tokio::test]
async fn background_push_persists_before_handoff() {
    let store = MemoryKeyValueStore::new();
    let handler = RecordingHandler::failing();
    let payload = json!({
        "data": { "dataString": json!({
            "type": "intercom_call",
            "callId": "c5",
            "fromName": "Guarita",
            "apartmentNumber": "12"
        }).to_string() }
    });

    let delivery = handle_background_notification(&payload, &handler, &store).await;

    assert_eq!(
        delivery,
        BackgroundDelivery::Delivered {
            call_id: "c5".into()
        }
    );
    assert_eq!(handler.pushes().len(), 1);
    let record = load_pending_call(&store).await.unwrap().unwrap();
    assert_eq!(record.call_id, "c5");
    assert_eq!(record.apartment_number.as_deref(), Some("12"));
    assert_eq!(record.channel_name.as_deref(), Some("call-c5"));
}

#[tokio::test]
async fn background_ignores_responses_and_other_types() {
    let store = MemoryKeyValueStore::new();
    let handler = RecordingHandler::default();

    let response = handle_background_notification(&tapped_notification("c6"), &handler, &store).await;
    let other = handle_background_notification(
        &json!({ "data": { "type": "visitor_arrival", "callId": "x" } }),
        &handler,
        &store,
    )
    .await;

    assert_eq!(response, BackgroundDelivery::Ignored);
    assert_eq!(other, BackgroundDelivery::Ignored);
    assert!(handler.pushes().is_empty());
    assert!(!store.contains(PENDING_CALL_KEY));
}
