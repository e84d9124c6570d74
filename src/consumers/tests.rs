use super::*;
use crate::codec::LogicalField;
use crate::handlers::LoggingHandler;
use crate::router::Handler;
use crate::test_utils::RecordingHandler;
use std::collections::HashMap;
use std::sync::Mutex;

fn logging_factory() -> Arc<HandlerFactory> {
    Arc::new(|name: &str| -> Arc<dyn Handler> { Arc::new(LoggingHandler::new(name)) })
}

/// Factory that hands out one recording handler per name.
fn recording_factory() -> (Arc<HandlerFactory>, Arc<Mutex<HashMap<String, RecordingHandler>>>) {
    let made: Arc<Mutex<HashMap<String, RecordingHandler>>> = Arc::default();
    let registry = made.clone();
    let factory: Arc<HandlerFactory> = Arc::new(move |name: &str| -> Arc<dyn Handler> {
        let mut made = registry.lock().unwrap();
        let handler = made
            .entry(name.to_string())
            .or_insert_with(|| RecordingHandler::new(name))
            .shared();
        handler
    });
    (factory, made)
}

fn build(kind: ConsumerKind) -> ConsumerDefinition {
    kind.build(&ConsumerOptions::default(), &*logging_factory())
}

#[test]
fn test_kind_names_match_serde() {
    for kind in ConsumerKind::ALL {
        let parsed: ConsumerKind = serde_json::from_value(serde_json::json!(kind.name())).unwrap();
        assert_eq!(parsed, kind);
    }
}

#[test]
fn test_user_registration_uses_broker_dead_letter() {
    let def = build(ConsumerKind::UserRegistration);
    assert_eq!(def.queues.len(), 1);

    let binding = &def.queues[0].binding;
    assert_eq!(binding.queue, "user.registered");
    assert_eq!(binding.routing_key, "user.registered");
    assert_eq!(binding.exchange, DEFAULT_EXCHANGE);
    let dl = binding.dead_letter.as_ref().unwrap();
    assert_eq!(dl.queue, "user.registered.dlq");
    assert_eq!(dl.exchange, "events.dlx");
}

#[test]
fn test_user_registration_requires_email() {
    let def = build(ConsumerKind::UserRegistration);
    let codec = &def.queues[0].codec;

    let err = codec
        .decode(br#"{"eventType":"UserRegistered","email":""}"#)
        .unwrap_err();
    assert!(matches!(err, crate::codec::CodecError::Validation(_)));

    let event = codec
        .decode(br#"{"type":"UserRegistered","Email":"a@b.c"}"#)
        .unwrap();
    assert_eq!(event.text(LogicalField::Email), Some("a@b.c"));
}

#[test]
fn test_payment_requires_id_and_amount() {
    let def = build(ConsumerKind::PaymentCompleted);
    let codec = &def.queues[0].codec;

    assert!(codec
        .decode(br#"{"eventType":"PaymentCompleted","paymentId":"p-1"}"#)
        .is_err());
    assert!(codec
        .decode(br#"{"eventType":"PaymentCompleted","paymentId":"p-1","amount":12.5}"#)
        .is_ok());
}

#[test]
fn test_store_backed_consumers_have_no_dead_letter_binding() {
    let store = Arc::new(DeadLetterStore::new(RetryPolicy::default()));
    for kind in [ConsumerKind::VehicleCreated, ConsumerKind::CriticalError] {
        let def = build(kind);
        assert!(def.queues[0].binding.dead_letter.is_none());
        assert!(matches!(
            def.queues[0].dead_letter_target(&store),
            DeadLetterTarget::Store(_)
        ));
    }
}

#[test]
fn test_critical_error_queue_and_routing_key_differ() {
    let def = build(ConsumerKind::CriticalError);
    assert_eq!(def.queues[0].binding.queue, "alerts.critical");
    assert_eq!(def.queues[0].binding.routing_key, "error.critical");
}

#[test]
fn test_queue_override() {
    let options = ConsumerOptions {
        queue: Some("staging.vehicles".to_string()),
        prefetch: 8,
        ..Default::default()
    };
    let def = ConsumerKind::VehicleCreated.build(&options, &*logging_factory());
    assert_eq!(def.queues[0].binding.queue, "staging.vehicles");
    assert_eq!(def.queues[0].binding.routing_key, "vehicle.created");
    assert_eq!(def.prefetch, 8);
}

#[test]
fn test_notification_queues() {
    let def = build(ConsumerKind::Notifications);
    let queues: Vec<(&str, &str, bool)> = def
        .queues
        .iter()
        .map(|q| {
            (
                q.binding.queue.as_str(),
                q.binding.routing_key.as_str(),
                q.binding.dead_letter.is_some(),
            )
        })
        .collect();

    assert_eq!(
        queues,
        vec![
            ("notifications.email", "notification.email", true),
            ("notifications.sms", "notification.sms", true),
            ("notifications.push", "notification.push", true),
            ("notifications.general", "notification.general", false),
        ]
    );
}

#[test]
fn test_notification_prefix_override() {
    let options = ConsumerOptions {
        queue: Some("tenant-a".to_string()),
        ..Default::default()
    };
    let def = ConsumerKind::Notifications.build(&options, &*logging_factory());
    assert_eq!(def.queues[0].binding.queue, "tenant-a.email");
    assert_eq!(def.queues[3].binding.queue, "tenant-a.general");
}

#[tokio::test]
async fn test_general_queue_routes_by_category() {
    let (factory, made) = recording_factory();
    let def = ConsumerKind::Notifications.build(&ConsumerOptions::default(), &*factory);
    let general = &def.queues[3];

    let event = general
        .codec
        .decode(br#"{"type":"MarketingEmail","To":"a@b.c","Body":"hi"}"#)
        .unwrap();
    general.router.dispatch(Arc::new(event)).await.unwrap();

    let sms = general
        .codec
        .decode(br#"{"type":"sms","to":"+15550100","message":"code 1234"}"#)
        .unwrap();
    general.router.dispatch(Arc::new(sms)).await.unwrap();

    let made = made.lock().unwrap();
    assert_eq!(made["email"].call_count(), 1);
    assert_eq!(made["sms"].call_count(), 1);
    assert_eq!(made["push"].call_count(), 0);
}

#[tokio::test]
async fn test_dedicated_queue_rejects_other_channels() {
    let def = build(ConsumerKind::Notifications);
    let email = &def.queues[0];

    let event = email
        .codec
        .decode(br#"{"eventType":"push","to":"device-1","message":"ping"}"#)
        .unwrap();
    let err = email.router.dispatch(Arc::new(event)).await.unwrap_err();
    assert!(matches!(err, crate::router::RouteError::Unroutable(_)));
}
