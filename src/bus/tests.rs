use super::*;

#[test]
fn test_header_count_from_int() {
    assert_eq!(HeaderValue::Int(3).as_count(), Some(3));
    assert_eq!(HeaderValue::Int(-1).as_count(), None);
}

#[test]
fn test_header_count_from_text() {
    assert_eq!(HeaderValue::Str(" 4 ".to_string()).as_count(), Some(4));
    assert_eq!(HeaderValue::Bytes(b"2".to_vec()).as_count(), Some(2));
    assert_eq!(HeaderValue::Str("many".to_string()).as_count(), None);
}

#[test]
fn test_header_count_rejects_other_types() {
    assert_eq!(HeaderValue::Bool(true).as_count(), None);
    assert_eq!(HeaderValue::Array(vec![]).as_count(), None);
}

#[test]
fn test_outbound_message_headers() {
    let msg = OutboundMessage::new("events", "user.registered", b"{}".to_vec())
        .with_header("x-retry-count", 2u32)
        .with_header("origin", "test");

    assert_eq!(msg.headers.get("x-retry-count"), Some(&HeaderValue::Int(2)));
    assert_eq!(
        msg.headers.get("origin").and_then(|v| v.as_str()),
        Some("test")
    );
}

#[test]
fn test_durable_queue_decl() {
    let decl = QueueDecl::durable("payments").with_argument(DEAD_LETTER_EXCHANGE_ARG, "dlx");

    assert!(decl.durable);
    assert!(!decl.exclusive);
    assert!(!decl.auto_delete);
    assert_eq!(
        decl.arguments.get(DEAD_LETTER_EXCHANGE_ARG).map(String::as_str),
        Some("dlx")
    );
}

#[test]
fn test_disposition_display() {
    assert_eq!(Disposition::Ack.to_string(), "ack");
    assert_eq!(
        Disposition::Requeue { next_attempt: 2 }.to_string(),
        "requeue(attempt=2)"
    );
    assert_eq!(Disposition::DeadLetter.to_string(), "dead-letter");
}
