//! Moves broker-dead-lettered messages into the dead-letter store.
//!
//! Queues with a dead-letter exchange never call the store themselves; the
//! broker forwards rejected messages to their DLQ. An ingest runtime drains
//! each DLQ so both feeding paths end in the same store. The runtime that
//! dead-lettered a message attaches its last error as `x-last-error`, so the
//! record carries the handler's message rather than the broker's reason.
//!
//! Ingest acks the broker DLQ once the record is in the store. The store is
//! in memory, so dead letters ingested but not yet replayed are lost on
//! restart. Operators needing a durable record should consume the DLQ with
//! an external tool instead of running ingest.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DeadLetterStore, UNKNOWN_EVENT_TYPE};
use crate::bus::InboundMessage;
use crate::codec::EnvelopeCodec;
use crate::consumer::DeliveryProcessor;
use crate::retry::{Resolution, DEATH_HEADER, LAST_ERROR_HEADER};

/// Error recorded when the death history carries no reason.
pub const DEFAULT_DEATH_REASON: &str = "dead-lettered by broker";

/// Processor for a broker DLQ.
pub struct DeadLetterIngest {
    store: Arc<DeadLetterStore>,
    /// Primary queue whose rejects land in this DLQ.
    source_queue: String,
    codec: EnvelopeCodec,
}

impl DeadLetterIngest {
    pub fn new(store: Arc<DeadLetterStore>, source_queue: impl Into<String>) -> Self {
        Self {
            store,
            source_queue: source_queue.into(),
            codec: EnvelopeCodec::new(),
        }
    }
}

/// Error recorded for a broker dead letter.
///
/// Prefers the error attached by the consumer runtime, then the most recent
/// death from the `x-death` history.
fn recorded_error(message: &InboundMessage) -> String {
    if let Some(last_error) = message
        .headers
        .get(LAST_ERROR_HEADER)
        .and_then(|v| v.as_str())
    {
        return last_error.to_string();
    }

    let latest = message
        .headers
        .get(DEATH_HEADER)
        .and_then(|deaths| deaths.as_array())
        .and_then(|deaths| deaths.first())
        .and_then(|death| death.as_table());

    let Some(death) = latest else {
        return DEFAULT_DEATH_REASON.to_string();
    };

    let reason = death.get("reason").and_then(|v| v.as_str());
    let queue = death.get("queue").and_then(|v| v.as_str());
    let count = death.get("count").and_then(|v| v.as_count());

    match (reason, queue, count) {
        (Some(reason), Some(queue), Some(count)) => {
            format!("{} by queue '{}' (death count {})", reason, queue, count)
        }
        (Some(reason), Some(queue), None) => format!("{} by queue '{}'", reason, queue),
        (Some(reason), None, _) => reason.to_string(),
        _ => DEFAULT_DEATH_REASON.to_string(),
    }
}

#[async_trait]
impl DeliveryProcessor for DeadLetterIngest {
    async fn process(&self, message: &InboundMessage) -> Resolution {
        let event_type = self
            .codec
            .peek_type(&message.body)
            .unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string());

        let record = self.store.enqueue_from_queue(
            event_type,
            String::from_utf8_lossy(&message.body).into_owned(),
            recorded_error(message),
            &self.source_queue,
        );
        debug!(id = %record.id, source_queue = %self.source_queue, "Ingested broker dead letter");

        Resolution::acked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HeaderValue, Headers};
    use crate::retry::RetryPolicy;

    fn message(body: &[u8], headers: Headers) -> InboundMessage {
        InboundMessage {
            delivery_tag: 7,
            exchange: "events.dlx".to_string(),
            routing_key: "payment.completed".to_string(),
            redelivered: false,
            body: body.to_vec(),
            headers,
        }
    }

    fn x_death() -> Headers {
        let mut death = Headers::new();
        death.insert("reason".to_string(), HeaderValue::from("rejected"));
        death.insert("queue".to_string(), HeaderValue::from("payment.completed"));
        death.insert("count".to_string(), HeaderValue::Int(1));

        let mut headers = Headers::new();
        headers.insert(
            DEATH_HEADER.to_string(),
            HeaderValue::Array(vec![HeaderValue::Table(death)]),
        );
        headers
    }

    #[tokio::test]
    async fn test_ingest_records_and_acks() {
        let store = Arc::new(DeadLetterStore::new(RetryPolicy::default()));
        let ingest = DeadLetterIngest::new(Arc::clone(&store), "payment.completed");

        let resolution = ingest
            .process(&message(br#"{"eventType":"PaymentCompleted"}"#, x_death()))
            .await;
        assert_eq!(resolution, Resolution::acked());

        let records = store.export();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "paymentcompleted");
        assert_eq!(records[0].source_queue.as_deref(), Some("payment.completed"));
        assert_eq!(
            records[0].last_error,
            "rejected by queue 'payment.completed' (death count 1)"
        );
    }

    #[tokio::test]
    async fn test_attached_error_preferred_over_death_reason() {
        let store = Arc::new(DeadLetterStore::new(RetryPolicy::default()));
        let ingest = DeadLetterIngest::new(Arc::clone(&store), "payment.completed");

        let mut headers = x_death();
        headers.insert(LAST_ERROR_HEADER.to_string(), HeaderValue::from("ledger timeout"));
        ingest
            .process(&message(br#"{"eventType":"PaymentCompleted"}"#, headers))
            .await;

        assert_eq!(store.export()[0].last_error, "ledger timeout");
    }

    #[tokio::test]
    async fn test_undecodable_body_recorded_as_unknown() {
        let store = Arc::new(DeadLetterStore::new(RetryPolicy::default()));
        let ingest = DeadLetterIngest::new(Arc::clone(&store), "user.registered");

        ingest.process(&message(&[0xff, 0xfe], Headers::new())).await;

        let record = &store.export()[0];
        assert_eq!(record.event_type, UNKNOWN_EVENT_TYPE);
        assert_eq!(record.last_error, DEFAULT_DEATH_REASON);
        assert_eq!(record.event_json, "\u{fffd}\u{fffd}");
    }
}
