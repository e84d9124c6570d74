use super::*;
use crate::bus::{MemoryBroker, OutboundMessage};
use crate::codec::{EventSchema, LogicalField};
use crate::dlq::DeadLetterStore;
use crate::retry::{DeadLetterTarget, RetryPolicy};
use crate::test_utils::RecordingHandler;
use crate::topology::{QueueBinding, TopologyManager};
use std::sync::atomic::{AtomicUsize, Ordering};

const QUEUE: &str = "vehicle.created";

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(100),
        multiplier: 2.0,
        max_backoff: Duration::from_secs(10),
    }
}

fn codec() -> Arc<EnvelopeCodec> {
    Arc::new(
        EnvelopeCodec::new()
            .with_schema(EventSchema::new("vehiclecreated", &[LogicalField::VehicleId])),
    )
}

fn router(handler: &RecordingHandler) -> Arc<TypeRouter> {
    let mut router = TypeRouter::new();
    router.register("vehiclecreated", handler.shared());
    Arc::new(router)
}

async fn broker(binding: QueueBinding) -> Arc<MemoryBroker> {
    let broker = Arc::new(MemoryBroker::new());
    TopologyManager::new(broker.clone())
        .declare(&[binding])
        .await
        .unwrap();
    broker
}

async fn publish(broker: &MemoryBroker, body: &str) {
    broker
        .publish(OutboundMessage::new("events", QUEUE, body.as_bytes().to_vec()))
        .await
        .unwrap();
}

/// Run a runtime on `QUEUE` for `window` of (virtual) time, then shut it down.
async fn run_for(
    broker: Arc<dyn Broker>,
    processor: Arc<dyn DeliveryProcessor>,
    window: Duration,
) -> RuntimeStats {
    let runtime = ConsumerRuntime::new(broker, QUEUE, 1, processor);
    let source = runtime.open().await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(runtime.run(source, shutdown_rx));
    tokio::time::sleep(window).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap()
}

const VALID: &str = r#"{"eventType":"VehicleCreated","vehicleId":"v-42"}"#;

#[tokio::test(start_paused = true)]
async fn test_successful_event_is_acked() {
    let broker = broker(QueueBinding::new(QUEUE, "events", QUEUE)).await;
    let handler = RecordingHandler::new("vehicles");
    let store = Arc::new(DeadLetterStore::new(policy()));
    let pipeline = EventPipeline::new(
        codec(),
        router(&handler),
        RetryCoordinator::new(QUEUE, policy(), DeadLetterTarget::Store(store.clone())),
    );

    publish(&broker, VALID).await;
    let stats = run_for(broker.clone(), Arc::new(pipeline), Duration::from_secs(1)).await;

    assert_eq!(handler.call_count(), 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.received, 1);
    assert_eq!(broker.queue_depth(QUEUE).await, Some(0));
    assert!(store.is_empty());

    let events = handler.events().await;
    assert_eq!(events[0].text(LogicalField::VehicleId), Some("v-42"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_cap_delivers_exactly_max_attempts() {
    let broker = broker(QueueBinding::new(QUEUE, "events", QUEUE).with_default_dead_letter()).await;
    let handler = RecordingHandler::always_failing("vehicles", "registry unavailable");
    let pipeline = EventPipeline::new(
        codec(),
        router(&handler),
        RetryCoordinator::new(QUEUE, policy(), DeadLetterTarget::Broker),
    );

    publish(&broker, VALID).await;
    let stats = run_for(broker.clone(), Arc::new(pipeline), Duration::from_secs(5)).await;

    assert_eq!(handler.call_count(), 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.dead_lettered, 1);

    let dead = broker.drain(&format!("{}.dlq", QUEUE)).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, VALID.as_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_body_goes_to_store_without_handler() {
    let broker = broker(QueueBinding::new(QUEUE, "events", QUEUE)).await;
    let handler = RecordingHandler::new("vehicles");
    let store = Arc::new(DeadLetterStore::new(policy()));
    let pipeline = EventPipeline::new(
        codec(),
        router(&handler),
        RetryCoordinator::new(QUEUE, policy(), DeadLetterTarget::Store(store.clone())),
    );

    publish(&broker, "{not json").await;
    let stats = run_for(broker.clone(), Arc::new(pipeline), Duration::from_millis(10)).await;

    assert_eq!(handler.call_count(), 0);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.requeued, 0);

    let records = store.export();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_json, "{not json");
    assert!(records[0].last_error.starts_with("Decode error"));
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_records_event_type() {
    let broker = broker(QueueBinding::new(QUEUE, "events", QUEUE)).await;
    let handler = RecordingHandler::new("vehicles");
    let store = Arc::new(DeadLetterStore::new(policy()));
    let pipeline = EventPipeline::new(
        codec(),
        router(&handler),
        RetryCoordinator::new(QUEUE, policy(), DeadLetterTarget::Store(store.clone())),
    );

    publish(&broker, r#"{"eventType":"VehicleCreated"}"#).await;
    run_for(broker.clone(), Arc::new(pipeline), Duration::from_millis(10)).await;

    assert_eq!(handler.call_count(), 0);
    assert_eq!(store.export()[0].event_type, "vehiclecreated");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_channel_and_keeps_pending_messages() {
    let broker = broker(QueueBinding::new(QUEUE, "events", QUEUE)).await;
    let handler = RecordingHandler::new("vehicles");
    let pipeline = EventPipeline::new(
        codec(),
        router(&handler),
        RetryCoordinator::new(QUEUE, policy(), DeadLetterTarget::Broker),
    );

    let stats = run_for(broker.clone(), Arc::new(pipeline), Duration::from_millis(10)).await;
    assert_eq!(stats, RuntimeStats::default());

    // Published after shutdown: stays queued for the next consumer
    publish(&broker, VALID).await;
    assert_eq!(broker.queue_depth(QUEUE).await, Some(1));
    assert_eq!(handler.call_count(), 0);
}

// ============================================================================
// Reconnection
// ============================================================================

/// Delivery source whose stream has already ended.
struct EndedSource;

#[async_trait]
impl DeliverySource for EndedSource {
    fn queue(&self) -> &str {
        QUEUE
    }

    async fn next_delivery(&mut self) -> Option<crate::bus::Result<InboundMessage>> {
        None
    }

    async fn settle(&mut self, _: &InboundMessage, _: Disposition) -> crate::bus::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> crate::bus::Result<()> {
        Ok(())
    }
}

/// Broker whose first consumer loses its stream immediately.
struct FlakyBroker {
    inner: Arc<MemoryBroker>,
    opened: AtomicUsize,
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn declare_exchange(&self, exchange: &crate::bus::ExchangeDecl) -> crate::bus::Result<()> {
        self.inner.declare_exchange(exchange).await
    }

    async fn declare_queue(&self, queue: &crate::bus::QueueDecl) -> crate::bus::Result<()> {
        self.inner.declare_queue(queue).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> crate::bus::Result<()> {
        self.inner.bind_queue(queue, exchange, key).await
    }

    async fn consume(
        &self,
        queue: &str,
        tag: &str,
        prefetch: u16,
    ) -> crate::bus::Result<Box<dyn DeliverySource>> {
        if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(Box::new(EndedSource));
        }
        self.inner.consume(queue, tag, prefetch).await
    }

    async fn publish(&self, message: OutboundMessage) -> crate::bus::Result<()> {
        self.inner.publish(message).await
    }

    async fn close(&self) -> crate::bus::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_stream_loss() {
    let inner = broker(QueueBinding::new(QUEUE, "events", QUEUE)).await;
    let flaky = Arc::new(FlakyBroker {
        inner: inner.clone(),
        opened: AtomicUsize::new(0),
    });
    let handler = RecordingHandler::new("vehicles");
    let pipeline = EventPipeline::new(
        codec(),
        router(&handler),
        RetryCoordinator::new(QUEUE, policy(), DeadLetterTarget::Broker),
    );

    publish(&inner, VALID).await;
    let stats = run_for(flaky.clone(), Arc::new(pipeline), Duration::from_secs(5)).await;

    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(flaky.opened.load(Ordering::SeqCst), 2);
    assert_eq!(handler.call_count(), 1);
}
