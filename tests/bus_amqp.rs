//! RabbitMQ broker adapter integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::Arc;
use std::time::Duration;

use relay::bus::{AmqpBroker, Broker, DeliverySource, Disposition, InboundMessage, OutboundMessage};
use relay::retry::{attempt_number, DEATH_HEADER, LAST_ERROR_HEADER};
use relay::topology::{QueueBinding, TopologyError, TopologyManager};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

async fn next(source: &mut Box<dyn DeliverySource>) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(10), source.next_delivery())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Delivery stream ended")
        .expect("Delivery error")
}

async fn setup(url: &str, binding: &QueueBinding) -> Arc<AmqpBroker> {
    let broker = Arc::new(AmqpBroker::connect(url).await.expect("Failed to connect"));
    TopologyManager::new(broker.clone())
        .declare(std::slice::from_ref(binding))
        .await
        .expect("Failed to declare topology");
    broker
}

#[tokio::test]
async fn test_declare_is_idempotent_and_detects_conflicts() {
    let (_container, url) = start_rabbitmq().await;
    let queue = unique("orders");
    let binding = QueueBinding::new(&queue, "events", "order.placed").with_default_dead_letter();

    let broker = setup(&url, &binding).await;
    let topology = TopologyManager::new(broker.clone());

    topology
        .declare(&[binding.clone()])
        .await
        .expect("Identical redeclaration should succeed");

    // Same queue without dead-letter arguments conflicts with the existing one
    let conflicting = QueueBinding::new(&queue, "events", "order.placed");
    let err = topology.declare(&[conflicting]).await.unwrap_err();
    assert!(
        matches!(err, TopologyError::Conflict { kind: "queue", .. }),
        "unexpected error: {}",
        err
    );

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_publish_consume_ack() {
    let (_container, url) = start_rabbitmq().await;
    let queue = unique("users");
    let binding = QueueBinding::new(&queue, "events", &queue);
    let broker = setup(&url, &binding).await;

    let mut source = broker.consume(&queue, "test", 1).await.unwrap();
    broker
        .publish(OutboundMessage::new("events", &queue, br#"{"eventType":"x"}"#.to_vec()))
        .await
        .unwrap();

    let message = next(&mut source).await;
    assert_eq!(message.body, br#"{"eventType":"x"}"#);
    assert_eq!(message.exchange, "events");
    assert_eq!(attempt_number(&message.headers), 0);

    source.settle(&message, Disposition::Ack).await.unwrap();
    source.close().await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_requeue_carries_attempt_count_and_provenance() {
    let (_container, url) = start_rabbitmq().await;
    let queue = unique("payments");
    let binding = QueueBinding::new(&queue, "events", "payment.completed");
    let broker = setup(&url, &binding).await;

    let mut source = broker.consume(&queue, "test", 1).await.unwrap();
    broker
        .publish(OutboundMessage::new("events", "payment.completed", b"{}".to_vec()))
        .await
        .unwrap();

    let first = next(&mut source).await;
    source
        .settle(&first, Disposition::Requeue { next_attempt: 1 })
        .await
        .unwrap();

    let second = next(&mut source).await;
    assert_eq!(attempt_number(&second.headers), 1);
    assert_eq!(second.exchange, "events");
    assert_eq!(second.routing_key, "payment.completed");

    source
        .settle(&second, Disposition::Requeue { next_attempt: 2 })
        .await
        .unwrap();
    let third = next(&mut source).await;
    assert_eq!(attempt_number(&third.headers), 2);

    source.settle(&third, Disposition::Ack).await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_dead_letter_routes_to_dlq() {
    let (_container, url) = start_rabbitmq().await;
    let queue = unique("vehicles");
    let binding = QueueBinding::new(&queue, "events", &queue).with_default_dead_letter();
    let dlq = binding.dead_letter.clone().unwrap().queue;
    let broker = setup(&url, &binding).await;

    let mut source = broker.consume(&queue, "test", 1).await.unwrap();
    broker
        .publish(OutboundMessage::new("events", &queue, b"poison".to_vec()))
        .await
        .unwrap();

    let message = next(&mut source).await;
    source.settle(&message, Disposition::DeadLetter).await.unwrap();

    let mut dead = broker.consume(&dlq, "test-dlq", 1).await.unwrap();
    let forwarded = next(&mut dead).await;
    assert_eq!(forwarded.body, b"poison");
    let death = forwarded.headers[DEATH_HEADER].as_array().unwrap()[0]
        .as_table()
        .unwrap()
        .clone();
    assert_eq!(death["reason"].as_str(), Some("rejected"));
    assert_eq!(death["count"].as_count(), Some(1));
    // Rejected deaths do not consume the retry budget of a replay
    assert_eq!(attempt_number(&forwarded.headers), 0);

    dead.settle(&forwarded, Disposition::Ack).await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_dead_letter_with_error_reaches_dlq_annotated() {
    let (_container, url) = start_rabbitmq().await;
    let queue = unique("payments");
    let binding = QueueBinding::new(&queue, "events", &queue).with_default_dead_letter();
    let dlq = binding.dead_letter.clone().unwrap().queue;
    let broker = setup(&url, &binding).await;

    let mut source = broker.consume(&queue, "test", 1).await.unwrap();
    broker
        .publish(OutboundMessage::new("events", &queue, b"{}".to_vec()))
        .await
        .unwrap();

    let message = next(&mut source).await;
    source.dead_letter(&message, "ledger timeout").await.unwrap();

    let mut dead = broker.consume(&dlq, "test-dlq", 1).await.unwrap();
    let forwarded = next(&mut dead).await;
    assert_eq!(forwarded.body, b"{}");
    assert_eq!(forwarded.routing_key, queue);
    assert_eq!(
        forwarded.headers.get(LAST_ERROR_HEADER).and_then(|v| v.as_str()),
        Some("ledger timeout")
    );

    dead.settle(&forwarded, Disposition::Ack).await.unwrap();
    broker.close().await.unwrap();
}
