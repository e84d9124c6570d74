//! AMQP (RabbitMQ) broker implementation.
//!
//! One connection per process (pool of size 1), one channel per consumer
//! runtime. Requeues are performed by republishing to the consumer's own
//! queue with an incremented `x-retry-count` header, because classic queues
//! do not count reject-with-requeue redeliveries. Dead letters carrying an
//! error are republished to the queue's dead-letter exchange with an
//! `x-last-error` header, since a plain reject cannot annotate the message.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::DashMap;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, ByteArray, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Consumer,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    Broker, BusError, DeliverySource, Disposition, ExchangeDecl, ExchangeKind, HeaderValue,
    Headers, InboundMessage, OutboundMessage, QueueDecl, Result, DEAD_LETTER_EXCHANGE_ARG,
    DEAD_LETTER_ROUTING_KEY_ARG,
};
use crate::retry::{LAST_ERROR_HEADER, RETRY_COUNT_HEADER};

/// Header preserving the exchange of a republished (retried) message.
pub const ORIGINAL_EXCHANGE_HEADER: &str = "x-original-exchange";
/// Header preserving the routing key of a republished (retried) message.
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";

/// Maximum publish attempts before giving up.
const MAX_PUBLISH_RETRIES: usize = 5;

/// Dead-letter exchange and routing key a queue was declared with.
#[derive(Debug, Clone)]
struct DeadLetterRoute {
    exchange: String,
    /// `None` keeps the message's own routing key.
    routing_key: Option<String>,
}

/// RabbitMQ broker over a single shared connection.
pub struct AmqpBroker {
    pool: Pool,
    url: String,
    dead_letter_routes: DashMap<String, DeadLetterRoute>,
}

impl AmqpBroker {
    /// Connect to RabbitMQ. Fails fast if the broker is unreachable.
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let manager = Manager::new(url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(1)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;
        drop(conn);

        info!(url = %redact_url(&url), "Connected to AMQP");

        Ok(Self {
            pool,
            url,
            dead_letter_routes: DashMap::new(),
        })
    }

    /// Open a channel on the shared connection.
    ///
    /// The pool transparently replaces a broken connection, which is how a
    /// runtime reconnects after a mid-run connection loss.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map a declaration error, surfacing argument conflicts distinctly.
fn declare_error(kind: &'static str, name: &str, e: lapin::Error) -> BusError {
    let detail = e.to_string();
    // RabbitMQ answers conflicting redeclarations with channel error 406.
    if detail.contains("PRECONDITION_FAILED") {
        BusError::PreconditionFailed {
            kind,
            name: name.to_string(),
            detail,
        }
    } else {
        BusError::Declare(format!("Failed to declare {} '{}': {}", kind, name, detail))
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// Strip credentials before logging a broker URL.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<()> {
        let channel = self.get_channel().await?;
        channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("exchange", &exchange.name, e))?;

        debug!(exchange = %exchange.name, kind = %exchange.kind, "Declared exchange");
        let _ = channel.close(200, "declared").await;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDecl) -> Result<()> {
        let mut arguments = FieldTable::default();
        for (key, value) in &queue.arguments {
            arguments.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        let channel = self.get_channel().await?;
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| declare_error("queue", &queue.name, e))?;

        if let Some(exchange) = queue.arguments.get(DEAD_LETTER_EXCHANGE_ARG) {
            self.dead_letter_routes.insert(
                queue.name.clone(),
                DeadLetterRoute {
                    exchange: exchange.clone(),
                    routing_key: queue.arguments.get(DEAD_LETTER_ROUTING_KEY_ARG).cloned(),
                },
            );
        }

        debug!(queue = %queue.name, arguments = ?queue.arguments, "Declared queue");
        let _ = channel.close(200, "declared").await;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.get_channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %queue,
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        let _ = channel.close(200, "declared").await;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliverySource>> {
        let channel = self.get_channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        // Confirms for retry republishing on this channel
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to enable confirms: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Consumer started");

        Ok(Box::new(AmqpDeliverySource {
            channel,
            consumer,
            queue: queue.to_string(),
            dead_letter: self.dead_letter_routes.get(queue).map(|r| r.value().clone()),
        }))
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(exchange = %message.exchange, routing_key = %message.routing_key))]
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_PUBLISH_RETRIES)
            .with_jitter()
            .build();

        let properties = persistent_properties(&message.headers);
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Get fresh channel for each attempt (handles reconnection)
            let channel = match self.get_channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_PUBLISH_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            if let Err(e) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                last_error = Some(BusError::Publish(format!("Failed to enable confirms: {}", e)));
                continue;
            }

            let result = publish_confirmed(
                &channel,
                &message.exchange,
                &message.routing_key,
                &message.body,
                properties.clone(),
            )
            .await;
            let _ = channel.close(200, "published").await;

            match result {
                Ok(()) => {
                    debug!("Published message");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_PUBLISH_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }

    async fn close(&self) -> Result<()> {
        if let Ok(conn) = self.pool.get().await {
            if let Err(e) = conn.close(200, "shutdown").await {
                warn!(error = %e, "Error closing AMQP connection");
            }
        }
        self.pool.close();
        info!("AMQP connection closed");
        Ok(())
    }
}

fn persistent_properties(headers: &Headers) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2); // persistent

    if headers.is_empty() {
        properties
    } else {
        properties.with_headers(headers_to_field_table(headers))
    }
}

async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<()> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await
        .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
        .await
        .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

    if confirm.is_nack() {
        return Err(BusError::Publish("Broker nacked publish".to_string()));
    }
    Ok(())
}

/// Consumer channel bound to one RabbitMQ queue.
pub struct AmqpDeliverySource {
    channel: Channel,
    consumer: Consumer,
    queue: String,
    dead_letter: Option<DeadLetterRoute>,
}

impl AmqpDeliverySource {
    /// Republish a failed message to this queue with the next attempt count,
    /// then ack the original.
    async fn republish(&self, message: &InboundMessage, next_attempt: u32) -> Result<()> {
        let mut headers = message.headers.clone();
        headers.insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::from(next_attempt));
        headers
            .entry(ORIGINAL_EXCHANGE_HEADER.to_string())
            .or_insert_with(|| HeaderValue::from(message.exchange.as_str()));
        headers
            .entry(ORIGINAL_ROUTING_KEY_HEADER.to_string())
            .or_insert_with(|| HeaderValue::from(message.routing_key.as_str()));

        // Default exchange routes by queue name, so only this queue sees the retry.
        publish_confirmed(
            &self.channel,
            "",
            &self.queue,
            &message.body,
            persistent_properties(&headers),
        )
        .await?;

        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Settle {
                tag: message.delivery_tag,
                message: e.to_string(),
            })
    }

    /// Publish a copy carrying `last_error` to the dead-letter exchange,
    /// then ack the original.
    async fn forward_dead_letter(
        &self,
        message: &InboundMessage,
        route: &DeadLetterRoute,
        last_error: &str,
    ) -> Result<()> {
        let mut headers = message.headers.clone();
        headers.insert(LAST_ERROR_HEADER.to_string(), HeaderValue::from(last_error));
        headers
            .entry(ORIGINAL_EXCHANGE_HEADER.to_string())
            .or_insert_with(|| HeaderValue::from(message.exchange.as_str()));
        headers
            .entry(ORIGINAL_ROUTING_KEY_HEADER.to_string())
            .or_insert_with(|| HeaderValue::from(message.routing_key.as_str()));

        let routing_key = route.routing_key.as_deref().unwrap_or(&message.routing_key);
        publish_confirmed(
            &self.channel,
            &route.exchange,
            routing_key,
            &message.body,
            persistent_properties(&headers),
        )
        .await?;

        self.channel
            .basic_ack(message.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Settle {
                tag: message.delivery_tag,
                message: e.to_string(),
            })
    }

    async fn reject(&self, tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::Settle {
                tag,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl DeliverySource for AmqpDeliverySource {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<Result<InboundMessage>> {
        match self.consumer.next().await? {
            Ok(delivery) => {
                let mut headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(field_table_to_headers)
                    .unwrap_or_default();

                let exchange = headers
                    .remove(ORIGINAL_EXCHANGE_HEADER)
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| delivery.exchange.as_str().to_string());
                let routing_key = headers
                    .remove(ORIGINAL_ROUTING_KEY_HEADER)
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| delivery.routing_key.as_str().to_string());

                Some(Ok(InboundMessage {
                    delivery_tag: delivery.delivery_tag,
                    exchange,
                    routing_key,
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                    headers,
                }))
            }
            Err(e) => Some(Err(BusError::Subscribe(format!(
                "Consumer delivery error: {}",
                e
            )))),
        }
    }

    async fn settle(&mut self, message: &InboundMessage, disposition: Disposition) -> Result<()> {
        let tag = message.delivery_tag;
        match disposition {
            Disposition::Ack => self
                .channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| BusError::Settle {
                    tag,
                    message: e.to_string(),
                }),
            Disposition::DeadLetter => self.reject(tag, false).await,
            Disposition::Requeue { next_attempt } => {
                match self.republish(message, next_attempt).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // Broker requeue keeps the message; the count is lost
                        // but x-death / x-delivery-count may still apply.
                        warn!(
                            queue = %self.queue,
                            delivery_tag = tag,
                            error = %e,
                            "Retry republish failed, falling back to broker requeue"
                        );
                        self.reject(tag, true).await
                    }
                }
            }
        }
    }

    async fn dead_letter(&mut self, message: &InboundMessage, last_error: &str) -> Result<()> {
        let tag = message.delivery_tag;
        let Some(route) = &self.dead_letter else {
            return self.reject(tag, false).await;
        };

        match self.forward_dead_letter(message, route, last_error).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A plain reject still reaches the DLQ, without the error.
                warn!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    error = %e,
                    "Dead-letter republish failed, falling back to broker reject"
                );
                self.reject(tag, false).await
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.channel
            .close(200, "consumer stopped")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))
    }
}

// ============================================================================
// Header Conversion
// ============================================================================

fn field_table_to_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), amqp_to_header(v)))
        .collect()
}

fn amqp_to_header(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
        AMQPValue::Float(f) => HeaderValue::Float(f64::from(*f)),
        AMQPValue::Double(f) => HeaderValue::Float(*f),
        AMQPValue::DecimalValue(d) => {
            HeaderValue::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
        }
        AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
        AMQPValue::LongString(s) => {
            HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(a) => {
            HeaderValue::Array(a.as_slice().iter().map(amqp_to_header).collect())
        }
        AMQPValue::Timestamp(t) => HeaderValue::Timestamp(*t),
        AMQPValue::FieldTable(t) => HeaderValue::Table(field_table_to_headers(t)),
        AMQPValue::ByteArray(b) => HeaderValue::Bytes(b.as_slice().to_vec()),
        AMQPValue::Void => HeaderValue::Void,
    }
}

fn headers_to_field_table(headers: &Headers) -> FieldTable {
    let inner: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(k, v)| (ShortString::from(k.clone()), header_to_amqp(v)))
        .collect();
    FieldTable::from(inner)
}

fn header_to_amqp(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
        HeaderValue::Float(f) => AMQPValue::Double(*f),
        HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
        HeaderValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
        HeaderValue::Timestamp(t) => AMQPValue::Timestamp(*t),
        HeaderValue::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(header_to_amqp).collect::<Vec<_>>()))
        }
        HeaderValue::Table(t) => AMQPValue::FieldTable(headers_to_field_table(t)),
        HeaderValue::Void => AMQPValue::Void,
    }
}
