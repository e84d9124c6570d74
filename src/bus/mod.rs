//! Broker abstraction for consumer runtimes.
//!
//! This module contains:
//! - `Broker` trait: topology declaration, consuming and publishing
//! - `DeliverySource` trait: one consumer channel bound to one queue
//! - `InboundMessage` / `Headers`: broker-agnostic delivery representation
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Declaration failed: {0}")]
    Declare(String),

    #[error("Declaration conflicts with existing {kind} '{name}': {detail}")]
    PreconditionFailed {
        kind: &'static str,
        name: String,
        detail: String,
    },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Settle failed for delivery {tag}: {message}")]
    Settle { tag: u64, message: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Headers
// ============================================================================

/// Header table carried by a delivery.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Broker-agnostic header value.
///
/// Mirrors the AMQP field value types closely enough to carry `x-death`
/// history (an array of tables) without loss.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(u64),
    Array(Vec<HeaderValue>),
    Table(Headers),
    Void,
}

impl HeaderValue {
    /// Interpret the value as a non-negative count.
    ///
    /// Integers are taken as-is; strings are parsed (some producers write
    /// counters as text).
    pub fn as_count(&self) -> Option<u32> {
        match self {
            HeaderValue::Int(n) if *n >= 0 => u32::try_from(*n).ok(),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            HeaderValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            HeaderValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HeaderValue]> {
        match self {
            HeaderValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Headers> {
        match self {
            HeaderValue::Table(table) => Some(table),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A single delivery received from the broker.
///
/// Owned by the consumer runtime for the duration of one processing attempt
/// and discarded once acknowledged or rejected.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Handle used to ack/reject exactly this delivery on its channel.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// Broker-side redelivery flag.
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub headers: Headers,
}

/// Message to publish to an exchange.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Final acknowledgement decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing succeeded; remove from the queue.
    Ack,
    /// Redeliver with an incremented attempt count.
    ///
    /// `next_attempt` is the attempt number the redelivery should carry.
    Requeue { next_attempt: u32 },
    /// Reject without requeue; the broker forwards to the queue's
    /// dead-letter exchange if one is configured.
    DeadLetter,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Ack => write!(f, "ack"),
            Disposition::Requeue { next_attempt } => write!(f, "requeue(attempt={})", next_attempt),
            Disposition::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// Exchange types used by the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDecl {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Queue declaration.
///
/// Only string-valued arguments are needed by this crate
/// (`x-dead-letter-exchange`, `x-dead-letter-routing-key`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDecl {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, String>,
}

impl QueueDecl {
    /// Durable, shared, non-auto-delete queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Header argument naming the dead-letter exchange of a queue.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Header argument naming the dead-letter routing key of a queue.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

// ============================================================================
// Traits
// ============================================================================

/// A consumer channel bound to a single queue.
///
/// Deliveries are pulled one at a time; at most `prefetch` unsettled
/// deliveries are outstanding on the channel.
#[async_trait]
pub trait DeliverySource: Send {
    /// Queue this source consumes from.
    fn queue(&self) -> &str;

    /// Wait for the next delivery.
    ///
    /// Returns `None` when the underlying stream ended (channel or
    /// connection closed); the caller decides whether to reconnect.
    async fn next_delivery(&mut self) -> Option<Result<InboundMessage>>;

    /// Acknowledge or reject a delivery according to `disposition`.
    async fn settle(&mut self, message: &InboundMessage, disposition: Disposition) -> Result<()>;

    /// Dead-letter a delivery, recording `last_error` on the forwarded copy.
    ///
    /// Sources that cannot annotate the message fall back to a plain
    /// reject.
    async fn dead_letter(&mut self, message: &InboundMessage, last_error: &str) -> Result<()> {
        let _ = last_error;
        self.settle(message, Disposition::DeadLetter).await
    }

    /// Cancel the consumer and close the channel.
    async fn close(&mut self) -> Result<()>;
}

/// Connection to a message broker shared by all runtimes of a process.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via lapin
/// - `MemoryBroker`: in-process topic broker for tests and dry runs
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange. Identical redeclaration is a no-op; a
    /// conflicting one fails with `BusError::PreconditionFailed`.
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<()>;

    /// Declare a queue. Same idempotence rules as exchanges.
    async fn declare_queue(&self, queue: &QueueDecl) -> Result<()>;

    /// Bind a queue to an exchange with a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Open a new channel and start consuming from `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliverySource>>;

    /// Publish a message and wait for the broker to confirm it.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Close the shared connection. Called once after every runtime stopped.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests;
