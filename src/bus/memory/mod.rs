//! In-memory broker for tests and local dry runs.
//!
//! Emulates the parts of AMQP 0-9-1 the consumer runtimes depend on:
//! - topic / direct / fanout exchanges with queue bindings
//! - idempotent declarations with conflict detection
//! - per-channel prefetch and delivery tags
//! - reject-with-requeue (redelivered flag, `x-delivery-count` header)
//! - reject-without-requeue routed through `x-dead-letter-exchange`,
//!   recording `x-death` history like RabbitMQ does

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use super::{
    Broker, BusError, DeliverySource, Disposition, ExchangeDecl, ExchangeKind, HeaderValue,
    Headers, InboundMessage, OutboundMessage, QueueDecl, Result, DEAD_LETTER_EXCHANGE_ARG,
    DEAD_LETTER_ROUTING_KEY_ARG,
};
use crate::retry::{DEATH_HEADER, DELIVERY_COUNT_HEADER, LAST_ERROR_HEADER};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    body: Vec<u8>,
    headers: Headers,
}

impl StoredMessage {
    fn from_outbound(message: OutboundMessage) -> Self {
        Self {
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: false,
            body: message.body,
            headers: message.headers,
        }
    }
}

struct QueueState {
    decl: QueueDecl,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDecl>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    closed: bool,
}

impl BrokerState {
    /// Route a message through an exchange to every matching queue.
    ///
    /// Unroutable messages are dropped, as AMQP does without `mandatory`.
    fn route(&mut self, message: StoredMessage) -> Result<usize> {
        let kind = self
            .exchanges
            .get(&message.exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BusError::NotFound(format!("exchange '{}'", message.exchange)))?;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange)
            .filter(|b| match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => b.pattern == message.routing_key,
                ExchangeKind::Topic => topic_matches(&message.routing_key, &b.pattern),
            })
            .map(|b| b.queue.clone())
            .collect();

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.ready.push_back(message.clone());
                state.notify.notify_one();
            }
        }

        if targets.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Message unroutable, dropped"
            );
        }
        Ok(targets.len())
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        let count = message
            .headers
            .get(DELIVERY_COUNT_HEADER)
            .and_then(HeaderValue::as_count)
            .unwrap_or(0);
        message
            .headers
            .insert(DELIVERY_COUNT_HEADER.to_string(), HeaderValue::from(count + 1));
        message.redelivered = true;

        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_front(message);
            state.notify.notify_one();
        }
    }

    /// Reject without requeue: forward to the queue's dead-letter exchange
    /// if one is configured, otherwise discard.
    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) -> Result<()> {
        let Some(decl) = self.queues.get(queue).map(|q| q.decl.clone()) else {
            return Ok(());
        };
        let Some(dlx) = decl.arguments.get(DEAD_LETTER_EXCHANGE_ARG).cloned() else {
            debug!(queue = %queue, "Rejected without dead-letter exchange, discarded");
            return Ok(());
        };

        record_death(&mut message, queue, "rejected");

        let routing_key = decl
            .arguments
            .get(DEAD_LETTER_ROUTING_KEY_ARG)
            .cloned()
            .unwrap_or_else(|| message.routing_key.clone());

        message.exchange = dlx;
        message.routing_key = routing_key;
        message.redelivered = false;
        self.route(message).map(|_| ())
    }
}

/// Prepend or update the `x-death` entry for `(queue, reason)`.
fn record_death(message: &mut StoredMessage, queue: &str, reason: &str) {
    let mut deaths: Vec<HeaderValue> = message
        .headers
        .get(DEATH_HEADER)
        .and_then(HeaderValue::as_array)
        .map(|a| a.to_vec())
        .unwrap_or_default();

    let existing = deaths.iter().position(|entry| {
        entry.as_table().is_some_and(|t| {
            t.get("queue").and_then(HeaderValue::as_str) == Some(queue)
                && t.get("reason").and_then(HeaderValue::as_str) == Some(reason)
        })
    });

    let mut entry = match existing {
        Some(idx) => match deaths.remove(idx) {
            HeaderValue::Table(t) => t,
            _ => Headers::new(),
        },
        None => {
            let mut t = Headers::new();
            t.insert("queue".to_string(), HeaderValue::from(queue));
            t.insert("reason".to_string(), HeaderValue::from(reason));
            t.insert(
                "exchange".to_string(),
                HeaderValue::from(message.exchange.as_str()),
            );
            t.insert(
                "routing-keys".to_string(),
                HeaderValue::Array(vec![HeaderValue::from(message.routing_key.as_str())]),
            );
            t
        }
    };

    let count = entry
        .get("count")
        .and_then(HeaderValue::as_count)
        .unwrap_or(0);
    entry.insert("count".to_string(), HeaderValue::from(count + 1));
    entry.insert(
        "time".to_string(),
        HeaderValue::Timestamp(chrono::Utc::now().timestamp().max(0) as u64),
    );

    // Most recent death first, as RabbitMQ orders it.
    deaths.insert(0, HeaderValue::Table(entry));
    message
        .headers
        .insert(DEATH_HEADER.to_string(), HeaderValue::Array(deaths));
    message
        .headers
        .entry("x-first-death-reason".to_string())
        .or_insert_with(|| HeaderValue::from(reason));
    message
        .headers
        .entry("x-first-death-queue".to_string())
        .or_insert_with(|| HeaderValue::from(queue));
}

/// Check if a routing key matches a topic binding pattern.
///
/// Words are dot-separated; `*` matches exactly one word, `#` matches zero
/// or more words.
pub fn topic_matches(routing_key: &str, pattern: &str) -> bool {
    let key: Vec<&str> = routing_key.split('.').collect();
    let pattern: Vec<&str> = pattern.split('.').collect();
    matches_words(&key, &pattern)
}

fn matches_words(key: &[&str], pattern: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Zero words, or consume one word and keep the '#'
            matches_words(key, rest) || (!key.is_empty() && matches_words(&key[1..], pattern))
        }
        Some((&"*", rest)) => !key.is_empty() && matches_words(&key[1..], rest),
        Some((word, rest)) => key.first() == Some(word) && matches_words(&key[1..], rest),
    }
}

/// In-process broker shared by all runtimes of a test or dry run.
#[derive(Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    consumers: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting (not delivered) in a queue.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.ready.len())
    }

    /// Remove and return every ready message of a queue.
    pub async fn drain(&self, queue: &str) -> Vec<InboundMessage> {
        let mut state = self.state.lock().await;
        let Some(q) = state.queues.get_mut(queue) else {
            return Vec::new();
        };
        q.ready
            .drain(..)
            .map(|m| InboundMessage {
                delivery_tag: 0,
                exchange: m.exchange,
                routing_key: m.routing_key,
                redelivered: m.redelivered,
                body: m.body,
                headers: m.headers,
            })
            .collect()
    }

    pub async fn exchange_count(&self) -> usize {
        self.state.lock().await.exchanges.len()
    }

    pub async fn queue_count(&self) -> usize {
        self.state.lock().await.queues.len()
    }

    pub async fn binding_count(&self) -> usize {
        self.state.lock().await.bindings.len()
    }

    /// Number of consumers opened over the broker's lifetime.
    pub fn consumers_opened(&self) -> usize {
        self.consumers.load(Ordering::SeqCst)
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(existing) => Err(BusError::PreconditionFailed {
                kind: "exchange",
                name: exchange.name.clone(),
                detail: format!(
                    "declared as {} (durable={}), requested {} (durable={})",
                    existing.kind, existing.durable, exchange.kind, exchange.durable
                ),
            }),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDecl) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.decl == *queue => Ok(()),
            Some(existing) => Err(BusError::PreconditionFailed {
                kind: "queue",
                name: queue.name.clone(),
                detail: format!(
                    "existing arguments {:?}, requested {:?}",
                    existing.decl.arguments, queue.arguments
                ),
            }),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        decl: queue.clone(),
                        ready: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::NotFound(format!("exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::NotFound(format!("queue '{}'", queue)));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliverySource>> {
        let notify = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(BusError::Connection("broker closed".to_string()));
            }
            state
                .queues
                .get(queue)
                .map(|q| Arc::clone(&q.notify))
                .ok_or_else(|| BusError::Subscribe(format!("queue '{}' not declared", queue)))?
        };

        self.consumers.fetch_add(1, Ordering::SeqCst);
        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Memory consumer started");

        Ok(Box::new(MemoryDeliverySource {
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
            prefetch,
            notify,
            unacked: HashMap::new(),
            next_tag: 0,
            closed: false,
        }))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Publish("broker closed".to_string()));
        }
        state.route(StoredMessage::from_outbound(message))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        info!("Memory broker closed");
        Ok(())
    }
}

/// Consumer channel over a `MemoryBroker` queue.
pub struct MemoryDeliverySource {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    prefetch: u16,
    notify: Arc<Notify>,
    unacked: HashMap<u64, StoredMessage>,
    next_tag: u64,
    closed: bool,
}

impl MemoryDeliverySource {
    fn take_unacked(&mut self, message: &InboundMessage) -> Result<StoredMessage> {
        self.unacked
            .remove(&message.delivery_tag)
            .ok_or_else(|| BusError::Settle {
                tag: message.delivery_tag,
                message: "unknown delivery tag".to_string(),
            })
    }
}

#[async_trait]
impl DeliverySource for MemoryDeliverySource {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<Result<InboundMessage>> {
        let notify = Arc::clone(&self.notify);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting the queue so a publish
            // between the check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed || self.closed {
                    return None;
                }

                let window_open =
                    self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch);
                if window_open {
                    if let Some(message) = state
                        .queues
                        .get_mut(&self.queue)
                        .and_then(|q| q.ready.pop_front())
                    {
                        self.next_tag += 1;
                        let tag = self.next_tag;
                        self.unacked.insert(tag, message.clone());
                        return Some(Ok(InboundMessage {
                            delivery_tag: tag,
                            exchange: message.exchange,
                            routing_key: message.routing_key,
                            redelivered: message.redelivered,
                            body: message.body,
                            headers: message.headers,
                        }));
                    }
                }
            }

            notified.await;
        }
    }

    async fn settle(&mut self, message: &InboundMessage, disposition: Disposition) -> Result<()> {
        let stored = self.take_unacked(message)?;

        let mut state = self.state.lock().await;
        match disposition {
            Disposition::Ack => {}
            Disposition::Requeue { .. } => state.requeue(&self.queue, stored),
            Disposition::DeadLetter => state.dead_letter(&self.queue, stored)?,
        }
        // Settling frees a prefetch slot
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&mut self, message: &InboundMessage, last_error: &str) -> Result<()> {
        let mut stored = self.take_unacked(message)?;
        stored
            .headers
            .insert(LAST_ERROR_HEADER.to_string(), HeaderValue::from(last_error));

        self.state.lock().await.dead_letter(&self.queue, stored)?;
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Unsettled deliveries go back to the queue, as on channel close.
        let mut state = self.state.lock().await;
        for (_, message) in self.unacked.drain() {
            let mut message = message;
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(message);
            }
        }
        self.notify.notify_one();
        debug!(queue = %self.queue, "Memory consumer closed");
        Ok(())
    }
}
