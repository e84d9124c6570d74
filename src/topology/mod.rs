//! Broker topology declaration.
//!
//! Declares, per binding, the dead-letter exchange and queue (when
//! configured) before the primary queue that points at them, then the
//! topic exchange, the primary queue and its binding. Running it against a
//! broker that already has the same topology is a no-op; conflicting
//! arguments on an existing entity fail with `TopologyError::Conflict`.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::bus::{
    Broker, BusError, ExchangeDecl, ExchangeKind, QueueDecl, DEAD_LETTER_EXCHANGE_ARG,
    DEAD_LETTER_ROUTING_KEY_ARG,
};

/// Errors from declaring topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Existing entity has different parameters. Never run against it.
    #[error("Topology conflict on {kind} '{name}': {detail}")]
    Conflict {
        kind: &'static str,
        name: String,
        detail: String,
    },

    #[error("Topology declaration failed: {0}")]
    Broker(BusError),
}

impl From<BusError> for TopologyError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::PreconditionFailed { kind, name, detail } => {
                TopologyError::Conflict { kind, name, detail }
            }
            other => TopologyError::Broker(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TopologyError>;

/// Broker-native dead-letter routing for a queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeadLetterBinding {
    /// Direct exchange receiving rejected messages.
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

/// One consumer queue bound to a topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub dead_letter: Option<DeadLetterBinding>,
}

impl QueueBinding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            dead_letter: None,
        }
    }

    /// Attach a dead-letter exchange named `{exchange}.dlx` and a DLQ named
    /// `{queue}.dlq`, routed by the queue name.
    pub fn with_default_dead_letter(self) -> Self {
        let dead_letter = DeadLetterBinding {
            exchange: format!("{}.dlx", self.exchange),
            routing_key: self.queue.clone(),
            queue: format!("{}.dlq", self.queue),
        };
        self.with_dead_letter(dead_letter)
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterBinding) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Declaration of the primary queue, including dead-letter arguments.
    pub fn queue_decl(&self) -> QueueDecl {
        let decl = QueueDecl::durable(&self.queue);
        match &self.dead_letter {
            Some(dl) => decl
                .with_argument(DEAD_LETTER_EXCHANGE_ARG, &dl.exchange)
                .with_argument(DEAD_LETTER_ROUTING_KEY_ARG, &dl.routing_key),
            None => decl,
        }
    }
}

/// Declares queue bindings on a broker.
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Declare every binding. Stops at the first failure.
    pub async fn declare(&self, bindings: &[QueueBinding]) -> Result<()> {
        let mut exchanges: HashSet<&str> = HashSet::new();
        let mut queues: HashSet<&str> = HashSet::new();

        for binding in bindings {
            if let Some(dl) = &binding.dead_letter {
                if exchanges.insert(&dl.exchange) {
                    self.broker
                        .declare_exchange(&ExchangeDecl {
                            name: dl.exchange.clone(),
                            kind: ExchangeKind::Direct,
                            durable: true,
                        })
                        .await?;
                }
                if queues.insert(&dl.queue) {
                    self.broker
                        .declare_queue(&QueueDecl::durable(&dl.queue))
                        .await?;
                }
                self.broker
                    .bind_queue(&dl.queue, &dl.exchange, &dl.routing_key)
                    .await?;
            }

            if exchanges.insert(&binding.exchange) {
                self.broker
                    .declare_exchange(&ExchangeDecl {
                        name: binding.exchange.clone(),
                        kind: ExchangeKind::Topic,
                        durable: true,
                    })
                    .await?;
            }
            if queues.insert(&binding.queue) {
                self.broker.declare_queue(&binding.queue_decl()).await?;
            }
            self.broker
                .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
                .await?;

            info!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                dead_letter_queue = binding.dead_letter.as_ref().map(|d| d.queue.as_str()).unwrap_or(""),
                "Declared queue binding"
            );
        }

        Ok(())
    }
}
