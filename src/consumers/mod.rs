//! Concrete consumer definitions.
//!
//! Each consumer is a set of queue bindings, each with the codec schema and
//! router its events need. Handlers come from a `HandlerFactory` so the same
//! definitions run against HTTP downstreams, loggers or test doubles.
//!
//! | consumer | queue(s) | dead-letter |
//! |---|---|---|
//! | user registration | `user.registered` | broker DLX |
//! | payment completed | `payment.completed` | broker DLX |
//! | vehicle created | `vehicle.created` | store |
//! | critical error | `alerts.critical` | store |
//! | notifications | `notifications.{email,sms,push}` | broker DLX |
//! | | `notifications.general` | store |

pub mod critical_error;
pub mod notifications;
pub mod payment_completed;
pub mod user_registration;
pub mod vehicle_created;

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::codec::EnvelopeCodec;
use crate::dlq::DeadLetterStore;
use crate::handlers::HandlerFactory;
use crate::retry::{DeadLetterTarget, RetryPolicy};
use crate::router::TypeRouter;
use crate::topology::QueueBinding;

/// Topic exchange the producers publish to.
pub const DEFAULT_EXCHANGE: &str = "events";

/// The five consumers this crate ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    UserRegistration,
    PaymentCompleted,
    VehicleCreated,
    CriticalError,
    Notifications,
}

impl ConsumerKind {
    pub const ALL: [ConsumerKind; 5] = [
        ConsumerKind::UserRegistration,
        ConsumerKind::PaymentCompleted,
        ConsumerKind::VehicleCreated,
        ConsumerKind::CriticalError,
        ConsumerKind::Notifications,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ConsumerKind::UserRegistration => "user_registration",
            ConsumerKind::PaymentCompleted => "payment_completed",
            ConsumerKind::VehicleCreated => "vehicle_created",
            ConsumerKind::CriticalError => "critical_error",
            ConsumerKind::Notifications => "notifications",
        }
    }

    /// Build the definition for this consumer.
    pub fn build(&self, options: &ConsumerOptions, handlers: &HandlerFactory) -> ConsumerDefinition {
        match self {
            ConsumerKind::UserRegistration => user_registration::definition(options, handlers),
            ConsumerKind::PaymentCompleted => payment_completed::definition(options, handlers),
            ConsumerKind::VehicleCreated => vehicle_created::definition(options, handlers),
            ConsumerKind::CriticalError => critical_error::definition(options, handlers),
            ConsumerKind::Notifications => notifications::definition(options, handlers),
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-deployment knobs for a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub exchange: String,
    /// Queue name override. For notifications this is the queue prefix.
    pub queue: Option<String>,
    pub prefetch: u16,
    pub retry: RetryPolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: None,
            prefetch: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerOptions {
    pub(crate) fn queue_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.queue.as_deref().filter(|q| !q.is_empty()).unwrap_or(default)
    }
}

/// One bound queue with the codec and router its events go through.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    pub binding: QueueBinding,
    pub codec: Arc<EnvelopeCodec>,
    pub router: Arc<TypeRouter>,
}

impl QueueConsumer {
    pub fn new(binding: QueueBinding, codec: EnvelopeCodec, router: TypeRouter) -> Self {
        Self {
            binding,
            codec: Arc::new(codec),
            router: Arc::new(router),
        }
    }

    /// Broker DLX when the queue has one, the store otherwise.
    pub fn dead_letter_target(&self, store: &Arc<DeadLetterStore>) -> DeadLetterTarget {
        if self.binding.dead_letter.is_some() {
            DeadLetterTarget::Broker
        } else {
            DeadLetterTarget::Store(Arc::clone(store))
        }
    }
}

/// Everything the host needs to run one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerDefinition {
    pub kind: ConsumerKind,
    pub queues: Vec<QueueConsumer>,
    pub prefetch: u16,
    pub retry: RetryPolicy,
}

impl ConsumerDefinition {
    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.queues.iter().map(|q| q.binding.clone()).collect()
    }
}

#[cfg(test)]
mod tests;
