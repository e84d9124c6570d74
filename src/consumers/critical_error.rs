//! Critical error alerts.
//!
//! Producers publish on `error.critical`; the queue is named for the
//! alerting side. Alerts without a message body carry nothing to act on
//! and fail validation.

use super::{ConsumerDefinition, ConsumerKind, ConsumerOptions, QueueConsumer};
use crate::codec::{EnvelopeCodec, EventSchema, LogicalField};
use crate::handlers::HandlerFactory;
use crate::router::TypeRouter;
use crate::topology::QueueBinding;

pub const QUEUE: &str = "alerts.critical";
pub const ROUTING_KEY: &str = "error.critical";
pub const EVENT_TYPE: &str = "criticalerror";
pub const HANDLER: &str = "critical-error";

pub fn definition(options: &ConsumerOptions, handlers: &HandlerFactory) -> ConsumerDefinition {
    let binding = QueueBinding::new(options.queue_or(QUEUE), &options.exchange, ROUTING_KEY);
    let codec =
        EnvelopeCodec::new().with_schema(EventSchema::new(EVENT_TYPE, &[LogicalField::Content]));

    let mut router = TypeRouter::new();
    router.register(EVENT_TYPE, handlers(HANDLER));

    ConsumerDefinition {
        kind: ConsumerKind::CriticalError,
        queues: vec![QueueConsumer::new(binding, codec, router)],
        prefetch: options.prefetch,
        retry: options.retry.clone(),
    }
}
