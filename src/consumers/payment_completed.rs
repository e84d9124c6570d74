//! Payment completion events.

use super::{ConsumerDefinition, ConsumerKind, ConsumerOptions, QueueConsumer};
use crate::codec::{EnvelopeCodec, EventSchema, LogicalField};
use crate::handlers::HandlerFactory;
use crate::router::TypeRouter;
use crate::topology::QueueBinding;

pub const QUEUE: &str = "payment.completed";
pub const ROUTING_KEY: &str = "payment.completed";
pub const EVENT_TYPE: &str = "paymentcompleted";
pub const HANDLER: &str = "payment-completed";

pub fn definition(options: &ConsumerOptions, handlers: &HandlerFactory) -> ConsumerDefinition {
    let binding = QueueBinding::new(options.queue_or(QUEUE), &options.exchange, ROUTING_KEY)
        .with_default_dead_letter();
    let codec = EnvelopeCodec::new().with_schema(EventSchema::new(
        EVENT_TYPE,
        &[LogicalField::PaymentId, LogicalField::Amount],
    ));

    let mut router = TypeRouter::new();
    router.register(EVENT_TYPE, handlers(HANDLER));

    ConsumerDefinition {
        kind: ConsumerKind::PaymentCompleted,
        queues: vec![QueueConsumer::new(binding, codec, router)],
        prefetch: options.prefetch,
        retry: options.retry.clone(),
    }
}
