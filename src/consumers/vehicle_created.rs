//! Vehicle creation events.
//!
//! No broker DLQ: exhausted or invalid events go to the dead-letter store
//! and are replayed by the recovery sweep.

use super::{ConsumerDefinition, ConsumerKind, ConsumerOptions, QueueConsumer};
use crate::codec::{EnvelopeCodec, EventSchema, LogicalField};
use crate::handlers::HandlerFactory;
use crate::router::TypeRouter;
use crate::topology::QueueBinding;

pub const QUEUE: &str = "vehicle.created";
pub const ROUTING_KEY: &str = "vehicle.created";
pub const EVENT_TYPE: &str = "vehiclecreated";
pub const HANDLER: &str = "vehicle-created";

pub fn definition(options: &ConsumerOptions, handlers: &HandlerFactory) -> ConsumerDefinition {
    let binding = QueueBinding::new(options.queue_or(QUEUE), &options.exchange, ROUTING_KEY);
    let codec =
        EnvelopeCodec::new().with_schema(EventSchema::new(EVENT_TYPE, &[LogicalField::VehicleId]));

    let mut router = TypeRouter::new();
    router.register(EVENT_TYPE, handlers(HANDLER));

    ConsumerDefinition {
        kind: ConsumerKind::VehicleCreated,
        queues: vec![QueueConsumer::new(binding, codec, router)],
        prefetch: options.prefetch,
        retry: options.retry.clone(),
    }
}
