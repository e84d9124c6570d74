//! User registration events.
//!
//! Welcome flows downstream depend on the address, so an event without an
//! email is rejected at decode time and never reaches the handler.

use super::{ConsumerDefinition, ConsumerKind, ConsumerOptions, QueueConsumer};
use crate::codec::{EnvelopeCodec, EventSchema, LogicalField};
use crate::handlers::HandlerFactory;
use crate::router::TypeRouter;
use crate::topology::QueueBinding;

pub const QUEUE: &str = "user.registered";
pub const ROUTING_KEY: &str = "user.registered";
pub const EVENT_TYPE: &str = "userregistered";
pub const HANDLER: &str = "user-registration";

pub fn definition(options: &ConsumerOptions, handlers: &HandlerFactory) -> ConsumerDefinition {
    let binding = QueueBinding::new(options.queue_or(QUEUE), &options.exchange, ROUTING_KEY)
        .with_default_dead_letter();
    let codec = EnvelopeCodec::new().with_schema(EventSchema::new(EVENT_TYPE, &[LogicalField::Email]));

    let mut router = TypeRouter::new();
    router.register(EVENT_TYPE, handlers(HANDLER));

    ConsumerDefinition {
        kind: ConsumerKind::UserRegistration,
        queues: vec![QueueConsumer::new(binding, codec, router)],
        prefetch: options.prefetch,
        retry: options.retry.clone(),
    }
}
