//! Notification dispatch.
//!
//! Three dedicated channel queues (email, sms, push) with broker DLQs, plus
//! a general queue bound to `notification.general`. Channel routing keys
//! never match the general binding, so every notification is dispatched once.
//! The general queue routes by category: any type containing `email`, `sms`
//! or `push` reaches that channel's handler.

use super::{ConsumerDefinition, ConsumerKind, ConsumerOptions, QueueConsumer};
use crate::codec::{EnvelopeCodec, EventSchema, LogicalField};
use crate::handlers::HandlerFactory;
use crate::router::TypeRouter;
use crate::topology::QueueBinding;

pub const QUEUE_PREFIX: &str = "notifications";
pub const ROUTING_KEY_PREFIX: &str = "notification";
pub const GENERAL_QUEUE: &str = "general";
pub const CHANNELS: [&str; 3] = ["email", "sms", "push"];

const CHANNEL_FIELDS: &[LogicalField] = &[LogicalField::Recipient, LogicalField::Content];

fn codec() -> EnvelopeCodec {
    CHANNELS.iter().fold(EnvelopeCodec::new(), |codec, channel| {
        codec.with_schema(EventSchema::new(channel, CHANNEL_FIELDS))
    })
}

pub fn definition(options: &ConsumerOptions, handlers: &HandlerFactory) -> ConsumerDefinition {
    let prefix = options.queue_or(QUEUE_PREFIX);
    let mut queues = Vec::with_capacity(CHANNELS.len() + 1);
    let mut general = TypeRouter::new();

    for channel in CHANNELS {
        let handler = handlers(channel);

        let binding = QueueBinding::new(
            format!("{}.{}", prefix, channel),
            &options.exchange,
            format!("{}.{}", ROUTING_KEY_PREFIX, channel),
        )
        .with_default_dead_letter();
        let mut router = TypeRouter::new();
        router.register(channel, handler.clone());
        queues.push(QueueConsumer::new(binding, codec(), router));

        general.register_category(channel, handler);
    }

    let binding = QueueBinding::new(
        format!("{}.{}", prefix, GENERAL_QUEUE),
        &options.exchange,
        format!("{}.{}", ROUTING_KEY_PREFIX, GENERAL_QUEUE),
    );
    queues.push(QueueConsumer::new(binding, codec(), general));

    ConsumerDefinition {
        kind: ConsumerKind::Notifications,
        queues,
        prefetch: options.prefetch,
        retry: options.retry.clone(),
    }
}
