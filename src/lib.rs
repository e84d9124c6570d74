//! Relay - reliable AMQP event consumption
//!
//! Subscribes background consumers to a topic exchange, routes decoded
//! events to typed handlers, retries failures with backoff and keeps
//! everything that cannot be processed in a dead-letter store.

pub mod bus;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod consumers;
pub mod dlq;
pub mod error;
pub mod handlers;
pub mod retry;
pub mod router;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod topology;
pub mod utils;
