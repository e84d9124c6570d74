//! Retry policy and per-message retry decisions.
//!
//! After a delivery has been decoded and dispatched, the coordinator turns
//! the outcome into a broker disposition:
//!
//! - success: ack
//! - terminal failure (decode, validation, routing, permanent handler
//!   error): dead-letter immediately, no backoff
//! - retriable handler failure below the cap: sleep `backoff(attempt)` then
//!   requeue with `attempt + 1`
//! - retriable handler failure at the cap: dead-letter
//!
//! The backoff sleep blocks the owning runtime on purpose. With prefetch 1
//! this holds back the queue while a downstream dependency is failing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::bus::{Disposition, HeaderValue, Headers, InboundMessage};
use crate::dlq::{DeadLetterStore, UNKNOWN_EVENT_TYPE};
use crate::error::{payload_preview, ConsumeError};

/// Broker-native death history (RabbitMQ dead-lettering).
pub const DEATH_HEADER: &str = "x-death";
/// `x-death` reason left by a delay queue whose TTL elapsed.
pub const EXPIRED_DEATH_REASON: &str = "expired";
/// Broker-native redelivery counter (quorum queues, memory broker).
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
/// Counter written when a message is republished for retry.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Counter written by older producers.
pub const LEGACY_RETRY_COUNT_HEADER: &str = "retry-count";
/// Error that sent a message to its dead-letter exchange.
pub const LAST_ERROR_HEADER: &str = "x-last-error";

/// Per-consumer retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the first redelivery.
    pub base_backoff: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay for a given attempt number (0-indexed).
    ///
    /// `base × multiplier^attempt`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let max_ms = self.max_backoff.as_millis() as f64;

        // NaN and overflow both land on the cap
        let ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(ms as u64)
    }

    /// Whether a failure on `attempt` uses up the last allowed delivery.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) >= self.max_attempts
    }
}

/// Number of times this message was already delivered and failed.
///
/// Fallback chain: `x-delivery-count`, `x-retry-count`, the `expired`
/// entry of `x-death`, `retry-count`, then 0.
///
/// Counters written on requeue come first so a message that also carries
/// death history still advances toward the cap. Only `expired` deaths
/// (delay-queue retries) count as attempts. A `rejected` death means the
/// message already exhausted its retries and was dead-lettered, so a replay
/// from the DLQ starts with a fresh budget.
pub fn attempt_number(headers: &Headers) -> u32 {
    count_header(headers, DELIVERY_COUNT_HEADER)
        .or_else(|| count_header(headers, RETRY_COUNT_HEADER))
        .or_else(|| expired_death_count(headers))
        .or_else(|| count_header(headers, LEGACY_RETRY_COUNT_HEADER))
        .unwrap_or(0)
}

fn expired_death_count(headers: &Headers) -> Option<u32> {
    headers
        .get(DEATH_HEADER)?
        .as_array()?
        .iter()
        .filter_map(HeaderValue::as_table)
        .find(|death| {
            death.get("reason").and_then(HeaderValue::as_str) == Some(EXPIRED_DEATH_REASON)
        })?
        .get("count")?
        .as_count()
}

fn count_header(headers: &Headers, name: &str) -> Option<u32> {
    headers.get(name).and_then(HeaderValue::as_count)
}

/// Lifecycle of one delivery inside a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Received,
    Decoding,
    Routing,
    HandlerInvoked,
    Acked,
    Requeued,
    DeadLettered,
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingState::Acked | ProcessingState::Requeued | ProcessingState::DeadLettered
        )
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingState::Received => "received",
            ProcessingState::Decoding => "decoding",
            ProcessingState::Routing => "routing",
            ProcessingState::HandlerInvoked => "handler_invoked",
            ProcessingState::Acked => "acked",
            ProcessingState::Requeued => "requeued",
            ProcessingState::DeadLettered => "dead_lettered",
        };
        f.write_str(name)
    }
}

/// Where dead-lettered messages end up.
#[derive(Clone)]
pub enum DeadLetterTarget {
    /// The queue has a dead-letter exchange; rejecting is enough.
    Broker,
    /// No broker DLQ: record in the store before rejecting.
    Store(Arc<DeadLetterStore>),
}

impl fmt::Debug for DeadLetterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterTarget::Broker => write!(f, "Broker"),
            DeadLetterTarget::Store(_) => write!(f, "Store"),
        }
    }
}

/// Final state and broker disposition for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: ProcessingState,
    pub disposition: Disposition,
    /// Error carried to the dead-letter exchange with the message.
    pub last_error: Option<String>,
}

impl Resolution {
    pub fn acked() -> Self {
        Self {
            state: ProcessingState::Acked,
            disposition: Disposition::Ack,
            last_error: None,
        }
    }

    pub fn requeued(next_attempt: u32) -> Self {
        Self {
            state: ProcessingState::Requeued,
            disposition: Disposition::Requeue { next_attempt },
            last_error: None,
        }
    }

    pub fn dead_lettered() -> Self {
        Self {
            state: ProcessingState::DeadLettered,
            disposition: Disposition::DeadLetter,
            last_error: None,
        }
    }

    pub fn dead_lettered_with(error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::dead_lettered()
        }
    }
}

/// Turns processing outcomes into dispositions for one queue.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    queue: String,
    policy: RetryPolicy,
    target: DeadLetterTarget,
}

impl RetryCoordinator {
    pub fn new(queue: impl Into<String>, policy: RetryPolicy, target: DeadLetterTarget) -> Self {
        Self {
            queue: queue.into(),
            policy,
            target,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn target(&self) -> &DeadLetterTarget {
        &self.target
    }

    /// Decide the disposition for a processed delivery.
    ///
    /// Sleeps for the backoff before returning a requeue.
    pub async fn resolve(
        &self,
        message: &InboundMessage,
        event_type: Option<&str>,
        outcome: Result<(), ConsumeError>,
    ) -> Resolution {
        let err = match outcome {
            Ok(()) => return Resolution::acked(),
            Err(err) => err,
        };
        let event_type_field = event_type.unwrap_or(UNKNOWN_EVENT_TYPE);

        if !err.is_retriable() {
            error!(
                queue = %self.queue,
                event_type = %event_type_field,
                error_kind = err.kind(),
                error = %err,
                payload = %payload_preview(&message.body),
                "Rejecting message without retry"
            );
            return self.dead_letter(message, event_type, &err);
        }

        let attempt = attempt_number(&message.headers);
        let delay = self.policy.backoff(attempt);

        if self.policy.is_exhausted(attempt) {
            error!(
                queue = %self.queue,
                event_type = %event_type_field,
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                payload = %payload_preview(&message.body),
                "Retry cap reached, dead-lettering message"
            );
            let exhausted = ConsumeError::ExhaustedRetries {
                attempts: attempt + 1,
                last_error: err.record_message(),
            };
            return self.dead_letter(message, event_type, &exhausted);
        }

        warn!(
            queue = %self.queue,
            event_type = %event_type_field,
            attempt = attempt + 1,
            max_attempts = self.policy.max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "Handler failed, retrying after backoff"
        );
        tokio::time::sleep(delay).await;

        Resolution::requeued(attempt + 1)
    }

    fn dead_letter(
        &self,
        message: &InboundMessage,
        event_type: Option<&str>,
        err: &ConsumeError,
    ) -> Resolution {
        match &self.target {
            DeadLetterTarget::Store(store) => {
                store.enqueue_from_queue(
                    event_type.unwrap_or(UNKNOWN_EVENT_TYPE),
                    String::from_utf8_lossy(&message.body).into_owned(),
                    err.record_message(),
                    &self.queue,
                );
                Resolution::dead_lettered()
            }
            DeadLetterTarget::Broker => Resolution::dead_lettered_with(err.record_message()),
        }
    }
}
