//! Consumer runtime.
//!
//! One runtime per bound queue, each on its own tokio task and its own
//! channel over the shared broker connection. The loop is explicit:
//!
//! 1. wait for the next delivery or shutdown
//! 2. hand the delivery to a `DeliveryProcessor`
//! 3. settle it with the returned disposition
//!
//! Processing is never interrupted by shutdown; the in-flight delivery
//! finishes (including any backoff sleep) before the runtime exits.

pub mod host;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

use crate::bus::{Broker, BusError, DeliverySource, Disposition, InboundMessage};
use crate::codec::EnvelopeCodec;
use crate::error::ConsumeError;
use crate::retry::{ProcessingState, Resolution, RetryCoordinator};
use crate::router::TypeRouter;

/// Turns one delivery into a disposition.
#[async_trait]
pub trait DeliveryProcessor: Send + Sync {
    async fn process(&self, message: &InboundMessage) -> Resolution;
}

/// Decode, route and retry pipeline for an event queue.
pub struct EventPipeline {
    codec: Arc<EnvelopeCodec>,
    router: Arc<TypeRouter>,
    coordinator: RetryCoordinator,
}

impl EventPipeline {
    pub fn new(
        codec: Arc<EnvelopeCodec>,
        router: Arc<TypeRouter>,
        coordinator: RetryCoordinator,
    ) -> Self {
        Self {
            codec,
            router,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &RetryCoordinator {
        &self.coordinator
    }
}

#[async_trait]
impl DeliveryProcessor for EventPipeline {
    async fn process(&self, message: &InboundMessage) -> Resolution {
        debug!(state = %ProcessingState::Decoding, "Decoding envelope");
        let event = match self.codec.decode(&message.body) {
            Ok(event) => Arc::new(event),
            Err(e) => {
                let event_type = self.codec.peek_type(&message.body);
                return self
                    .coordinator
                    .resolve(message, event_type.as_deref(), Err(e.into()))
                    .await;
            }
        };

        debug!(
            state = %ProcessingState::Routing,
            event_type = %event.event_type,
            "Routing event"
        );
        let outcome = self
            .router
            .dispatch(Arc::clone(&event))
            .await
            .map_err(ConsumeError::from);

        debug!(
            state = %ProcessingState::HandlerInvoked,
            event_type = %event.event_type,
            success = outcome.is_ok(),
            "Handler returned"
        );
        self.coordinator
            .resolve(message, Some(&event.event_type), outcome)
            .await
    }
}

/// Outcome counters for one runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub reconnects: u64,
}

impl RuntimeStats {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::Requeue { .. } => self.requeued += 1,
            Disposition::DeadLetter => self.dead_lettered += 1,
        }
    }
}

/// Long-running consumer loop for one queue.
pub struct ConsumerRuntime {
    broker: Arc<dyn Broker>,
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    processor: Arc<dyn DeliveryProcessor>,
    max_reconnect_delay: Duration,
}

impl ConsumerRuntime {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        prefetch: u16,
        processor: Arc<dyn DeliveryProcessor>,
    ) -> Self {
        let queue = queue.into();
        Self {
            broker,
            consumer_tag: format!("relay-{}", queue),
            queue,
            prefetch,
            processor,
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    /// Cap for the delay between reconnection attempts.
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Open the consumer channel. Failure here is a startup failure.
    pub async fn open(&self) -> Result<Box<dyn DeliverySource>, BusError> {
        self.broker
            .consume(&self.queue, &self.consumer_tag, self.prefetch)
            .await
    }

    /// Run until shutdown is signalled (or its sender dropped).
    pub async fn run(
        self,
        source: Box<dyn DeliverySource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RuntimeStats {
        let mut stats = RuntimeStats::default();
        let mut source = Some(source);

        info!(queue = %self.queue, prefetch = self.prefetch, "Consumer runtime started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(active) = source.as_mut() else {
                match self.reconnect(&mut shutdown).await {
                    Some(fresh) => {
                        stats.reconnects += 1;
                        source = Some(fresh);
                        continue;
                    }
                    None => break,
                }
            };

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(queue = %self.queue, "Shutdown sender dropped");
                    }
                    break;
                }
                next = active.next_delivery() => next,
            };

            match next {
                Some(Ok(message)) => {
                    stats.received += 1;
                    let span = info_span!(
                        "consumer.process",
                        queue = %self.queue,
                        delivery_tag = message.delivery_tag,
                        routing_key = %message.routing_key,
                    );
                    let settled = self
                        .handle(active.as_mut(), &message)
                        .instrument(span)
                        .await;

                    match settled {
                        Ok(disposition) => stats.record(disposition),
                        Err(e) => {
                            error!(
                                queue = %self.queue,
                                error = %e,
                                "Failed to settle delivery, reconnecting"
                            );
                            Self::discard(&mut source).await;
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "Consumer delivery error, will reconnect");
                    Self::discard(&mut source).await;
                }
                None => {
                    info!(queue = %self.queue, "Consumer stream ended, reconnecting...");
                    source = None;
                }
            }
        }

        if let Some(mut active) = source {
            if let Err(e) = active.close().await {
                debug!(queue = %self.queue, error = %e, "Error closing consumer channel");
            }
        }

        info!(
            queue = %self.queue,
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Consumer runtime stopped"
        );
        stats
    }

    async fn handle(
        &self,
        source: &mut dyn DeliverySource,
        message: &InboundMessage,
    ) -> Result<Disposition, BusError> {
        debug!(state = %ProcessingState::Received, redelivered = message.redelivered, "Delivery received");

        let resolution = self.processor.process(message).await;
        match (resolution.disposition, resolution.last_error.as_deref()) {
            (Disposition::DeadLetter, Some(last_error)) => {
                source.dead_letter(message, last_error).await?
            }
            (disposition, _) => source.settle(message, disposition).await?,
        }

        debug!(
            state = %resolution.state,
            disposition = %resolution.disposition,
            "Delivery settled"
        );
        Ok(resolution.disposition)
    }

    async fn discard(source: &mut Option<Box<dyn DeliverySource>>) {
        if let Some(mut broken) = source.take() {
            let _ = broken.close().await;
        }
    }

    /// Reopen the consumer with exponential backoff until it succeeds or
    /// shutdown is requested.
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn DeliverySource>> {
        // Exponential backoff with jitter to prevent thundering herd
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(self.max_reconnect_delay)
            .with_jitter()
            .without_max_times()
            .build();

        loop {
            let delay = backoff.next().unwrap_or(self.max_reconnect_delay);
            tokio::select! {
                biased;
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            if *shutdown.borrow() {
                return None;
            }

            match self.open().await {
                Ok(source) => {
                    info!(queue = %self.queue, "Consumer reconnected");
                    return Some(source);
                }
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to reopen consumer, retrying after backoff"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
