//! Periodic replay of the dead-letter store.
//!
//! Each pass takes the records due for retry, decodes their stored JSON and
//! dispatches it through the router of the queue the record came from.
//! Success removes the record; any failure reschedules it via
//! `mark_as_failed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{DeadLetterStats, DeadLetterStore, FailedEvent};
use crate::codec::EnvelopeCodec;
use crate::router::TypeRouter;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub replayed: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct ReplayRoute {
    codec: Arc<EnvelopeCodec>,
    router: Arc<TypeRouter>,
}

/// Replays ready dead-letter records.
pub struct RecoverySweep {
    store: Arc<DeadLetterStore>,
    routes: HashMap<String, ReplayRoute>,
    fallback: Option<ReplayRoute>,
}

impl RecoverySweep {
    pub fn new(store: Arc<DeadLetterStore>) -> Self {
        Self {
            store,
            routes: HashMap::new(),
            fallback: None,
        }
    }

    /// Replay records from `queue` through this codec and router.
    pub fn with_route(
        mut self,
        queue: impl Into<String>,
        codec: Arc<EnvelopeCodec>,
        router: Arc<TypeRouter>,
    ) -> Self {
        self.routes.insert(queue.into(), ReplayRoute { codec, router });
        self
    }

    /// Route for records without a known source queue.
    pub fn with_fallback(mut self, codec: Arc<EnvelopeCodec>, router: Arc<TypeRouter>) -> Self {
        self.fallback = Some(ReplayRoute { codec, router });
        self
    }

    fn route_for(&self, record: &FailedEvent) -> Option<&ReplayRoute> {
        record
            .source_queue
            .as_deref()
            .and_then(|queue| self.routes.get(queue))
            .or(self.fallback.as_ref())
    }

    async fn replay(&self, record: &FailedEvent) -> Result<(), String> {
        let route = self.route_for(record).ok_or_else(|| {
            format!(
                "no replay route for queue '{}'",
                record.source_queue.as_deref().unwrap_or("")
            )
        })?;

        let event = route
            .codec
            .decode(record.event_json.as_bytes())
            .map_err(|e| e.to_string())?;
        route
            .router
            .dispatch(Arc::new(event))
            .await
            .map_err(|e| e.to_string())
    }

    /// Run a single pass over the records due now.
    pub async fn run_once(&self) -> SweepReport {
        let ready = self.store.get_events_ready_for_retry();
        let mut report = SweepReport {
            attempted: ready.len(),
            ..Default::default()
        };

        for record in &ready {
            match self.replay(record).await {
                Ok(()) => {
                    self.store.remove(record.id);
                    report.replayed += 1;
                    info!(id = %record.id, event_type = %record.event_type, "Replayed dead-letter record");
                }
                Err(e) => {
                    report.failed += 1;
                    match self.store.mark_as_failed(record.id, e.as_str()) {
                        Ok(updated) => warn!(
                            id = %record.id,
                            event_type = %record.event_type,
                            retry_count = updated.retry_count,
                            error = %e,
                            "Dead-letter replay failed"
                        ),
                        // Removed by an operator mid-pass
                        Err(missing) => debug!(error = %missing, "Record vanished during replay"),
                    }
                }
            }
        }

        let stats = self.store.get_stats();
        log_stats(&stats, &report);
        report
    }

    /// Run the sweep every `interval` until stopped.
    pub fn spawn(self, interval: Duration) -> RecoveryTaskHandle {
        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = interval.as_secs(), "Dead-letter recovery task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            info!("Dead-letter recovery task stopped");
                            break;
                        }
                    }
                }
            }
        });

        RecoveryTaskHandle { cancel: cancel_tx }
    }
}

fn log_stats(stats: &DeadLetterStats, report: &SweepReport) {
    if stats.exhausted > 0 {
        error!(
            total = stats.total,
            ready_for_retry = stats.ready_for_retry,
            exhausted = stats.exhausted,
            replayed = report.replayed,
            failed = report.failed,
            "Dead-letter store has exhausted records"
        );
    } else {
        info!(
            total = stats.total,
            ready_for_retry = stats.ready_for_retry,
            exhausted = stats.exhausted,
            replayed = report.replayed,
            failed = report.failed,
            "Dead-letter sweep complete"
        );
    }
}

/// Handle for stopping a spawned recovery task.
pub struct RecoveryTaskHandle {
    cancel: tokio::sync::watch::Sender<bool>,
}

impl RecoveryTaskHandle {
    /// Signal the recovery task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}
