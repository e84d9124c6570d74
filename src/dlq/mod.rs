//! Dead-letter store.
//!
//! Holds events that exhausted their retries or that the broker redirected
//! through a dead-letter exchange. Records are scheduled for replay with the
//! same exponential backoff as live retries and are removed once replayed.
//!
//! ## Feeding paths
//!
//! - Consumers without a broker DLQ enqueue directly from the retry
//!   coordinator.
//! - Consumers with a broker DLQ are drained by an ingest runtime
//!   (`ingest`) that enqueues every dead-lettered message.
//!
//! ## Replay
//!
//! `recovery::RecoverySweep` periodically takes the records returned by
//! `get_events_ready_for_retry()` and runs them through codec and router.
//!
//! ## Concurrency
//!
//! Records live in a `DashMap` keyed by id. Every mutation is a single
//! entry operation, so concurrent runtimes never lose updates and
//! unrelated queues never contend on a global lock.

pub mod ingest;
pub mod recovery;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::retry::RetryPolicy;

pub use recovery::{RecoverySweep, RecoveryTaskHandle, SweepReport};

/// Event type recorded when a message could not be decoded.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Errors that can occur during dead-letter store operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Dead-letter record not found: {0}")]
    NotFound(Uuid),

    #[error("Failed to serialize dead-letter records: {0}")]
    Serialization(String),
}

/// A dead-letter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    pub id: Uuid,
    pub event_type: String,
    /// Original payload, replayed verbatim.
    pub event_json: String,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
    /// Replay attempts that failed. Never decreases.
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    /// Queue the event was consumed from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_queue: Option<String>,
}

/// Aggregate counts for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub total: usize,
    pub ready_for_retry: usize,
    /// Records at or above `max_retries`; these need an operator.
    pub exhausted: usize,
}

// ============================================================================
// Clock
// ============================================================================

/// Time source for scheduling.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

// ============================================================================
// Store
// ============================================================================

/// In-memory dead-letter store.
pub struct DeadLetterStore {
    records: DashMap<Uuid, FailedEvent>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DeadLetterStore {
    /// Store using wall-clock time. `policy.max_attempts` is the replay cap.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            policy,
            clock,
        }
    }

    /// Replays allowed before a record is considered exhausted.
    pub fn max_retries(&self) -> u32 {
        self.policy.max_attempts
    }

    fn schedule(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.policy.backoff(retry_count)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Record a failed event with `retry_count = 0`.
    pub fn enqueue(
        &self,
        event_type: impl Into<String>,
        event_json: impl Into<String>,
        error: impl Into<String>,
    ) -> FailedEvent {
        self.insert(event_type.into(), event_json.into(), error.into(), None)
    }

    /// Record a failed event consumed from `queue`.
    pub fn enqueue_from_queue(
        &self,
        event_type: impl Into<String>,
        event_json: impl Into<String>,
        error: impl Into<String>,
        queue: &str,
    ) -> FailedEvent {
        self.insert(
            event_type.into(),
            event_json.into(),
            error.into(),
            Some(queue.to_string()),
        )
    }

    fn insert(
        &self,
        event_type: String,
        event_json: String,
        last_error: String,
        source_queue: Option<String>,
    ) -> FailedEvent {
        let now = self.clock.now();
        let record = FailedEvent {
            id: Uuid::new_v4(),
            event_type,
            event_json,
            last_error,
            failed_at: now,
            retry_count: 0,
            next_retry_at: self.schedule(now, 0),
            source_queue,
        };

        warn!(
            id = %record.id,
            event_type = %record.event_type,
            source_queue = record.source_queue.as_deref().unwrap_or(""),
            error = %record.last_error,
            next_retry_at = %record.next_retry_at,
            "Event added to dead-letter store"
        );

        self.records.insert(record.id, record.clone());
        record
    }

    /// Records due for replay, earliest first.
    pub fn get_events_ready_for_retry(&self) -> Vec<FailedEvent> {
        let now = self.clock.now();
        let max_retries = self.max_retries();

        let mut ready: Vec<FailedEvent> = self
            .records
            .iter()
            .filter(|r| r.next_retry_at <= now && r.retry_count < max_retries)
            .map(|r| r.value().clone())
            .collect();
        ready.sort_by_key(|r| r.next_retry_at);
        ready
    }

    /// Record another failed replay and push `next_retry_at` out.
    pub fn mark_as_failed(&self, id: Uuid, error: impl Into<String>) -> Result<FailedEvent, DlqError> {
        let now = self.clock.now();
        let mut entry = self.records.get_mut(&id).ok_or(DlqError::NotFound(id))?;

        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.last_error = error.into();
        entry.failed_at = now;
        entry.next_retry_at = self.schedule(now, entry.retry_count);

        if entry.retry_count >= self.max_retries() {
            warn!(
                id = %id,
                event_type = %entry.event_type,
                retry_count = entry.retry_count,
                "Dead-letter record exhausted, operator action required"
            );
        } else {
            debug!(
                id = %id,
                retry_count = entry.retry_count,
                next_retry_at = %entry.next_retry_at,
                "Dead-letter record rescheduled"
            );
        }

        Ok(entry.clone())
    }

    /// Delete a record after successful replay or operator intervention.
    pub fn remove(&self, id: Uuid) -> Option<FailedEvent> {
        let removed = self.records.remove(&id).map(|(_, record)| record);
        if let Some(record) = &removed {
            info!(id = %id, event_type = %record.event_type, "Removed event from dead-letter store");
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<FailedEvent> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn get_stats(&self) -> DeadLetterStats {
        let now = self.clock.now();
        let max_retries = self.max_retries();

        self.records
            .iter()
            .fold(DeadLetterStats::default(), |mut stats, record| {
                stats.total += 1;
                if record.retry_count >= max_retries {
                    stats.exhausted += 1;
                } else if record.next_retry_at <= now {
                    stats.ready_for_retry += 1;
                }
                stats
            })
    }

    /// All records, oldest failure first.
    pub fn export(&self) -> Vec<FailedEvent> {
        let mut records: Vec<FailedEvent> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.failed_at);
        records
    }

    /// All records as a JSON array, for operator tooling.
    pub fn export_json(&self) -> Result<String, DlqError> {
        serde_json::to_string_pretty(&self.export())
            .map_err(|e| DlqError::Serialization(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("records", &self.records.len())
            .field("policy", &self.policy)
            .finish()
    }
}
