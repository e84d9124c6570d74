//! Consumer host.
//!
//! Owns the startup and shutdown sequence for a set of consumers sharing one
//! broker connection:
//!
//! 1. declare every binding (a conflict aborts startup)
//! 2. open one consumer channel per queue, plus one per broker DLQ
//! 3. spawn the runtimes and the dead-letter recovery sweep
//!
//! Shutdown signals every runtime, waits up to the shutdown timeout for
//! in-flight deliveries, then closes the connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ConsumerRuntime, DeliveryProcessor, EventPipeline, RuntimeStats};
use crate::bus::{Broker, BusError, DeliverySource};
use crate::consumers::ConsumerDefinition;
use crate::dlq::ingest::DeadLetterIngest;
use crate::dlq::{DeadLetterStore, RecoverySweep, RecoveryTaskHandle};
use crate::retry::RetryCoordinator;
use crate::topology::{TopologyError, TopologyManager};

/// Startup failures. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("No consumers configured")]
    NoConsumers,

    #[error("Topology declaration failed: {0}")]
    Topology(#[from] TopologyError),

    #[error("Failed to open consumer on '{queue}': {source}")]
    Consumer {
        queue: String,
        #[source]
        source: BusError,
    },
}

/// Builder for a set of consumers on one broker.
pub struct ConsumerHost {
    broker: Arc<dyn Broker>,
    store: Arc<DeadLetterStore>,
    consumers: Vec<ConsumerDefinition>,
    sweep_interval: Duration,
    shutdown_timeout: Duration,
}

impl ConsumerHost {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<DeadLetterStore>) -> Self {
        Self {
            broker,
            store,
            consumers: Vec::new(),
            sweep_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_consumer(mut self, consumer: ConsumerDefinition) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<DeadLetterStore> {
        &self.store
    }

    async fn open(
        &self,
        runtime: ConsumerRuntime,
    ) -> Result<(ConsumerRuntime, Box<dyn DeliverySource>), HostError> {
        let source = runtime.open().await.map_err(|source| HostError::Consumer {
            queue: runtime.queue().to_string(),
            source,
        })?;
        Ok((runtime, source))
    }

    /// Declare topology, open every consumer, and start processing.
    ///
    /// Nothing is spawned unless every step succeeds.
    pub async fn start(self) -> Result<RunningHost, HostError> {
        if self.consumers.is_empty() {
            return Err(HostError::NoConsumers);
        }

        let bindings: Vec<_> = self
            .consumers
            .iter()
            .flat_map(ConsumerDefinition::bindings)
            .collect();
        TopologyManager::new(Arc::clone(&self.broker))
            .declare(&bindings)
            .await?;

        let mut opened = Vec::new();
        let mut sweep = RecoverySweep::new(Arc::clone(&self.store));

        for consumer in &self.consumers {
            for queue in &consumer.queues {
                let name = &queue.binding.queue;
                let coordinator = RetryCoordinator::new(
                    name,
                    consumer.retry.clone(),
                    queue.dead_letter_target(&self.store),
                );
                let pipeline: Arc<dyn DeliveryProcessor> = Arc::new(EventPipeline::new(
                    Arc::clone(&queue.codec),
                    Arc::clone(&queue.router),
                    coordinator,
                ));
                let runtime =
                    ConsumerRuntime::new(Arc::clone(&self.broker), name, consumer.prefetch, pipeline);
                opened.push(self.open(runtime).await?);

                if let Some(dead_letter) = &queue.binding.dead_letter {
                    let ingest: Arc<dyn DeliveryProcessor> =
                        Arc::new(DeadLetterIngest::new(Arc::clone(&self.store), name));
                    let runtime = ConsumerRuntime::new(
                        Arc::clone(&self.broker),
                        &dead_letter.queue,
                        consumer.prefetch,
                        ingest,
                    );
                    opened.push(self.open(runtime).await?);
                }

                sweep = sweep.with_route(name, Arc::clone(&queue.codec), Arc::clone(&queue.router));
            }

            info!(
                consumer = %consumer.kind,
                queues = consumer.queues.len(),
                prefetch = consumer.prefetch,
                max_attempts = consumer.retry.max_attempts,
                "Consumer configured"
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = opened
            .into_iter()
            .map(|(runtime, source)| {
                let queue = runtime.queue().to_string();
                let handle = tokio::spawn(runtime.run(source, shutdown_rx.clone()));
                (queue, handle)
            })
            .collect::<Vec<_>>();

        let sweep = sweep.spawn(self.sweep_interval);

        info!(runtimes = tasks.len(), "Consumer host started");

        Ok(RunningHost {
            broker: self.broker,
            store: self.store,
            shutdown_tx,
            tasks,
            sweep,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Final counters from a stopped host.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Stats per queue for runtimes that stopped in time.
    pub stopped: Vec<(String, RuntimeStats)>,
    /// Queues whose runtime was aborted at the shutdown timeout.
    pub aborted: Vec<String>,
}

impl ShutdownReport {
    pub fn stats(&self, queue: &str) -> Option<RuntimeStats> {
        self.stopped
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, stats)| *stats)
    }
}

/// A started host. Dropping it signals the runtimes but does not wait for
/// them or close the broker.
pub struct RunningHost {
    broker: Arc<dyn Broker>,
    store: Arc<DeadLetterStore>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<RuntimeStats>)>,
    sweep: RecoveryTaskHandle,
    shutdown_timeout: Duration,
}

impl RunningHost {
    /// Queues with a running consumer, DLQs included.
    pub fn queues(&self) -> Vec<&str> {
        self.tasks.iter().map(|(queue, _)| queue.as_str()).collect()
    }

    pub fn store(&self) -> &Arc<DeadLetterStore> {
        &self.store
    }

    /// Stop all runtimes, then close the broker connection.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Shutting down consumer host"
        );
        let _ = self.shutdown_tx.send(true);
        self.sweep.stop();

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut report = ShutdownReport::default();

        for (queue, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(stats)) => report.stopped.push((queue, stats)),
                Ok(Err(e)) => {
                    error!(queue = %queue, error = %e, "Consumer task failed");
                }
                Err(_) => {
                    warn!(queue = %queue, "Consumer did not stop within shutdown timeout, aborting");
                    handle.abort();
                    report.aborted.push(queue);
                }
            }
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Error closing broker connection");
        }

        let stats = self.store.get_stats();
        info!(
            stopped = report.stopped.len(),
            aborted = report.aborted.len(),
            dead_letter_total = stats.total,
            "Consumer host stopped"
        );
        report
    }
}
