//! relay-consumers: AMQP event consumers
//!
//! Runs the configured consumers against one RabbitMQ connection until
//! Ctrl+C, then drains in-flight messages and exits.
//!
//! ## Configuration
//! - `config.yaml` in the working directory, or the path given as the first
//!   argument, or `RELAY_CONFIG`
//! - `RELAY__*` environment overrides (e.g. `RELAY__AMQP__URL`)
//! - `RELAY_LOG`: tracing filter (default: info)
//! - `RELAY_LOG_FORMAT=json`: JSON log lines

use std::sync::Arc;

use tracing::{error, info};

use relay::bus::amqp::redact_url;
use relay::bus::{AmqpBroker, Broker};
use relay::config::Config;
use relay::consumer::host::ConsumerHost;
use relay::dlq::DeadLetterStore;
use relay::handlers::factory_from_config;
use relay::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    let handlers = factory_from_config(&config.handler)?;

    let address = redact_url(&config.amqp.url);
    let broker: Arc<dyn Broker> = Arc::new(
        connect_with_retry("broker", &address, config.connect_timeout(), || {
            AmqpBroker::connect(config.amqp.url.clone())
        })
        .await?,
    );

    let store = Arc::new(DeadLetterStore::new(config.dead_letter_store.policy()));
    let mut host = ConsumerHost::new(broker, store)
        .with_sweep_interval(config.dead_letter_store.sweep_interval())
        .with_shutdown_timeout(config.shutdown_timeout());
    for (kind, options) in config.consumer_options() {
        host = host.with_consumer(kind.build(&options, &*handlers));
    }

    let running = host.start().await.map_err(|e| {
        error!(error = %e, "Startup failed");
        e
    })?;
    info!(queues = ?running.queues(), "relay-consumers started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let report = running.shutdown().await;
    if !report.aborted.is_empty() {
        error!(aborted = ?report.aborted, "Some consumers were aborted at the shutdown timeout");
    }

    Ok(())
}
