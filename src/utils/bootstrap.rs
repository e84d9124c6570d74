//! Bootstrap utilities for the relay binary.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with the RELAY_LOG environment variable.
///
/// Defaults to "info" level if RELAY_LOG is not set. `RELAY_LOG_FORMAT=json`
/// switches to one JSON object per line.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs_requested() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn json_logs_requested() -> bool {
    std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Connect to a service with exponential backoff until `deadline` elapses.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "broker")
/// * `address` - Address for logging; must not carry credentials
/// * `deadline` - Total time allowed across attempts
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error once the deadline passes.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    deadline: Duration,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = tokio::time::Instant::now();
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_jitter()
        .without_max_times()
        .build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = service_name, address, attempt, "Connected");
                return Ok(client);
            }
            Err(e) => {
                let delay = backoff.next().unwrap_or(Duration::from_secs(5));
                if started.elapsed() + delay > deadline {
                    error!(
                        service = service_name,
                        address,
                        attempts = attempt,
                        error = %e,
                        "Giving up connecting"
                    );
                    return Err(e);
                }
                warn!(
                    service = service_name,
                    address,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds_after_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<&str, String> =
            connect_with_retry("broker", "localhost", Duration::from_secs(30), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("refused".to_string())
                } else {
                    Ok("connected")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_deadline() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> =
            connect_with_retry("broker", "localhost", Duration::from_secs(2), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("refused".to_string())
            })
            .await;

        assert_eq!(result.unwrap_err(), "refused");
        assert!(calls.load(Ordering::SeqCst) > 1);
    }
}
