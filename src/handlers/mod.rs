//! Reference application handlers.
//!
//! Business logic lives outside this crate. These adapters hand decoded
//! events to it:
//! - `HttpForwardHandler`: POSTs the event to a downstream service
//! - `LoggingHandler`: logs and acknowledges (dry runs, local testing)

pub mod http;
pub mod logging;

use std::sync::Arc;

use serde::Deserialize;

pub use http::{HttpForwardConfig, HttpForwardHandler};
pub use logging::LoggingHandler;

use crate::router::Handler;

/// Errors building a handler from configuration.
#[derive(Debug, thiserror::Error)]
pub enum HandlerConfigError {
    #[error("HTTP handler requires an endpoint")]
    MissingEndpoint,

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Which handler backs the consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Log every event and succeed.
    #[default]
    Log,
    /// Forward every event to `{endpoint}/{handler name}`.
    Http,
}

/// Handler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    #[serde(rename = "type")]
    pub kind: HandlerKind,
    /// Base URL for the HTTP handler.
    pub endpoint: Option<String>,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            kind: HandlerKind::Log,
            endpoint: None,
            timeout_ms: 10_000,
        }
    }
}

/// Builds the handler for a named consumer route.
pub type HandlerFactory = dyn Fn(&str) -> Arc<dyn Handler> + Send + Sync;

/// Build a handler factory from configuration.
///
/// HTTP handlers share one client; each route posts to its own path.
pub fn factory_from_config(
    config: &HandlerConfig,
) -> Result<Arc<HandlerFactory>, HandlerConfigError> {
    match config.kind {
        HandlerKind::Log => Ok(Arc::new(|name: &str| -> Arc<dyn Handler> {
            Arc::new(LoggingHandler::new(name))
        })),
        HandlerKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .filter(|e| !e.trim().is_empty())
                .ok_or(HandlerConfigError::MissingEndpoint)?;
            let client = http::build_client(std::time::Duration::from_millis(config.timeout_ms))?;

            Ok(Arc::new(move |name: &str| -> Arc<dyn Handler> {
                Arc::new(HttpForwardHandler::with_client(
                    name,
                    client.clone(),
                    HttpForwardConfig::for_route(&endpoint, name),
                ))
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_factory_names_handlers() {
        let factory = factory_from_config(&HandlerConfig::default()).unwrap();
        assert_eq!(factory("user-registration").name(), "user-registration");
    }

    #[test]
    fn test_http_factory_requires_endpoint() {
        let config = HandlerConfig {
            kind: HandlerKind::Http,
            endpoint: None,
            ..Default::default()
        };
        assert!(matches!(
            factory_from_config(&config),
            Err(HandlerConfigError::MissingEndpoint)
        ));
    }

    #[test]
    fn test_http_factory_builds_per_route_handlers() {
        let config = HandlerConfig {
            kind: HandlerKind::Http,
            endpoint: Some("http://billing:8080/events/".to_string()),
            ..Default::default()
        };
        let factory = factory_from_config(&config).unwrap();
        assert_eq!(factory("payment-completed").name(), "payment-completed");
    }
}
