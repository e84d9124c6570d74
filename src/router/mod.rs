//! Type-based dispatch of decoded events.
//!
//! A router is built once per consumer runtime. Types match exactly first;
//! otherwise the first registered category whose substring occurs in the
//! type wins (catch-all queues carrying coarse categories such as
//! "email"). Matching is case-insensitive.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::codec::{normalize_type, DecodedEvent};

/// Failure reported by an application handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    permanent: bool,
}

impl HandlerError {
    /// A failure that may succeed on redelivery (downstream outage, timeout).
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// A failure redelivery cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Application-level handler for one or more event types.
///
/// Deliveries are at-least-once; implementations must tolerate duplicates.
pub trait Handler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn handle(&self, event: Arc<DecodedEvent>) -> BoxFuture<'static, Result<(), HandlerError>>;
}

/// Errors from routing a decoded event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("No handler registered for event type '{0}'")]
    Unroutable(String),

    #[error("Handler '{handler}' failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },
}

/// Registry from event type to handler.
#[derive(Default, Clone)]
pub struct TypeRouter {
    exact: HashMap<String, Arc<dyn Handler>>,
    categories: Vec<(String, Arc<dyn Handler>)>,
}

impl TypeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one exact event type.
    pub fn register(&mut self, event_type: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.exact.insert(normalize_type(event_type), handler);
        self
    }

    /// Register a handler for any type containing `category`.
    ///
    /// Categories are tried in registration order after exact matches.
    pub fn register_category(&mut self, category: &str, handler: Arc<dyn Handler>) -> &mut Self {
        self.categories.push((normalize_type(category), handler));
        self
    }

    /// Find the handler for a type without invoking it.
    pub fn resolve(&self, event_type: &str) -> Option<&Arc<dyn Handler>> {
        let event_type = normalize_type(event_type);
        self.exact.get(&event_type).or_else(|| {
            self.categories
                .iter()
                .find(|(category, _)| event_type.contains(category.as_str()))
                .map(|(_, handler)| handler)
        })
    }

    /// Registered exact types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.exact.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.categories.is_empty()
    }

    /// Invoke the single matching handler.
    pub async fn dispatch(&self, event: Arc<DecodedEvent>) -> Result<(), RouteError> {
        let handler = self
            .resolve(&event.event_type)
            .ok_or_else(|| RouteError::Unroutable(event.event_type.clone()))?;

        debug!(event_type = %event.event_type, handler = %handler.name(), "Dispatching event");

        handler
            .handle(Arc::clone(&event))
            .await
            .map_err(|source| RouteError::Handler {
                handler: handler.name().to_string(),
                source,
            })
    }
}

impl std::fmt::Debug for TypeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRouter")
            .field("exact", &self.event_types())
            .field(
                "categories",
                &self
                    .categories
                    .iter()
                    .map(|(c, _)| c.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
