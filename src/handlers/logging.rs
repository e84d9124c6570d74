//! Logging handler for dry runs and local testing.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::codec::DecodedEvent;
use crate::router::{Handler, HandlerError};

/// Handler that logs every event and succeeds.
pub struct LoggingHandler {
    name: String,
}

impl LoggingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Handler for LoggingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: Arc<DecodedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let name = self.name.clone();
        Box::pin(async move {
            let fields: Vec<&str> = event.fields.keys().map(|f| f.name()).collect();
            info!(
                handler = %name,
                event_type = %event.event_type,
                fields = ?fields,
                "Event handled"
            );
            Ok(())
        })
    }
}
