//! Test utilities and mock implementations.
//!
//! Handlers that record what they receive, for exercising routers and
//! consumer runtimes without a downstream service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::codec::DecodedEvent;
use crate::router::{Handler, HandlerError};

#[derive(Default)]
struct RecordingState {
    calls: AtomicUsize,
    events: RwLock<Vec<Arc<DecodedEvent>>>,
    /// Remaining invocations that fail. `usize::MAX` fails forever.
    failures_left: AtomicUsize,
    permanent: bool,
    error_message: String,
}

/// Handler that records every invocation and optionally fails.
#[derive(Clone)]
pub struct RecordingHandler {
    name: String,
    state: Arc<RecordingState>,
}

impl RecordingHandler {
    /// A handler that always succeeds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RecordingState::default()),
        }
    }

    /// A handler whose first `count` invocations fail with a retriable error.
    pub fn failing_times(name: impl Into<String>, count: usize, message: &str) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RecordingState {
                failures_left: AtomicUsize::new(count),
                error_message: message.to_string(),
                ..Default::default()
            }),
        }
    }

    /// A handler that always fails with a retriable error.
    pub fn always_failing(name: impl Into<String>, message: &str) -> Self {
        Self::failing_times(name, usize::MAX, message)
    }

    /// A handler that always fails with a permanent error.
    pub fn permanently_failing(name: impl Into<String>, message: &str) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RecordingState {
                failures_left: AtomicUsize::new(usize::MAX),
                permanent: true,
                error_message: message.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub async fn events(&self) -> Vec<Arc<DecodedEvent>> {
        self.state.events.read().await.clone()
    }

    /// Shared handle for router registration.
    pub fn shared(&self) -> Arc<dyn Handler> {
        Arc::new(self.clone())
    }
}

impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: Arc<DecodedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            state.calls.fetch_add(1, Ordering::SeqCst);
            state.events.write().await.push(event);

            let failing = state
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                })
                .is_ok();

            if !failing {
                Ok(())
            } else if state.permanent {
                Err(HandlerError::permanent(state.error_message.clone()))
            } else {
                Err(HandlerError::retriable(state.error_message.clone()))
            }
        })
    }
}
