//! HTTP forwarding handler.
//!
//! POSTs each decoded event as JSON to a downstream endpoint. Retries are
//! left to the retry coordinator, so a single request is made per delivery.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::DecodedEvent;
use crate::router::{Handler, HandlerError};

/// Downstream endpoint for one handler.
#[derive(Debug, Clone)]
pub struct HttpForwardConfig {
    pub url: String,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

impl HttpForwardConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// `{base}/{route}` with exactly one separating slash.
    pub fn for_route(base: &str, route: &str) -> Self {
        Self::new(format!("{}/{}", base.trim_end_matches('/'), route))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Request body sent downstream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForwardedEvent<'a> {
    event_type: &'a str,
    fields: BTreeMap<&'static str, &'a serde_json::Value>,
    payload: &'a serde_json::Value,
}

pub(crate) fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

/// Handler that forwards events over HTTP.
pub struct HttpForwardHandler {
    name: String,
    client: Client,
    config: Arc<HttpForwardConfig>,
}

impl HttpForwardHandler {
    pub fn new(
        name: impl Into<String>,
        config: HttpForwardConfig,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(name, build_client(timeout)?, config))
    }

    /// Share a client (and its connection pool) between handlers.
    pub fn with_client(name: impl Into<String>, client: Client, config: HttpForwardConfig) -> Self {
        Self {
            name: name.into(),
            client,
            config: Arc::new(config),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

/// Retry 408, 429 and 5xx; everything else is the caller's fault.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

async fn forward(
    client: Client,
    config: Arc<HttpForwardConfig>,
    event: Arc<DecodedEvent>,
) -> Result<(), HandlerError> {
    let body = ForwardedEvent {
        event_type: &event.event_type,
        fields: event
            .fields
            .iter()
            .map(|(field, value)| (field.name(), value))
            .collect(),
        payload: &event.payload,
    };

    let mut request = client.post(&config.url).json(&body);
    for (key, value) in &config.headers {
        request = request.header(key, value);
    }

    // Transport failures (refused, reset, timeout) are transient
    let response = request
        .send()
        .await
        .map_err(|e| HandlerError::retriable(format!("request to {} failed: {}", config.url, e)))?;

    let status = response.status();
    if status.is_success() {
        debug!(url = %config.url, event_type = %event.event_type, "Event forwarded");
        return Ok(());
    }

    let text = response.text().await.unwrap_or_default();
    let message = format!(
        "HTTP {} from {}: {}",
        status,
        config.url,
        text.chars().take(200).collect::<String>()
    );

    if is_retryable_status(status) {
        warn!(url = %config.url, status = %status, "Downstream returned retryable status");
        Err(HandlerError::retriable(message))
    } else {
        Err(HandlerError::permanent(message))
    }
}

impl Handler for HttpForwardHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: Arc<DecodedEvent>) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(forward(
            self.client.clone(),
            Arc::clone(&self.config),
            event,
        ))
    }
}
