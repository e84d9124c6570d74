//! Processing error taxonomy.
//!
//! Every failure a consumer runtime observes while processing one delivery
//! maps to a `ConsumeError`. `is_retriable()` is the only input the retry
//! coordinator needs from an error.

use crate::bus::BusError;
use crate::codec::CodecError;
use crate::router::{HandlerError, RouteError};
use crate::topology::TopologyError;

/// Bytes of payload included in log lines.
pub const PAYLOAD_PREVIEW_BYTES: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Body is not a structured envelope.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Envelope lacks a discriminator or a required field.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No handler for the event type.
    #[error("Routing error: no handler for event type '{0}'")]
    Routing(String),

    #[error("Handler '{handler}' failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
}

impl ConsumeError {
    /// Only transient handler failures are worth redelivering.
    pub fn is_retriable(&self) -> bool {
        match self {
            ConsumeError::Handler { source, .. } => !source.is_permanent(),
            _ => false,
        }
    }

    /// Short classification used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumeError::Decode(_) => "decode",
            ConsumeError::Validation(_) => "validation",
            ConsumeError::Routing(_) => "routing",
            ConsumeError::Handler { .. } => "handler",
            ConsumeError::ExhaustedRetries { .. } => "exhausted_retries",
            ConsumeError::Infrastructure(_) => "infrastructure",
        }
    }

    /// Error text recorded in the dead-letter store.
    ///
    /// Handler failures record the handler's own message.
    pub fn record_message(&self) -> String {
        match self {
            ConsumeError::Handler { source, .. } => source.message().to_string(),
            ConsumeError::ExhaustedRetries { last_error, .. } => last_error.clone(),
            other => other.to_string(),
        }
    }
}

impl From<CodecError> for ConsumeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Decode(msg) => ConsumeError::Decode(msg),
            CodecError::Validation(msg) => ConsumeError::Validation(msg),
        }
    }
}

impl From<RouteError> for ConsumeError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::Unroutable(event_type) => ConsumeError::Routing(event_type),
            RouteError::Handler { handler, source } => ConsumeError::Handler { handler, source },
        }
    }
}

impl From<BusError> for ConsumeError {
    fn from(e: BusError) -> Self {
        ConsumeError::Infrastructure(e.to_string())
    }
}

impl From<TopologyError> for ConsumeError {
    fn from(e: TopologyError) -> Self {
        ConsumeError::Infrastructure(e.to_string())
    }
}

/// Lossy UTF-8 preview of a payload, truncated for logging.
pub fn payload_preview(body: &[u8]) -> String {
    if body.len() <= PAYLOAD_PREVIEW_BYTES {
        String::from_utf8_lossy(body).into_owned()
    } else {
        format!(
            "{}... ({} bytes)",
            String::from_utf8_lossy(&body[..PAYLOAD_PREVIEW_BYTES]),
            body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_handler_errors_are_retriable() {
        let transient = ConsumeError::Handler {
            handler: "h".to_string(),
            source: HandlerError::retriable("timeout"),
        };
        let permanent = ConsumeError::Handler {
            handler: "h".to_string(),
            source: HandlerError::permanent("bad request"),
        };

        assert!(transient.is_retriable());
        assert!(!permanent.is_retriable());
        assert!(!ConsumeError::Decode("x".to_string()).is_retriable());
        assert!(!ConsumeError::Validation("x".to_string()).is_retriable());
        assert!(!ConsumeError::Routing("x".to_string()).is_retriable());
        assert!(!ConsumeError::ExhaustedRetries {
            attempts: 3,
            last_error: "x".to_string()
        }
        .is_retriable());
    }

    #[test]
    fn test_codec_errors_convert() {
        let err: ConsumeError = CodecError::Validation("missing email".to_string()).into();
        assert!(matches!(err, ConsumeError::Validation(_)));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_record_message_uses_handler_text() {
        let err: ConsumeError = RouteError::Handler {
            handler: "smtp".to_string(),
            source: HandlerError::retriable("connection refused"),
        }
        .into();
        assert_eq!(err.record_message(), "connection refused");
    }

    #[test]
    fn test_payload_preview_truncates() {
        let body = vec![b'a'; 300];
        let preview = payload_preview(&body);
        assert!(preview.starts_with(&"a".repeat(PAYLOAD_PREVIEW_BYTES)));
        assert!(preview.ends_with("(300 bytes)"));

        assert_eq!(payload_preview(b"short"), "short");
    }
}
