//! Message envelope decoding.
//!
//! Envelopes are JSON objects carrying a type discriminator plus
//! type-specific fields. Older producers spell both differently
//! (`type` vs `eventType`, `Message` vs `message`, ...), so every logical
//! field is resolved once at decode time from an ordered alias list.
//!
//! Decoding fails with:
//! - `CodecError::Decode` when the body is not a JSON object
//! - `CodecError::Validation` when the discriminator or a required field
//!   is missing or blank
//!
//! Neither is retriable: the bytes do not change on redelivery.

mod fields;

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

pub use fields::{is_blank, LogicalField, TYPE_FIELDS};

/// Errors produced while decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Decode(String),

    #[error("Invalid envelope: {0}")]
    Validation(String),
}

/// Required logical fields for one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    pub event_type: String,
    pub required: Vec<LogicalField>,
}

impl EventSchema {
    pub fn new(event_type: impl AsRef<str>, required: &[LogicalField]) -> Self {
        Self {
            event_type: normalize_type(event_type.as_ref()),
            required: required.to_vec(),
        }
    }
}

/// A decoded, validated envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Discriminator, trimmed and lowercased.
    pub event_type: String,
    /// Logical fields found in the envelope.
    pub fields: BTreeMap<LogicalField, Value>,
    /// The original JSON object, kept for replay.
    pub payload: Value,
}

impl DecodedEvent {
    pub fn field(&self, field: LogicalField) -> Option<&Value> {
        self.fields.get(&field)
    }

    /// String value of a field. Numbers are not coerced.
    pub fn text(&self, field: LogicalField) -> Option<&str> {
        self.field(field).and_then(Value::as_str)
    }

    /// Serialized original payload.
    pub fn payload_json(&self) -> String {
        self.payload.to_string()
    }
}

/// Normalize a discriminator for comparison.
pub fn normalize_type(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Envelope decoder with a per-type schema registry.
///
/// Types without a registered schema only need a discriminator.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    schemas: HashMap<String, Vec<LogicalField>>,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style schema registration.
    pub fn with_schema(mut self, schema: EventSchema) -> Self {
        self.register_schema(schema);
        self
    }

    /// Register (or replace) the schema for a type.
    pub fn register_schema(&mut self, schema: EventSchema) {
        self.schemas.insert(schema.event_type, schema.required);
    }

    pub fn schema(&self, event_type: &str) -> Option<&[LogicalField]> {
        self.schemas
            .get(&normalize_type(event_type))
            .map(Vec::as_slice)
    }

    /// Discriminator of a body without validating it. Used to label
    /// records of events that failed validation.
    pub fn peek_type(&self, body: &[u8]) -> Option<String> {
        let payload: Value = serde_json::from_slice(body).ok()?;
        let object = payload.as_object()?;
        TYPE_FIELDS
            .iter()
            .filter_map(|name| object.get(*name))
            .find_map(Value::as_str)
            .map(normalize_type)
            .filter(|t| !t.is_empty())
    }

    /// Decode raw bytes into a validated event.
    pub fn decode(&self, body: &[u8]) -> Result<DecodedEvent, CodecError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| CodecError::Decode(format!("not valid JSON: {}", e)))?;

        let object = payload
            .as_object()
            .ok_or_else(|| CodecError::Decode("envelope is not a JSON object".to_string()))?;

        let raw_type = TYPE_FIELDS
            .iter()
            .filter_map(|name| object.get(*name))
            .find(|value| !is_blank(value))
            .ok_or_else(|| CodecError::Validation("missing event type".to_string()))?;

        let event_type = raw_type
            .as_str()
            .map(normalize_type)
            .ok_or_else(|| CodecError::Validation("event type must be a string".to_string()))?;

        let fields: BTreeMap<LogicalField, Value> = LogicalField::ALL
            .iter()
            .filter_map(|field| field.resolve(object).map(|value| (*field, value.clone())))
            .collect();

        if let Some(required) = self.schemas.get(&event_type) {
            if let Some(missing) = required.iter().find(|f| !fields.contains_key(f)) {
                return Err(CodecError::Validation(format!(
                    "{} event is missing required field '{}'",
                    event_type, missing
                )));
            }
        }

        Ok(DecodedEvent {
            event_type,
            fields,
            payload,
        })
    }
}
