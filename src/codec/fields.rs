//! Logical envelope fields and their historical spellings.

use std::fmt;

use serde_json::{Map, Value};

/// Discriminator field names, in priority order.
pub const TYPE_FIELDS: &[&str] = &["eventType", "EventType", "event_type", "type", "Type"];

/// A field of the envelope independent of how producers spelled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogicalField {
    Recipient,
    Subject,
    Content,
    Metadata,
    Email,
    UserId,
    PaymentId,
    Amount,
    VehicleId,
    Severity,
    Source,
}

impl LogicalField {
    pub const ALL: [LogicalField; 11] = [
        LogicalField::Recipient,
        LogicalField::Subject,
        LogicalField::Content,
        LogicalField::Metadata,
        LogicalField::Email,
        LogicalField::UserId,
        LogicalField::PaymentId,
        LogicalField::Amount,
        LogicalField::VehicleId,
        LogicalField::Severity,
        LogicalField::Source,
    ];

    /// Accepted field names, checked in order.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            LogicalField::Recipient => &["to", "To", "recipient", "Recipient"],
            LogicalField::Subject => &["subject", "Subject"],
            LogicalField::Content => &["message", "Message", "body", "Body"],
            LogicalField::Metadata => &["data", "Data"],
            LogicalField::Email => &["email", "Email"],
            LogicalField::UserId => &["userId", "UserId", "user_id"],
            LogicalField::PaymentId => &["paymentId", "PaymentId", "payment_id"],
            LogicalField::Amount => &["amount", "Amount"],
            LogicalField::VehicleId => &["vehicleId", "VehicleId", "vehicle_id"],
            LogicalField::Severity => &["severity", "Severity", "level", "Level"],
            LogicalField::Source => &["source", "Source", "service", "Service"],
        }
    }

    /// Canonical name, used in validation messages.
    pub fn name(self) -> &'static str {
        self.aliases()[0]
    }

    /// Resolve the field from a JSON object: the first alias holding a
    /// non-blank value wins.
    pub fn resolve(self, object: &Map<String, Value>) -> Option<&Value> {
        self.aliases()
            .iter()
            .filter_map(|alias| object.get(*alias))
            .find(|value| !is_blank(value))
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Null and whitespace-only strings count as absent.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
