//! Send/recv data-flow records
//!
//! A sender publishes a struct-shaped value during check-apply; the engine
//! routes declared fields to downstream receivers. Schemas are declared as
//! [`crate::types::Type`] maps and checked at wiring time; the runtime
//! payload travels as JSON values.

use std::collections::HashMap;

use serde_json::Value;

use super::ResKey;

/// One received field as seen by the recv-side resource.
///
/// `changed` is true on exactly one snapshot following each send that
/// mutated the published struct.
#[derive(Debug, Clone, PartialEq)]
pub struct RecvValue {
    pub value: Value,
    pub changed: bool,
}

/// Wiring-time record for a single recv field: where its value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWire {
    pub sender: ResKey,
    pub sender_field: String,
}

/// The full recv map for one resource: recv field name to wire record.
pub type RecvMap = HashMap<String, RecvWire>;

/// Extract a named field from a published send struct.
///
/// Senders publish `{"field": value, ...}` objects; a missing field reads
/// as null, which the wiring-time type check has already ruled out for
/// well-behaved senders.
pub fn field_of(sent: &Value, field: &str) -> Value {
    sent.get(field).cloned().unwrap_or(Value::Null)
}
