//! Loose JSON value extraction for inbound envelopes.
//!
//! Peer clouds are not strict about value shapes: a `new_value` may arrive
//! as a string, a number, or a whole JSON object. Extraction normalizes
//! every recognized shape to a string and degrades unknown shapes to a
//! diagnostic payload instead of failing the receive loop.

use serde_json::Value;
use tracing::{debug, warn};

/// Extract the value under `key` as a string.
///
/// - string: returned verbatim; empty strings collapse to `None`
/// - integer / float: stringified
/// - object / array: re-serialized to JSON text
/// - anything else: `{"type":"<typename>"}` diagnostic payload
pub fn json_string_value(parsed: &Value, key: &str) -> Option<String> {
    match parsed.get(key) {
        None | Some(Value::Null) => {
            debug!(key, "empty value");
            None
        }
        Some(Value::String(s)) => {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(v @ Value::Object(_)) | Some(v @ Value::Array(_)) => {
            serde_json::to_string(v).ok()
        }
        Some(other) => {
            let type_name = json_type_name(other);
            warn!(key, type_name, "unexpected value type");
            Some(format!("{{\"type\":\"{}\"}}", type_name))
        }
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
