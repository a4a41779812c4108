//! Canonical JSON serialization for digest computation.
//!
//! Object keys are sorted recursively so the same logical event always
//! hashes to the same digest regardless of field insertion order.

use serde::Serialize;
use serde_json::Value;

/// Serialize a payload to canonical JSON: recursively key-sorted objects,
/// compact separators.
pub fn canonical_json<T: Serialize>(payload: &T) -> String {
    let value = serde_json::to_value(payload).unwrap_or(Value::Null);
    sort_value(&value).to_string()
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            // serde_json::Map preserves insertion order by default, so
            // rebuild through a BTreeMap to force lexicographic keys.
            let sorted: std::collections::BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}
