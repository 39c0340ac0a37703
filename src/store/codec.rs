//! JSON-in-string field encoding and deep merge.
//!
//! The backing store keeps structured `spec`/`status` values as JSON strings.
//! Objects and arrays are encoded on write; on read, string values that parse
//! to an object or array are decoded. Other scalars pass through unchanged,
//! so `"true"` stays a string.
//!
//! A string that would itself decode into something else (`"{\"a\":1}"`,
//! or an already quoted `"\"x\""`) is quoted once more on write and
//! unquoted on read.

use serde_json::{Map, Value};

use crate::error::BrokerResult;

/// Encodes structured top-level values into JSON strings.
pub fn encode_fields(fields: &Map<String, Value>) -> BrokerResult<Map<String, Value>> {
    let mut out = Map::with_capacity(fields.len());
    for (k, v) in fields {
        let encoded = match v {
            Value::Object(_) | Value::Array(_) => Value::String(serde_json::to_string(v)?),
            Value::String(text) if decode_str(text).is_some() => {
                Value::String(serde_json::to_string(v)?)
            }
            other => other.clone(),
        };
        out.insert(k.clone(), encoded);
    }
    Ok(out)
}

/// Decodes JSON-string top-level values back into structured values.
pub fn decode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), decode_value(v)))
        .collect()
}

fn decode_value(v: &Value) -> Value {
    match v {
        Value::String(s) => decode_str(s).unwrap_or_else(|| v.clone()),
        other => other.clone(),
    }
}

/// Structured value (or quoted string) held in `s`, if any.
fn decode_str(s: &str) -> Option<Value> {
    let trimmed = s.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<Value>(s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => Some(parsed),
            _ => None,
        }
    } else if trimmed.starts_with('"') {
        match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::String(_)) => Some(parsed),
            _ => None,
        }
    } else {
        None
    }
}

/// Merges `delta` into `target`.
///
/// Objects are merged key by key, recursively. Arrays and scalars in `delta`
/// replace the target value. A `null` in `delta` removes the key.
pub fn deep_merge(target: &mut Value, delta: &Value) {
    match (target, delta) {
        (Value::Object(t), Value::Object(d)) => merge_maps(t, d),
        (t, d) => *t = d.clone(),
    }
}

/// [`deep_merge`] on two maps.
pub fn merge_maps(target: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (k, dv) in delta {
        if dv.is_null() {
            target.remove(k);
            continue;
        }
        match target.get_mut(k) {
            Some(tv) if tv.is_object() && dv.is_object() => deep_merge(tv, dv),
            _ => {
                target.insert(k.clone(), dv.clone());
            }
        }
    }
}
