// db/codec.rs
// JSON codec for message payloads and chat metadata

use serde_json::{Map, Value};

use crate::error::Result;

/// Encode a JSON value for storage.
///
/// Normalizes `-0` to `0` before serializing. Non-finite floats cannot be
/// represented in a `Value` (see [`number_from_f64`] for the lossy entry
/// point), so the output is always valid JSON text.
pub fn encode_value(value: &Value) -> String {
    normalize(value).to_string()
}

/// Decode a stored JSON payload.
pub fn decode_value(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

/// Convert an arbitrary float into a JSON value.
///
/// `NaN` and `±Infinity` become `null`; `-0` becomes `0`.
pub fn number_from_f64(f: f64) -> Value {
    if !f.is_finite() {
        return Value::Null;
    }
    let f = if f == 0.0 { 0.0 } else { f };
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Text extraction for search entries and graph previews: strings are used
/// verbatim, everything else is its JSON form.
pub fn content_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => encode_value(other),
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 && f.is_sign_negative() => number_from_f64(0.0),
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), normalize(v));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}
