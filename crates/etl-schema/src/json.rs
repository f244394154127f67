use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dynamic JSON value used internally by the schema mapper.
///
/// `serde_json::Value` is used at the bus boundary (events are canonically
/// JSON bytes), but it has no variant for a raw byte string, which the
/// mapper needs to distinguish "declared `bytes`, wire value already
/// decoded" from "declared `string`". `JsonValue` adds that variant and is
/// what every coercion function in this crate actually pattern-matches on.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonValue {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<JsonValue>),
    Object(BTreeMap<String, JsonValue>),
}

impl JsonValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            JsonValue::Null => "null",
            JsonValue::Bool(_) => "bool",
            JsonValue::Int64(_) => "int64",
            JsonValue::UInt64(_) => "uint64",
            JsonValue::Float64(_) => "float64",
            JsonValue::String(_) => "string",
            JsonValue::Bytes(_) => "bytes",
            JsonValue::Array(_) => "array",
            JsonValue::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsonValue::Null)
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, JsonValue>> {
        match self {
            JsonValue::Object(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&serde_json::Value> for JsonValue {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => JsonValue::Null,
            serde_json::Value::Bool(b) => JsonValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    JsonValue::Int64(i)
                } else if let Some(u) = n.as_u64() {
                    JsonValue::UInt64(u)
                } else {
                    JsonValue::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => JsonValue::String(s.clone()),
            serde_json::Value::Array(a) => JsonValue::Array(a.iter().map(JsonValue::from).collect()),
            serde_json::Value::Object(o) => {
                JsonValue::Object(o.iter().map(|(k, v)| (k.clone(), JsonValue::from(v))).collect())
            }
        }
    }
}

impl From<serde_json::Value> for JsonValue {
    fn from(v: serde_json::Value) -> Self {
        JsonValue::from(&v)
    }
}

// `JsonValue` travels through the join operator's key-value store as bytes
// (it has no bus-native representation of its own), so it round-trips
// through `serde_json::Value` rather than deriving serde directly — that
// keeps exactly one place (the `From` impls above/below) responsible for
// the `Bytes` variant's base64 encoding.
impl Serialize for JsonValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(JsonValue::from)
    }
}

impl From<&JsonValue> for serde_json::Value {
    fn from(v: &JsonValue) -> Self {
        match v {
            JsonValue::Null => serde_json::Value::Null,
            JsonValue::Bool(b) => serde_json::Value::Bool(*b),
            JsonValue::Int64(i) => serde_json::Value::Number((*i).into()),
            JsonValue::UInt64(u) => serde_json::Value::Number((*u).into()),
            JsonValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            JsonValue::String(s) => serde_json::Value::String(s.clone()),
            // A raw byte string has no native JSON representation; base64 it
            // so the round trip through `join_rows`/the bus stays lossless.
            JsonValue::Bytes(b) => {
                serde_json::Value::String(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b))
            }
            JsonValue::Array(a) => serde_json::Value::Array(a.iter().map(serde_json::Value::from).collect()),
            JsonValue::Object(o) => {
                serde_json::Value::Object(o.iter().map(|(k, v)| (k.clone(), v.into())).collect())
            }
        }
    }
}

/// Parses raw event bytes (canonically JSON) into a field map.
///
/// Returns an error string suitable for wrapping in
/// [`crate::error::SchemaError::ParseFailure`] by the caller.
pub fn parse_event(raw: &[u8]) -> Result<BTreeMap<String, JsonValue>, String> {
    let value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| e.to_string())?;
    match JsonValue::from(&value) {
        JsonValue::Object(m) => Ok(m),
        other => Err(format!("event is not a JSON object (found {})", other.type_name())),
    }
}
