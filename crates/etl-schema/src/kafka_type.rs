use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::json::JsonValue;
use crate::value::TypedValue;

/// The closed set of source types a topic field may declare (spec.md §3).
///
/// `Int`/`UInt`/`Float` are the generic, width-unspecified variants; the
/// fixed-width variants enforce a bounds check on decode. Implicit widening
/// between two *fixed* widths is forbidden — only the generic variant may
/// widen, and even then the bound is still checked (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KafkaType {
    String,
    Bytes,
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Float32,
    Float64,
}

impl KafkaType {
    pub fn name(&self) -> &'static str {
        match self {
            KafkaType::String => "string",
            KafkaType::Bytes => "bytes",
            KafkaType::Bool => "bool",
            KafkaType::Int => "int",
            KafkaType::Int8 => "int8",
            KafkaType::Int16 => "int16",
            KafkaType::Int32 => "int32",
            KafkaType::Int64 => "int64",
            KafkaType::Uint => "uint",
            KafkaType::Uint8 => "uint8",
            KafkaType::Uint16 => "uint16",
            KafkaType::Uint32 => "uint32",
            KafkaType::Uint64 => "uint64",
            KafkaType::Float => "float",
            KafkaType::Float32 => "float32",
            KafkaType::Float64 => "float64",
        }
    }

    fn signed_bound(&self) -> Option<(i64, i64)> {
        match self {
            KafkaType::Int | KafkaType::Int64 => Some((i64::MIN, i64::MAX)),
            KafkaType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            KafkaType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            KafkaType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            _ => None,
        }
    }

    fn unsigned_bound(&self) -> Option<u64> {
        match self {
            KafkaType::Uint | KafkaType::Uint64 => Some(u64::MAX),
            KafkaType::Uint8 => Some(u8::MAX as u64),
            KafkaType::Uint16 => Some(u16::MAX as u64),
            KafkaType::Uint32 => Some(u32::MAX as u64),
            _ => None,
        }
    }
}

/// Decodes one JSON value as the declared kafka type (spec.md §4.1).
///
/// Numeric JSON values arrive as IEEE-754 doubles; integer decode truncates
/// toward zero and is always range-checked against the declared width.
/// String -> int/float uses base-10 parsing with no whitespace trimming.
pub fn extract_event_value(
    field: &str,
    kafka_type: KafkaType,
    raw: &JsonValue,
) -> Result<TypedValue, SchemaError> {
    match kafka_type {
        KafkaType::Bool => match raw {
            JsonValue::Bool(b) => Ok(TypedValue::Bool(*b)),
            other => Err(mismatch(field, "bool", other)),
        },
        KafkaType::String => match raw {
            JsonValue::String(s) => Ok(TypedValue::String(s.clone())),
            other => Err(mismatch(field, "string", other)),
        },
        KafkaType::Bytes => match raw {
            // A field declared `bytes` that arrives as a JSON string is
            // decoded as UTF-8 bytes (spec.md §4.1 edge policy).
            JsonValue::String(s) => Ok(TypedValue::Bytes(s.as_bytes().to_vec())),
            JsonValue::Bytes(b) => Ok(TypedValue::Bytes(b.clone())),
            other => Err(mismatch(field, "bytes", other)),
        },
        KafkaType::Int | KafkaType::Int8 | KafkaType::Int16 | KafkaType::Int32 | KafkaType::Int64 => {
            let n = extract_signed(field, raw)?;
            let (lo, hi) = kafka_type.signed_bound().expect("signed kafka type");
            if n < lo || n > hi {
                return Err(SchemaError::RangeOverflow {
                    field: field.to_string(),
                    target_type: kafka_type.name(),
                    value: n.to_string(),
                });
            }
            Ok(TypedValue::Int64(n))
        }
        KafkaType::Uint | KafkaType::Uint8 | KafkaType::Uint16 | KafkaType::Uint32 | KafkaType::Uint64 => {
            let n = extract_unsigned(field, raw)?;
            let hi = kafka_type.unsigned_bound().expect("unsigned kafka type");
            if n > hi {
                return Err(SchemaError::RangeOverflow {
                    field: field.to_string(),
                    target_type: kafka_type.name(),
                    value: n.to_string(),
                });
            }
            Ok(TypedValue::UInt64(n))
        }
        KafkaType::Float | KafkaType::Float64 | KafkaType::Float32 => {
            Ok(TypedValue::Float64(extract_float(field, raw)?))
        }
    }
}

fn extract_signed(field: &str, raw: &JsonValue) -> Result<i64, SchemaError> {
    match raw {
        JsonValue::Int64(i) => Ok(*i),
        JsonValue::UInt64(u) => i64::try_from(*u).map_err(|_| SchemaError::RangeOverflow {
            field: field.to_string(),
            target_type: "int64",
            value: u.to_string(),
        }),
        JsonValue::Float64(f) => Ok(*f as i64),
        JsonValue::String(s) => s.parse::<i64>().map_err(|e| SchemaError::ParseFailure {
            field: field.to_string(),
            reason: e.to_string(),
        }),
        other => Err(mismatch(field, "int", other)),
    }
}

fn extract_unsigned(field: &str, raw: &JsonValue) -> Result<u64, SchemaError> {
    match raw {
        JsonValue::UInt64(u) => Ok(*u),
        JsonValue::Int64(i) => u64::try_from(*i).map_err(|_| SchemaError::RangeOverflow {
            field: field.to_string(),
            target_type: "uint64",
            value: i.to_string(),
        }),
        JsonValue::Float64(f) if *f >= 0.0 => Ok(*f as u64),
        JsonValue::String(s) => s.parse::<u64>().map_err(|e| SchemaError::ParseFailure {
            field: field.to_string(),
            reason: e.to_string(),
        }),
        other => Err(mismatch(field, "uint", other)),
    }
}

fn extract_float(field: &str, raw: &JsonValue) -> Result<f64, SchemaError> {
    match raw {
        JsonValue::Float64(f) => Ok(*f),
        JsonValue::Int64(i) => Ok(*i as f64),
        JsonValue::UInt64(u) => Ok(*u as f64),
        JsonValue::String(s) => s.parse::<f64>().map_err(|e| SchemaError::ParseFailure {
            field: field.to_string(),
            reason: e.to_string(),
        }),
        other => Err(mismatch(field, "float", other)),
    }
}

fn mismatch(field: &str, expected: &'static str, found: &JsonValue) -> SchemaError {
    SchemaError::TypeMismatch {
        field: field.to_string(),
        expected,
        found: found.type_name(),
    }
}
