use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::clickhouse_type::ClickHouseType;
use crate::error::SchemaError;
use crate::json::JsonValue;
use crate::kafka_type::{extract_event_value, KafkaType};
use crate::value::{ColumnValue, TypedValue};

/// `DateTime` string formats tried in order (spec.md §4.1, §8).
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z", // RFC3339 with fractional seconds
    "%Y-%m-%dT%H:%M:%S%:z",    // RFC3339
    "%Y-%m-%d %H:%M:%S%.f",    // common locale form with fraction
    "%Y-%m-%d %H:%M:%S",       // common locale form
    "%Y-%m-%dT%H:%M:%S",       // RFC3339 without an explicit offset
    "%a, %d %b %Y %H:%M:%S %Z", // RFC1123
    "%a, %d %b %Y %H:%M:%S %z", // RFC1123 with numeric offset
];

/// Enforces the type compatibility matrix of spec.md §4.1 and produces the
/// column value the sink will insert. `field` is used only for error
/// messages.
pub fn convert_value(
    field: &str,
    clickhouse_type: &ClickHouseType,
    kafka_type: KafkaType,
    raw: &JsonValue,
) -> Result<ColumnValue, SchemaError> {
    if raw.is_null() {
        return Ok(ColumnValue::Null);
    }

    let ct = clickhouse_type.underlying();

    match ct {
        ClickHouseType::Bool => {
            require_kafka(field, kafka_type, &[KafkaType::Bool], ct)?;
            match extract_event_value(field, kafka_type, raw)? {
                TypedValue::Bool(b) => Ok(ColumnValue::Bool(b)),
                _ => unreachable!("extract_event_value(Bool) only returns Bool"),
            }
        }
        ClickHouseType::Int8 | ClickHouseType::Int16 | ClickHouseType::Int32 | ClickHouseType::Int64 => {
            require_kafka(field, kafka_type, &[KafkaType::Int, matching_signed_width(ct)], ct)?;
            let n = match extract_event_value(field, kafka_type, raw)? {
                TypedValue::Int64(n) => n,
                _ => unreachable!("extract_event_value(Int*) only returns Int64"),
            };
            bounded_signed(field, ct, n)
        }
        ClickHouseType::UInt8 | ClickHouseType::UInt16 | ClickHouseType::UInt32 | ClickHouseType::UInt64 => {
            require_kafka(field, kafka_type, &[KafkaType::Uint, matching_unsigned_width(ct)], ct)?;
            let n = match extract_event_value(field, kafka_type, raw)? {
                TypedValue::UInt64(n) => n,
                _ => unreachable!("extract_event_value(UInt*) only returns UInt64"),
            };
            bounded_unsigned(field, ct, n)
        }
        ClickHouseType::Float32 | ClickHouseType::Float64 => {
            let matching_width = if *ct == ClickHouseType::Float32 { KafkaType::Float32 } else { KafkaType::Float64 };
            require_kafka(field, kafka_type, &[KafkaType::Float, matching_width], ct)?;
            let f = match extract_event_value(field, kafka_type, raw)? {
                TypedValue::Float64(f) => f,
                _ => unreachable!("extract_event_value(Float*) only returns Float64"),
            };
            Ok(if *ct == ClickHouseType::Float32 {
                ColumnValue::Float32(f as f32)
            } else {
                ColumnValue::Float64(f)
            })
        }
        ClickHouseType::String => {
            require_kafka(field, kafka_type, &[KafkaType::String, KafkaType::Bytes], ct)?;
            string_value(field, kafka_type, raw)
        }
        ClickHouseType::FixedString(_) | ClickHouseType::Enum8(_) | ClickHouseType::Enum16(_) | ClickHouseType::Uuid => {
            require_kafka(field, kafka_type, &[KafkaType::String], ct)?;
            let s = match extract_event_value(field, kafka_type, raw)? {
                TypedValue::String(s) => s,
                _ => unreachable!("extract_event_value(String) only returns String"),
            };
            Ok(match ct {
                ClickHouseType::Uuid => ColumnValue::Uuid(s),
                ClickHouseType::Enum8(_) | ClickHouseType::Enum16(_) => ColumnValue::Enum(s),
                _ => ColumnValue::String(s),
            })
        }
        ClickHouseType::DateTime => datetime_value(field, kafka_type, raw, None, ct),
        ClickHouseType::DateTime64(precision) => datetime_value(field, kafka_type, raw, Some(*precision), ct),
        ClickHouseType::LowCardinality(_) => unreachable!("underlying() already unwraps LowCardinality"),
    }
}

/// The one fixed-width `KafkaType` a given signed `ClickHouseType` accepts
/// besides the generic `int` (spec.md §4.1: "`Int{N}` ⇄ `int{N}` or generic
/// `int`" — same-width only, not any narrower or wider fixed width).
fn matching_signed_width(ct: &ClickHouseType) -> KafkaType {
    match ct {
        ClickHouseType::Int8 => KafkaType::Int8,
        ClickHouseType::Int16 => KafkaType::Int16,
        ClickHouseType::Int32 => KafkaType::Int32,
        ClickHouseType::Int64 => KafkaType::Int64,
        _ => unreachable!("matching_signed_width only called for Int* types"),
    }
}

fn matching_unsigned_width(ct: &ClickHouseType) -> KafkaType {
    match ct {
        ClickHouseType::UInt8 => KafkaType::Uint8,
        ClickHouseType::UInt16 => KafkaType::Uint16,
        ClickHouseType::UInt32 => KafkaType::Uint32,
        ClickHouseType::UInt64 => KafkaType::Uint64,
        _ => unreachable!("matching_unsigned_width only called for UInt* types"),
    }
}

fn require_kafka(
    _field: &str,
    kafka_type: KafkaType,
    allowed: &[KafkaType],
    ct: &ClickHouseType,
) -> Result<(), SchemaError> {
    if allowed.contains(&kafka_type) {
        Ok(())
    } else {
        Err(SchemaError::UnsupportedType {
            kafka_type: kafka_type.name().to_string(),
            clickhouse_type: ct.name(),
        })
    }
}

fn string_value(field: &str, kafka_type: KafkaType, raw: &JsonValue) -> Result<ColumnValue, SchemaError> {
    match (kafka_type, extract_event_value(field, kafka_type, raw)?) {
        (KafkaType::String, TypedValue::String(s)) => Ok(ColumnValue::String(s)),
        (KafkaType::Bytes, TypedValue::Bytes(b)) => {
            // A field declared `string` that arrives as `bytes` is
            // re-interpreted as UTF-8 (spec.md §4.1 edge policy).
            String::from_utf8(b)
                .map(ColumnValue::String)
                .map_err(|e| SchemaError::ParseFailure { field: field.to_string(), reason: e.to_string() })
        }
        _ => unreachable!("require_kafka already restricted to String/Bytes"),
    }
}

fn bounded_signed(field: &str, ct: &ClickHouseType, n: i64) -> Result<ColumnValue, SchemaError> {
    match ct {
        ClickHouseType::Int8 => i8::try_from(n)
            .map(ColumnValue::Int8)
            .map_err(|_| overflow(field, "Int8", n)),
        ClickHouseType::Int16 => i16::try_from(n)
            .map(ColumnValue::Int16)
            .map_err(|_| overflow(field, "Int16", n)),
        ClickHouseType::Int32 => i32::try_from(n)
            .map(ColumnValue::Int32)
            .map_err(|_| overflow(field, "Int32", n)),
        ClickHouseType::Int64 => Ok(ColumnValue::Int64(n)),
        _ => unreachable!("bounded_signed only called for Int* types"),
    }
}

fn bounded_unsigned(field: &str, ct: &ClickHouseType, n: u64) -> Result<ColumnValue, SchemaError> {
    match ct {
        ClickHouseType::UInt8 => u8::try_from(n)
            .map(ColumnValue::UInt8)
            .map_err(|_| overflow(field, "UInt8", n)),
        ClickHouseType::UInt16 => u16::try_from(n)
            .map(ColumnValue::UInt16)
            .map_err(|_| overflow(field, "UInt16", n)),
        ClickHouseType::UInt32 => u32::try_from(n)
            .map(ColumnValue::UInt32)
            .map_err(|_| overflow(field, "UInt32", n)),
        ClickHouseType::UInt64 => Ok(ColumnValue::UInt64(n)),
        _ => unreachable!("bounded_unsigned only called for UInt* types"),
    }
}

fn overflow(field: &str, target_type: &'static str, value: impl ToString) -> SchemaError {
    SchemaError::RangeOverflow { field: field.to_string(), target_type, value: value.to_string() }
}

fn datetime_value(
    field: &str,
    kafka_type: KafkaType,
    raw: &JsonValue,
    precision: Option<u32>,
    ct: &ClickHouseType,
) -> Result<ColumnValue, SchemaError> {
    require_kafka(field, kafka_type, &[KafkaType::Int64, KafkaType::Float64, KafkaType::String], ct)?;

    let (secs, nanos) = match extract_event_value(field, kafka_type, raw)? {
        TypedValue::Int64(n) => (n, 0u32),
        TypedValue::Float64(f) => {
            let secs = f.trunc() as i64;
            let nanos = ((f.fract()) * 1_000_000_000.0).round() as u32;
            (secs, nanos)
        }
        TypedValue::String(s) => parse_datetime_string(field, &s)?,
        _ => unreachable!("require_kafka restricted to numeric/string kafka types"),
    };

    Ok(match precision {
        Some(p) => {
            let scale = 10u64.pow(p.min(9));
            let fraction = (nanos as u64 * scale) / 1_000_000_000;
            ColumnValue::DateTime64(secs.saturating_mul(scale as i64) + fraction as i64, p)
        }
        None => ColumnValue::DateTime(secs),
    })
}

fn parse_datetime_string(field: &str, s: &str) -> Result<(i64, u32), SchemaError> {
    // RFC3339's "Z" offset (as opposed to a numeric "+00:00") isn't matched
    // by any `%:z`/`%z` format string below, so it's tried first via
    // chrono's dedicated RFC3339 parser (spec.md §8: "2023-10-15T12:30:45Z").
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok((dt.timestamp(), dt.timestamp_subsec_nanos()));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = chrono::DateTime::parse_from_str(s, fmt) {
            return Ok((dt.timestamp(), dt.timestamp_subsec_nanos()));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            // No explicit offset given: interpreted as UTC (spec.md §8).
            let dt = Utc.from_utc_datetime(&naive);
            return Ok((dt.timestamp(), dt.timestamp_subsec_nanos()));
        }
    }
    // Pure-date fallback: midnight UTC on that date.
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let dt = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"));
        return Ok((dt.timestamp(), 0));
    }
    Err(SchemaError::ParseFailure {
        field: field.to_string(),
        reason: format!("'{s}' does not match any accepted datetime format"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(n: i64) -> JsonValue {
        JsonValue::Int64(n)
    }

    #[test]
    fn int8_overflow() {
        let ok = convert_value("v", &ClickHouseType::Int8, KafkaType::Int, &kv(127)).unwrap();
        assert_eq!(ok, ColumnValue::Int8(127));
        let err = convert_value("v", &ClickHouseType::Int8, KafkaType::Int, &kv(128)).unwrap_err();
        assert!(matches!(err, SchemaError::RangeOverflow { .. }));
    }

    #[test]
    fn int8_column_rejects_mismatched_fixed_width() {
        // spec.md §4.1: "Int{N} <-> int{N} or generic int" -- a declared
        // Int64 field may not be mapped into an Int8 column even though
        // this particular value would fit.
        let err = convert_value("v", &ClickHouseType::Int8, KafkaType::Int64, &kv(1)).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedType { .. }));
    }

    #[test]
    fn float32_column_rejects_float64_kafka_type() {
        let err = convert_value("v", &ClickHouseType::Float32, KafkaType::Float64, &JsonValue::Float64(1.0))
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedType { .. }));
    }

    #[test]
    fn bool_matrix() {
        let v = convert_value("v", &ClickHouseType::Bool, KafkaType::Bool, &JsonValue::Bool(true)).unwrap();
        assert_eq!(v, ColumnValue::Bool(true));
        let err = convert_value("v", &ClickHouseType::Bool, KafkaType::Int, &kv(1)).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedType { .. }));
    }

    #[test]
    fn null_raw_is_always_null_column() {
        let v = convert_value("v", &ClickHouseType::Int32, KafkaType::Int, &JsonValue::Null).unwrap();
        assert_eq!(v, ColumnValue::Null);
    }

    #[test]
    fn rfc3339_datetime() {
        let v = convert_value(
            "ts",
            &ClickHouseType::DateTime,
            KafkaType::String,
            &JsonValue::String("2023-10-15T12:30:45Z".replace('Z', "+00:00")),
        )
        .unwrap();
        assert_eq!(v, ColumnValue::DateTime(1697372045));
    }

    #[test]
    fn rfc3339_datetime_with_z_suffix() {
        let v = convert_value(
            "ts",
            &ClickHouseType::DateTime,
            KafkaType::String,
            &JsonValue::String("2023-10-15T12:30:45Z".into()),
        )
        .unwrap();
        assert_eq!(v, ColumnValue::DateTime(1697372045));
    }

    #[test]
    fn space_separated_datetime_is_utc() {
        let v = convert_value(
            "ts",
            &ClickHouseType::DateTime,
            KafkaType::String,
            &JsonValue::String("2023-10-15 12:30:45".into()),
        )
        .unwrap();
        assert_eq!(v, ColumnValue::DateTime(1697372045));
    }

    #[test]
    fn datetime_column_rejects_generic_int_kafka_type() {
        let err = convert_value("ts", &ClickHouseType::DateTime, KafkaType::Int, &kv(1_697_372_045)).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedType { .. }));
    }

    #[test]
    fn low_cardinality_string_accepts_string() {
        let ct = ClickHouseType::LowCardinality(Box::new(ClickHouseType::String));
        let v = convert_value("v", &ct, KafkaType::String, &JsonValue::String("x".into())).unwrap();
        assert_eq!(v, ColumnValue::String("x".into()));
    }
}
