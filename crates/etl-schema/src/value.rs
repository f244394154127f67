use std::fmt::Write as _;

/// The decoded result of [`crate::kafka_type::extract_event_value`].
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// A value coerced to its ClickHouse column type, ready for the sink.
///
/// `Null` is a first-class variant: missing source fields and empty
/// optional slots both produce it rather than an error (spec.md §4.1, §8).
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    /// Unix seconds.
    DateTime(i64),
    /// Unix seconds and sub-second fraction folded into a single integer at
    /// the given precision (i.e. `seconds * 10^precision + fraction`), plus
    /// the precision itself for rendering.
    DateTime64(i64, u32),
    Uuid(String),
    Enum(String),
}

impl ColumnValue {
    /// Renders the value as a ClickHouse SQL literal suitable for an
    /// `INSERT ... VALUES (...)` statement. Strings are single-quote
    /// escaped; this is the dynamic-schema equivalent of a parameterized
    /// bind when the column set is only known at pipeline-definition time.
    pub fn to_sql_literal(&self) -> String {
        match self {
            ColumnValue::Null => "NULL".to_string(),
            ColumnValue::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
            ColumnValue::Int8(v) => v.to_string(),
            ColumnValue::Int16(v) => v.to_string(),
            ColumnValue::Int32(v) => v.to_string(),
            ColumnValue::Int64(v) => v.to_string(),
            ColumnValue::UInt8(v) => v.to_string(),
            ColumnValue::UInt16(v) => v.to_string(),
            ColumnValue::UInt32(v) => v.to_string(),
            ColumnValue::UInt64(v) => v.to_string(),
            ColumnValue::Float32(v) => v.to_string(),
            ColumnValue::Float64(v) => v.to_string(),
            ColumnValue::String(s) => quote_string(s),
            ColumnValue::DateTime(secs) => format!("toDateTime({secs})"),
            ColumnValue::DateTime64(scaled, precision) => {
                let scale = 10i64.pow(*precision);
                format!("toDateTime64({scaled} / {scale}.0, {precision})")
            }
            ColumnValue::Uuid(s) => format!("toUUID({})", quote_string(s)),
            ColumnValue::Enum(s) => quote_string(s),
        }
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => {
                let _ = write!(out, "{c}");
            }
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literal_escapes_quotes() {
        assert_eq!(ColumnValue::String("o'brien".into()).to_sql_literal(), "'o\\'brien'");
    }

    #[test]
    fn null_literal() {
        assert_eq!(ColumnValue::Null.to_sql_literal(), "NULL");
    }
}
