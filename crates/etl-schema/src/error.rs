/// Per-event, deterministic failures raised by the schema mapper.
///
/// These never represent a systemic problem with the pipeline: the same
/// `(kafka_type, clickhouse_type, raw)` triple always fails the same way.
/// The calling operator decides disposition (log+count+drop, or escalate
/// after a configurable threshold) — the mapper itself never retries.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("type mismatch: expected {expected}, found {found} for field '{field}'")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("range overflow: value {value} does not fit in {target_type} for field '{field}'")]
    RangeOverflow {
        field: String,
        target_type: &'static str,
        value: String,
    },

    #[error("parse failure for field '{field}': {reason}")]
    ParseFailure { field: String, reason: String },

    #[error("join key field '{field}' missing from event on topic '{topic}'")]
    KeyMissing { topic: String, field: String },

    #[error("unsupported (kafka_type, clickhouse_type) pairing: {kafka_type} -> {clickhouse_type}")]
    UnsupportedType {
        kafka_type: String,
        clickhouse_type: String,
    },
}
