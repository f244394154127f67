//! Typed JSON extraction, ClickHouse type coercion and join-row merging.
//!
//! This crate owns the type compatibility matrix between a topic's declared
//! `KafkaType` fields and a sink column's declared `ClickHouseType`, plus the
//! dynamic value model (`JsonValue`/`TypedValue`/`ColumnValue`) every
//! operator in the pipeline passes events through as. It has no knowledge of
//! Kafka, ClickHouse, or the message bus — only of the JSON shapes and type
//! names those systems exchange.

mod clickhouse_type;
mod error;
mod json;
mod kafka_type;
mod mapper;
mod mapping;
mod matrix;
mod topic;
mod value;

pub use clickhouse_type::ClickHouseType;
pub use error::SchemaError;
pub use json::{parse_event, JsonValue};
pub use kafka_type::{extract_event_value, KafkaType};
pub use mapper::SchemaMapper;
pub use mapping::{Mapping, MappingEntry};
pub use matrix::convert_value;
pub use topic::{FieldDef, TopicSchema};
pub use value::{ColumnValue, TypedValue};
