use std::collections::BTreeMap;

use crate::error::SchemaError;
use crate::json::JsonValue;
use crate::kafka_type::extract_event_value;
use crate::mapping::Mapping;
use crate::matrix::convert_value;
use crate::topic::TopicSchema;
use crate::value::{ColumnValue, TypedValue};

/// Bundles a pipeline's topic schemas and sink column mapping and exposes
/// the four operations every operator in the pipeline calls into: key
/// extraction for dedup/join, row assembly for the sink, and row merging
/// for the join operator.
///
/// `multi_topic` namespaces column lookups as `"<topic>.<field>"` once more
/// than one topic feeds the same sink table (spec.md §4.2); a single-topic
/// pipeline keeps bare field names so its events need no rewriting.
pub struct SchemaMapper {
    topics: BTreeMap<String, TopicSchema>,
    mapping: Mapping,
    multi_topic: bool,
}

impl SchemaMapper {
    pub fn new(topics: BTreeMap<String, TopicSchema>, mapping: Mapping) -> Self {
        let multi_topic = topics.len() > 1;
        Self { topics, mapping, multi_topic }
    }

    pub fn is_multi_topic(&self) -> bool {
        self.multi_topic
    }

    /// The sink's `INSERT` column list, in the same order `prepare_row`
    /// produces values for.
    pub fn column_names(&self) -> Vec<String> {
        self.mapping.get_ordered_columns().iter().map(|e| e.column_name.clone()).collect()
    }

    pub fn topic_schema(&self, topic: &str) -> Option<&TopicSchema> {
        self.topics.get(topic)
    }

    /// Extracts and decodes the dedup/join key declared for `topic`.
    /// A topic with no declared `join_key_field`, or whose value is absent
    /// or JSON `null`, cannot be deduped or joined on (spec.md §4.2, §8).
    pub fn get_join_key(
        &self,
        topic: &str,
        raw: &BTreeMap<String, JsonValue>,
    ) -> Result<TypedValue, SchemaError> {
        let schema = self.topics.get(topic).ok_or_else(|| SchemaError::KeyMissing {
            topic: topic.to_string(),
            field: "<undeclared topic>".to_string(),
        })?;
        let field_name = schema.join_key_field.as_ref().ok_or_else(|| SchemaError::KeyMissing {
            topic: topic.to_string(),
            field: "<no join_key_field declared>".to_string(),
        })?;
        let field = schema.field(field_name).ok_or_else(|| SchemaError::KeyMissing {
            topic: topic.to_string(),
            field: field_name.clone(),
        })?;
        match raw.get(field_name) {
            Some(v) if !v.is_null() => extract_event_value(field_name, field.kafka_type, v),
            _ => Err(SchemaError::KeyMissing { topic: topic.to_string(), field: field_name.clone() }),
        }
    }

    /// Builds the ordered column list the sink inserts, applying the type
    /// compatibility matrix to every mapped field. `raw` is either a bare
    /// topic event (single-topic pipelines) or the namespaced merged object
    /// produced by [`Self::join_rows`] (multi-topic pipelines).
    pub fn prepare_row(&self, raw: &BTreeMap<String, JsonValue>) -> Result<Vec<ColumnValue>, SchemaError> {
        self.mapping
            .get_ordered_columns()
            .iter()
            .map(|entry| {
                let schema = self.topics.get(&entry.source_topic).ok_or_else(|| SchemaError::KeyMissing {
                    topic: entry.source_topic.clone(),
                    field: entry.source_field.clone(),
                })?;
                let field = schema.field(&entry.source_field).ok_or_else(|| SchemaError::KeyMissing {
                    topic: entry.source_topic.clone(),
                    field: entry.source_field.clone(),
                })?;
                let lookup_key = self.column_key(&entry.source_topic, &entry.source_field);
                let value = raw.get(&lookup_key).unwrap_or(&JsonValue::Null);
                convert_value(&entry.column_name, &entry.clickhouse_type, field.kafka_type, value)
            })
            .collect()
    }

    /// Merges two sides of a temporal join into the namespaced object
    /// `prepare_row` expects, prefixing every field with its topic name so
    /// identically-named fields on each side never collide (spec.md §4.2).
    pub fn join_rows(
        &self,
        left_topic: &str,
        left_raw: &BTreeMap<String, JsonValue>,
        right_topic: &str,
        right_raw: &BTreeMap<String, JsonValue>,
    ) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (field, value) in left_raw {
            out.insert(format!("{left_topic}.{field}"), serde_json::Value::from(value));
        }
        for (field, value) in right_raw {
            out.insert(format!("{right_topic}.{field}"), serde_json::Value::from(value));
        }
        serde_json::Value::Object(out)
    }

    fn column_key(&self, topic: &str, field: &str) -> String {
        if self.multi_topic {
            format!("{topic}.{field}")
        } else {
            field.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clickhouse_type::ClickHouseType;
    use crate::kafka_type::KafkaType;
    use crate::mapping::MappingEntry;
    use crate::topic::FieldDef;

    fn single_topic_mapper() -> SchemaMapper {
        let mut topics = BTreeMap::new();
        topics.insert(
            "orders".to_string(),
            TopicSchema {
                fields: vec![
                    FieldDef { name: "id".into(), kafka_type: KafkaType::String },
                    FieldDef { name: "amount".into(), kafka_type: KafkaType::Int64 },
                ],
                join_key_field: Some("id".into()),
            },
        );
        let mapping = Mapping(vec![
            MappingEntry {
                column_name: "order_id".into(),
                source_topic: "orders".into(),
                source_field: "id".into(),
                clickhouse_type: ClickHouseType::String,
            },
            MappingEntry {
                column_name: "order_amount".into(),
                source_topic: "orders".into(),
                source_field: "amount".into(),
                clickhouse_type: ClickHouseType::Int64,
            },
        ]);
        SchemaMapper::new(topics, mapping)
    }

    #[test]
    fn single_topic_uses_bare_field_names() {
        let mapper = single_topic_mapper();
        assert!(!mapper.is_multi_topic());
        let mut raw = BTreeMap::new();
        raw.insert("id".to_string(), JsonValue::String("ord-1".into()));
        raw.insert("amount".to_string(), JsonValue::Int64(42));
        let row = mapper.prepare_row(&raw).unwrap();
        assert_eq!(row, vec![ColumnValue::String("ord-1".into()), ColumnValue::Int64(42)]);
    }

    #[test]
    fn missing_field_becomes_null_column() {
        let mapper = single_topic_mapper();
        let mut raw = BTreeMap::new();
        raw.insert("id".to_string(), JsonValue::String("ord-1".into()));
        let row = mapper.prepare_row(&raw).unwrap();
        assert_eq!(row[1], ColumnValue::Null);
    }

    #[test]
    fn join_key_missing_declared_field_errors() {
        let mapper = single_topic_mapper();
        let raw = BTreeMap::new();
        let err = mapper.get_join_key("orders", &raw).unwrap_err();
        assert!(matches!(err, SchemaError::KeyMissing { .. }));
    }
}
