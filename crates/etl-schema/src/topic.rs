use std::collections::BTreeMap;

use crate::error::SchemaError;
use crate::json::JsonValue;
use crate::kafka_type::KafkaType;

/// One field of a topic's declared event schema (spec.md §6
/// `topics[].schema.fields[]`).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kafka_type: KafkaType,
}

/// The declared schema for a single topic, plus which field (if any) is
/// used as the dedup/join key for that topic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopicSchema {
    pub fields: Vec<FieldDef>,
    pub join_key_field: Option<String>,
}

impl TopicSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks that every declared field is present in `raw` (spec.md §4.3:
    /// the ingestor validates "by parsing all declared fields, but without
    /// type coercion beyond presence"). A field whose value is present but
    /// JSON `null` is treated as absent, matching how `prepare_row` later
    /// treats a null source value as a missing slot rather than a typed one.
    pub fn validate_presence(&self, raw: &BTreeMap<String, JsonValue>) -> Result<(), SchemaError> {
        for field in &self.fields {
            match raw.get(&field.name) {
                Some(v) if !v.is_null() => {}
                _ => {
                    return Err(SchemaError::ParseFailure {
                        field: field.name.clone(),
                        reason: "declared field missing from event".to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TopicSchema {
        TopicSchema {
            fields: vec![
                FieldDef { name: "id".into(), kafka_type: KafkaType::String },
                FieldDef { name: "amount".into(), kafka_type: KafkaType::Int64 },
            ],
            join_key_field: Some("id".into()),
        }
    }

    #[test]
    fn validate_presence_accepts_all_fields_present() {
        let mut raw = BTreeMap::new();
        raw.insert("id".to_string(), JsonValue::String("a".into()));
        raw.insert("amount".to_string(), JsonValue::Int64(1));
        assert!(schema().validate_presence(&raw).is_ok());
    }

    #[test]
    fn validate_presence_rejects_missing_field() {
        let mut raw = BTreeMap::new();
        raw.insert("id".to_string(), JsonValue::String("a".into()));
        let err = schema().validate_presence(&raw).unwrap_err();
        assert!(matches!(err, SchemaError::ParseFailure { .. }));
    }

    #[test]
    fn validate_presence_treats_null_as_missing() {
        let mut raw = BTreeMap::new();
        raw.insert("id".to_string(), JsonValue::String("a".into()));
        raw.insert("amount".to_string(), JsonValue::Null);
        assert!(schema().validate_presence(&raw).is_err());
    }
}
