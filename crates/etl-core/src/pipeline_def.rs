use std::collections::BTreeMap;
use std::time::Duration;

use etl_schema::{ClickHouseType, FieldDef, KafkaType, Mapping, MappingEntry, TopicSchema};
use serde::Deserialize;

use crate::error::EtlError;

/// Parses the `"<n><s|m|h|d>"` duration strings spec.md §4.4/§6 uses for
/// dedup/join windows and the sink's `max_delay_time` (e.g. `"30s"`,
/// `"10m"`, `"1h"`, `"2d"`).
pub fn parse_time_window(raw: &str) -> Result<Duration, EtlError> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| {
        EtlError::Configuration(format!("time window '{raw}' has no unit suffix (expected s/m/h/d)"))
    })?;
    let (digits, unit) = raw.split_at(split_at);
    let n: u64 = digits
        .parse()
        .map_err(|_| EtlError::Configuration(format!("time window '{raw}' has no numeric magnitude")))?;
    let seconds = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3_600,
        "d" => n * 86_400,
        other => {
            return Err(EtlError::Configuration(format!(
                "time window '{raw}' has unsupported unit '{other}' (expected s/m/h/d)"
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

/// The JSON document a pipeline is defined by (spec.md §6). Field names are
/// the wire format exactly; this is what `PipelineManager::create` parses.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDefinition {
    pub pipeline_id: String,
    pub topics: Vec<TopicDef>,
    #[serde(default)]
    pub dedup: Option<DedupDef>,
    #[serde(default)]
    pub join: Option<JoinDef>,
    pub table_mapping: Vec<MappingEntryDef>,
    pub sink: SinkDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicDef {
    pub name: String,
    pub brokers: String,
    pub schema: SchemaDef,
    #[serde(default)]
    pub join_key_field: Option<String>,
    #[serde(default)]
    pub consumer_group_initial_offset: InitialOffsetDef,
}

/// Where a topic's consumer group starts reading on its very first run
/// (spec.md §4.3, §6). Generic earliest/latest semantics belong here
/// rather than in `etl-io`, which only knows how to express them to
/// `rdkafka`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffsetDef {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDef {
    pub fields: Vec<FieldDefDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDefDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kafka_type: KafkaType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupDef {
    pub topic: String,
    /// `"<n><s|m|h|d>"` (spec.md §4.4/§6), e.g. `"60s"`, `"10m"`.
    pub time_window: String,
}

impl DedupDef {
    pub fn window(&self) -> Result<Duration, EtlError> {
        parse_time_window(&self.time_window)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinDef {
    pub sources: Vec<JoinSourceDef>,
}

/// One side of a temporal join: which topic, with what window, and
/// (implicitly, by position — first entry is `left`, second is `right`)
/// which orientation (spec.md §4.5, §6 `join.sources[].orientation`).
#[derive(Debug, Clone, Deserialize)]
pub struct JoinSourceDef {
    pub source_id: String,
    /// `"<n><s|m|h|d>"` (spec.md §4.5/§6), e.g. `"10s"`, `"1h"`.
    pub time_window: String,
}

impl JoinSourceDef {
    pub fn window(&self) -> Result<Duration, EtlError> {
        parse_time_window(&self.time_window)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingEntryDef {
    pub column_name: String,
    pub source_topic: String,
    pub source_field: String,
    pub column_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkDef {
    pub dsn: String,
    pub table: String,
    #[serde(default = "default_batch_max_rows")]
    pub batch_max_rows: usize,
    #[serde(default = "default_batch_max_millis")]
    pub batch_max_millis: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_batches: usize,
}

fn default_batch_max_rows() -> usize {
    10_000
}

fn default_batch_max_millis() -> u64 {
    1_000
}

fn default_max_in_flight() -> usize {
    1
}

impl PipelineDefinition {
    /// Validates the cross-referential invariants spec.md §3 requires:
    /// every mapping entry and the join/dedup configuration must reference
    /// declared topics and fields, and a join must name exactly two
    /// distinct topics. Parsing alone (serde) only checks shape, not these
    /// cross-references.
    pub fn validate(&self) -> Result<(), EtlError> {
        if self.pipeline_id.trim().is_empty() {
            return Err(EtlError::Configuration("pipeline_id must not be empty".into()));
        }
        if self.topics.is_empty() {
            return Err(EtlError::Configuration("at least one topic is required".into()));
        }

        let mut seen_topics = BTreeMap::new();
        for topic in &self.topics {
            if seen_topics.insert(topic.name.clone(), topic).is_some() {
                return Err(EtlError::Configuration(format!("duplicate topic name '{}'", topic.name)));
            }
        }

        if let Some(dedup) = &self.dedup {
            let topic = seen_topics.get(&dedup.topic).ok_or_else(|| {
                EtlError::Configuration(format!("dedup.topic '{}' is not a declared topic", dedup.topic))
            })?;
            if topic.join_key_field.is_none() {
                return Err(EtlError::Configuration(format!(
                    "dedup.topic '{}' has no join_key_field to dedup on",
                    dedup.topic
                )));
            }
            dedup.window()?;
        }

        if let Some(join) = &self.join {
            let distinct: std::collections::BTreeSet<_> = join.sources.iter().map(|s| &s.source_id).collect();
            if join.sources.len() != 2 || distinct.len() != 2 {
                return Err(EtlError::Configuration(
                    "join.sources must name exactly two distinct topics".into(),
                ));
            }
            for source in &join.sources {
                let topic = seen_topics.get(&source.source_id).ok_or_else(|| {
                    EtlError::Configuration(format!(
                        "join.sources references undeclared topic '{}'",
                        source.source_id
                    ))
                })?;
                if topic.join_key_field.is_none() {
                    return Err(EtlError::Configuration(format!(
                        "join source topic '{}' has no join_key_field",
                        source.source_id
                    )));
                }
                source.window()?;
            }
        }

        if self.table_mapping.is_empty() {
            return Err(EtlError::Configuration("table_mapping must not be empty".into()));
        }
        for entry in &self.table_mapping {
            let topic = seen_topics.get(&entry.source_topic).ok_or_else(|| {
                EtlError::Configuration(format!(
                    "table_mapping references undeclared topic '{}'",
                    entry.source_topic
                ))
            })?;
            if !topic.schema.fields.iter().any(|f| f.name == entry.source_field) {
                return Err(EtlError::Configuration(format!(
                    "table_mapping references undeclared field '{}.{}'",
                    entry.source_topic, entry.source_field
                )));
            }
            ClickHouseType::parse(&entry.column_type)
                .map_err(|e| EtlError::Configuration(format!("table_mapping column '{}': {e}", entry.column_name)))?;
        }

        Ok(())
    }

    pub fn topic_schemas(&self) -> BTreeMap<String, TopicSchema> {
        self.topics
            .iter()
            .map(|t| {
                let schema = TopicSchema {
                    fields: t.schema.fields.iter().map(|f| FieldDef { name: f.name.clone(), kafka_type: f.kafka_type }).collect(),
                    join_key_field: t.join_key_field.clone(),
                };
                (t.name.clone(), schema)
            })
            .collect()
    }

    pub fn mapping(&self) -> Result<Mapping, EtlError> {
        self.table_mapping
            .iter()
            .map(|e| {
                let clickhouse_type = ClickHouseType::parse(&e.column_type)
                    .map_err(|err| EtlError::Configuration(format!("column '{}': {err}", e.column_name)))?;
                Ok(MappingEntry {
                    column_name: e.column_name.clone(),
                    source_topic: e.source_topic.clone(),
                    source_field: e.source_field.clone(),
                    clickhouse_type,
                })
            })
            .collect::<Result<Vec<_>, EtlError>>()
            .map(Mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "pipeline_id": "orders-pipeline",
            "topics": [
                {
                    "name": "orders",
                    "brokers": "localhost:9092",
                    "schema": { "fields": [ { "name": "id", "type": "string" }, { "name": "amount", "type": "int64" } ] },
                    "join_key_field": "id"
                }
            ],
            "table_mapping": [
                { "column_name": "order_id", "source_topic": "orders", "source_field": "id", "column_type": "String" },
                { "column_name": "order_amount", "source_topic": "orders", "source_field": "amount", "column_type": "Int64" }
            ],
            "sink": { "dsn": "http://localhost:8123", "table": "orders_flat" }
        }"#
    }

    #[test]
    fn parses_and_validates_minimal_pipeline() {
        let def: PipelineDefinition = serde_json::from_str(sample_json()).unwrap();
        def.validate().unwrap();
        assert_eq!(def.sink.batch_max_rows, 10_000);
    }

    #[test]
    fn rejects_mapping_to_undeclared_field() {
        let mut def: PipelineDefinition = serde_json::from_str(sample_json()).unwrap();
        def.table_mapping[0].source_field = "missing".into();
        assert!(def.validate().is_err());
    }

    #[test]
    fn rejects_join_with_one_source() {
        let mut def: PipelineDefinition = serde_json::from_str(sample_json()).unwrap();
        def.join = Some(JoinDef {
            sources: vec![JoinSourceDef { source_id: "orders".into(), time_window: "30s".into() }],
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn time_window_parses_every_unit() {
        assert_eq!(parse_time_window("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_time_window("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_time_window("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_time_window("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn time_window_rejects_unknown_unit() {
        assert!(parse_time_window("10x").is_err());
    }

    #[test]
    fn time_window_rejects_missing_magnitude() {
        assert!(parse_time_window("s").is_err());
    }

    #[test]
    fn dedup_window_is_validated_at_create_time() {
        let mut def: PipelineDefinition = serde_json::from_str(sample_json()).unwrap();
        def.dedup = Some(DedupDef { topic: "orders".into(), time_window: "not-a-duration".into() });
        assert!(def.validate().is_err());
    }
}
