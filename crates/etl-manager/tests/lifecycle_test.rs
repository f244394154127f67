use etl_bus::MemoryBus;
use etl_core::{JoinDef, JoinSourceDef, PipelineDefinition};
use etl_manager::{PipelineManager, PipelineState};

fn single_topic_def() -> PipelineDefinition {
    serde_json::from_str(
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
        }"#,
    )
    .unwrap()
}

/// spec.md §6 `create(pipeline_definition) -> pipeline_id | error`: a
/// well-formed single-topic definition is accepted and starts `Starting`
/// with no operators reported yet.
#[test]
fn create_accepts_a_valid_single_topic_definition() {
    let bus = MemoryBus::new();
    let manager = PipelineManager::create(single_topic_def(), bus).unwrap();
    assert_eq!(manager.pipeline_id(), "orders-pipeline");

    let status = manager.status();
    assert_eq!(status.state, PipelineState::Starting);
    assert!(status.operators.is_empty());
}

/// A pipeline wiring two topics to one sink table with no join has no
/// operator that can merge them onto the sink's single input subject —
/// rejected at `create`, before any operator is spawned.
#[test]
fn create_rejects_multiple_topics_without_a_join() {
    let mut def = single_topic_def();
    def.topics.push(def.topics[0].clone());
    def.topics[1].name = "returns".to_string();
    let returns_mapping_source = def.table_mapping[0].clone();
    def.table_mapping.push(etl_core::MappingEntryDef {
        source_topic: "returns".to_string(),
        ..returns_mapping_source
    });

    let bus = MemoryBus::new();
    assert!(PipelineManager::create(def, bus).is_err());
}

/// A two-topic pipeline with a declared join is accepted.
#[test]
fn create_accepts_two_topics_with_a_join() {
    let mut def = single_topic_def();
    def.topics.push(def.topics[0].clone());
    def.topics[1].name = "returns".to_string();
    let returns_mapping_source = def.table_mapping[0].clone();
    def.table_mapping.push(etl_core::MappingEntryDef {
        source_topic: "returns".to_string(),
        ..returns_mapping_source
    });
    def.join = Some(JoinDef {
        sources: vec![
            JoinSourceDef { source_id: "orders".into(), time_window: "30s".into() },
            JoinSourceDef { source_id: "returns".into(), time_window: "30s".into() },
        ],
    });

    let bus = MemoryBus::new();
    assert!(PipelineManager::create(def, bus).is_ok());
}
