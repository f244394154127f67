use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use etl_bus::MemoryBus;
use etl_core::{naming, Event, StreamBus, Transform};
use etl_ops::JoinOperator;
use etl_schema::{ClickHouseType, FieldDef, KafkaType, Mapping, MappingEntry, SchemaMapper, TopicSchema};
use tokio_util::sync::CancellationToken;

fn sample_mapper() -> SchemaMapper {
    let mut topics = BTreeMap::new();
    topics.insert(
        "users".to_string(),
        TopicSchema {
            fields: vec![
                FieldDef { name: "id".into(), kafka_type: KafkaType::Int64 },
                FieldDef { name: "name".into(), kafka_type: KafkaType::String },
            ],
            join_key_field: Some("id".into()),
        },
    );
    topics.insert(
        "orders".to_string(),
        TopicSchema {
            fields: vec![
                FieldDef { name: "order_id".into(), kafka_type: KafkaType::String },
                FieldDef { name: "user_id".into(), kafka_type: KafkaType::Int64 },
                FieldDef { name: "amount".into(), kafka_type: KafkaType::Float64 },
            ],
            join_key_field: Some("user_id".into()),
        },
    );
    let mapping = Mapping(vec![
        MappingEntry {
            column_name: "user_name".into(),
            source_topic: "users".into(),
            source_field: "name".into(),
            clickhouse_type: ClickHouseType::String,
        },
        MappingEntry {
            column_name: "order_amount".into(),
            source_topic: "orders".into(),
            source_field: "amount".into(),
            clickhouse_type: ClickHouseType::Float64,
        },
    ]);
    SchemaMapper::new(topics, mapping)
}

/// spec.md §8 seed scenario 2: a `users` row joined with a later `orders`
/// row on `id`/`user_id`, within both sides' windows. The merged row
/// namespaces every field as `"<topic>.<field>"`.
#[tokio::test]
async fn joins_matching_keys_across_both_sides_into_a_namespaced_row() {
    let bus = MemoryBus::new();
    let mapper = Arc::new(sample_mapper());

    let mut input_subjects = BTreeMap::new();
    input_subjects.insert("users".to_string(), naming::ingestor_subject("p1", "users"));
    input_subjects.insert("orders".to_string(), naming::ingestor_subject("p1", "orders"));

    let mut join_op = JoinOperator::new(
        "p1",
        "users",
        "orders",
        input_subjects.clone(),
        Duration::from_secs(10),
        Duration::from_secs(10),
        mapper,
    );
    let metrics = join_op.metrics.clone();

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let run_bus: Arc<dyn StreamBus> = bus.clone();
    let handle = tokio::spawn(async move { join_op.run(run_bus, task_cancel).await });

    let output = naming::join_subject("p1");
    let mut sub = bus.subscribe(&output, "test").await.unwrap();

    bus.publish(
        input_subjects.get("users").unwrap(),
        Event::new("users", None, br#"{"id":1,"name":"A"}"#.to_vec()),
    )
    .await
    .unwrap();
    bus.publish(
        input_subjects.get("orders").unwrap(),
        Event::new("orders", None, br#"{"order_id":"o1","user_id":1,"amount":9.5}"#.to_vec()),
    )
    .await
    .unwrap();

    let delivery = sub.next().await.unwrap().unwrap();
    let merged: serde_json::Value = serde_json::from_slice(&delivery.event.payload).unwrap();
    assert_eq!(merged["users.id"], serde_json::json!(1));
    assert_eq!(merged["users.name"], serde_json::json!("A"));
    assert_eq!(merged["orders.order_id"], serde_json::json!("o1"));
    assert_eq!(merged["orders.user_id"], serde_json::json!(1));
    assert_eq!(merged["orders.amount"], serde_json::json!(9.5));
    assert_eq!(metrics.snapshot().events_out, 1);

    cancel.cancel();
    let _ = handle.await;
}

/// A key on one side that never gets a match on the other side produces no
/// join row at all — this is an inner join (spec.md §4.5).
#[tokio::test]
async fn unmatched_key_on_either_side_produces_no_row() {
    let bus = MemoryBus::new();
    let mapper = Arc::new(sample_mapper());

    let mut input_subjects = BTreeMap::new();
    input_subjects.insert("users".to_string(), naming::ingestor_subject("p1", "users"));
    input_subjects.insert("orders".to_string(), naming::ingestor_subject("p1", "orders"));

    let mut join_op = JoinOperator::new(
        "p1",
        "users",
        "orders",
        input_subjects.clone(),
        Duration::from_secs(10),
        Duration::from_secs(10),
        mapper,
    );

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let run_bus: Arc<dyn StreamBus> = bus.clone();
    let handle = tokio::spawn(async move { join_op.run(run_bus, task_cancel).await });

    bus.publish(
        input_subjects.get("users").unwrap(),
        Event::new("users", None, br#"{"id":42,"name":"Lonely"}"#.to_vec()),
    )
    .await
    .unwrap();

    // Give the operator a moment to consume and store the side-42 entry,
    // then confirm a second, unrelated user key also produces nothing yet.
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.publish(
        input_subjects.get("users").unwrap(),
        Event::new("users", None, br#"{"id":43,"name":"AlsoLonely"}"#.to_vec()),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let output = naming::join_subject("p1");
    let mut sub = bus.subscribe(&output, "test").await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(30), sub.next()).await.is_err());

    cancel.cancel();
    let _ = handle.await;
}
