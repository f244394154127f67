use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use etl_bus::MemoryBus;
use etl_core::{naming, Event, StreamBus, Transform};
use etl_ops::DedupOperator;
use etl_schema::{ClickHouseType, FieldDef, KafkaType, Mapping, MappingEntry, SchemaMapper, TopicSchema};
use tokio_util::sync::CancellationToken;

fn sample_mapper() -> SchemaMapper {
    let mut topics = BTreeMap::new();
    topics.insert(
        "events".to_string(),
        TopicSchema {
            fields: vec![
                FieldDef { name: "event_id".into(), kafka_type: KafkaType::String },
                FieldDef { name: "v".into(), kafka_type: KafkaType::Int64 },
            ],
            join_key_field: Some("event_id".into()),
        },
    );
    let mapping = Mapping(vec![MappingEntry {
        column_name: "v".into(),
        source_topic: "events".into(),
        source_field: "v".into(),
        clickhouse_type: ClickHouseType::Int64,
    }]);
    SchemaMapper::new(topics, mapping)
}

/// spec.md §8 seed scenario 3, scaled to a window short enough to sleep
/// through in real time: a duplicate key within the window is suppressed,
/// the same key arriving after the window lapses survives.
#[tokio::test]
async fn suppresses_duplicate_within_window_and_forwards_after_expiry() {
    let bus = MemoryBus::new();
    let mapper = Arc::new(sample_mapper());
    let window = Duration::from_millis(80);
    let mut dedup_op = DedupOperator::new("p1", "events", window, mapper);
    let metrics = dedup_op.metrics.clone();

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let run_bus: Arc<dyn StreamBus> = bus.clone();
    let handle = tokio::spawn(async move { dedup_op.run(run_bus, task_cancel).await });

    let input = naming::ingestor_subject("p1", "events");
    let output = naming::dedup_subject("p1");
    let mut sub = bus.subscribe(&output, "test").await.unwrap();

    bus.publish(&input, Event::new("events", None, br#"{"event_id":"E","v":1}"#.to_vec())).await.unwrap();
    let first = sub.next().await.unwrap().unwrap();
    assert_eq!(first.event.payload, br#"{"event_id":"E","v":1}"#);
    first.ack.ack().await.unwrap();

    // Still well within the window: a repeat of the same key is suppressed.
    bus.publish(&input, Event::new("events", None, br#"{"event_id":"E","v":2}"#.to_vec())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(metrics.snapshot().dropped_by_reason.get("duplicate"), Some(&1));

    // Past the window: the same key is a fresh occurrence and survives.
    tokio::time::sleep(window + Duration::from_millis(40)).await;
    bus.publish(&input, Event::new("events", None, br#"{"event_id":"E","v":3}"#.to_vec())).await.unwrap();
    let third = sub.next().await.unwrap().unwrap();
    assert_eq!(third.event.payload, br#"{"event_id":"E","v":3}"#);

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn event_with_no_usable_key_forwards_unsuppressed() {
    let bus = MemoryBus::new();
    let mapper = Arc::new(sample_mapper());
    let mut dedup_op = DedupOperator::new("p1", "events", Duration::from_secs(60), mapper);

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let run_bus: Arc<dyn StreamBus> = bus.clone();
    let handle = tokio::spawn(async move { dedup_op.run(run_bus, task_cancel).await });

    let input = naming::ingestor_subject("p1", "events");
    let output = naming::dedup_subject("p1");
    let mut sub = bus.subscribe(&output, "test").await.unwrap();

    // No `event_id` field at all: nothing to dedup on, so it passes through.
    bus.publish(&input, Event::new("events", None, br#"{"v":7}"#.to_vec())).await.unwrap();
    let delivery = sub.next().await.unwrap().unwrap();
    assert_eq!(delivery.event.payload, br#"{"v":7}"#);

    cancel.cancel();
    let _ = handle.await;
}
