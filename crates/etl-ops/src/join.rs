use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etl_core::{naming, Event, EtlResult, Operator, OperatorMetrics, StreamBus, Transform};
use etl_schema::SchemaMapper;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::key::encode_key;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Temporal (windowed) inner join of two topics on their declared join
/// keys. Every arriving event is both stored (for the other side's future
/// probe) and used to probe the other side's already-buffered window;
/// every match produces one merged, namespaced row (spec.md §4.2).
///
/// A window entry that TTL-expires before the other side probes it is
/// silently dropped — this is an inner join, not an outer one, and a late
/// arrival outside the window was never a candidate match to begin with.
pub struct JoinOperator {
    pipeline_id: String,
    left_topic: String,
    right_topic: String,
    input_subjects: BTreeMap<String, String>,
    left_window: Duration,
    right_window: Duration,
    mapper: Arc<SchemaMapper>,
    seq: AtomicU64,
    pub metrics: Arc<OperatorMetrics>,
}

impl JoinOperator {
    /// `left_window`/`right_window` are each side's own TTL (spec.md §4.5:
    /// "a time window (a duration)" per side, not one shared window) — a
    /// stored entry always carries the window of the side that stored it,
    /// regardless of which side later probes it.
    pub fn new(
        pipeline_id: impl Into<String>,
        left_topic: impl Into<String>,
        right_topic: impl Into<String>,
        input_subjects: BTreeMap<String, String>,
        left_window: Duration,
        right_window: Duration,
        mapper: Arc<SchemaMapper>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            left_topic: left_topic.into(),
            right_topic: right_topic.into(),
            input_subjects,
            left_window,
            right_window,
            mapper,
            seq: AtomicU64::new(0),
            metrics: Arc::new(OperatorMetrics::default()),
        }
    }

    fn topic(&self, side: Side) -> &str {
        match side {
            Side::Left => &self.left_topic,
            Side::Right => &self.right_topic,
        }
    }

    fn window_for(&self, side: Side) -> Duration {
        match side {
            Side::Left => self.left_window,
            Side::Right => self.right_window,
        }
    }

    async fn handle_event(
        &self,
        bus: &Arc<dyn StreamBus>,
        output_subject: &str,
        side: Side,
        event: Event,
    ) -> EtlResult<()> {
        let topic = self.topic(side).to_string();
        let fields = match etl_schema::parse_event(&event.payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropping unparseable event");
                self.metrics.record_dropped("parse");
                return Ok(());
            }
        };

        let key = match self.mapper.get_join_key(&topic, &fields) {
            Ok(k) => k,
            Err(e) => {
                debug!(topic = %topic, error = %e, "event has no usable join key, dropping from join");
                self.metrics.record_dropped("no_key");
                return Ok(());
            }
        };
        let key_str = encode_key(&key);

        // Probe the other side's window for every already-buffered match,
        // oldest first so emission order follows arrival order.
        let probe_prefix = format!("{}:{key_str}:", side.other().tag());
        let mut matches = bus.kv().keys_with_prefix(&probe_prefix).await?;
        matches.sort();

        for match_key in matches {
            let Some(raw) = bus.kv().get(&match_key).await? else { continue };
            let other_fields: BTreeMap<String, etl_schema::JsonValue> = match serde_json::from_slice(&raw) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "join window entry corrupt, skipping");
                    continue;
                }
            };

            let merged = match side {
                Side::Left => self.mapper.join_rows(&self.left_topic, &fields, &self.right_topic, &other_fields),
                Side::Right => self.mapper.join_rows(&self.left_topic, &other_fields, &self.right_topic, &fields),
            };
            let merged_bytes = serde_json::to_vec(&merged)
                .map_err(|e| etl_core::EtlError::Fatal(format!("joined row did not serialize: {e}")))?;
            bus.publish(output_subject, Event::new("__join__", None, merged_bytes)).await?;
            self.metrics.record_out();
        }

        // Store this event for the other side's future probe.
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let store_key = format!("{}:{key_str}:{seq:020}", side.tag());
        let payload = serde_json::to_vec(&fields)
            .map_err(|e| etl_core::EtlError::Fatal(format!("join window entry did not serialize: {e}")))?;
        bus.kv().put(&store_key, payload, self.window_for(side)).await?;

        Ok(())
    }
}

impl Operator for JoinOperator {
    fn name(&self) -> &str {
        "join"
    }
}

#[async_trait]
impl Transform for JoinOperator {
    async fn run(&mut self, bus: Arc<dyn StreamBus>, cancel: CancellationToken) -> EtlResult<()> {
        let output_subject = naming::join_subject(&self.pipeline_id);
        let durable_name = naming::durable_consumer_name(&self.pipeline_id, "join");

        let left_subject = self.input_subjects.get(&self.left_topic).cloned().ok_or_else(|| {
            etl_core::EtlError::Configuration(format!("no input subject registered for join side '{}'", self.left_topic))
        })?;
        let right_subject = self.input_subjects.get(&self.right_topic).cloned().ok_or_else(|| {
            etl_core::EtlError::Configuration(format!("no input subject registered for join side '{}'", self.right_topic))
        })?;

        let mut left_sub = bus.subscribe(&left_subject, &format!("{durable_name}.left")).await?;
        let mut right_sub = bus.subscribe(&right_subject, &format!("{durable_name}.right")).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivery = left_sub.next() => {
                    let Some(delivery) = delivery? else { continue };
                    self.metrics.record_in();
                    self.handle_event(&bus, &output_subject, Side::Left, delivery.event).await?;
                    delivery.ack.ack().await?;
                }
                delivery = right_sub.next() => {
                    let Some(delivery) = delivery? else { continue };
                    self.metrics.record_in();
                    self.handle_event(&bus, &output_subject, Side::Right, delivery.event).await?;
                    delivery.ack.ack().await?;
                }
            }
        }
    }
}
