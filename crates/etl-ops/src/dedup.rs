use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etl_core::{naming, EtlResult, Operator, OperatorMetrics, StreamBus, Transform};
use etl_schema::SchemaMapper;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::key::encode_key;

/// Sliding-window suppression on a topic's declared join key.
///
/// An event is forwarded the first time its key is seen within `window`
/// and suppressed on every repeat until the window lapses. The KV write
/// and the forward are never reordered: an event is only published
/// downstream once `put_if_absent` has durably recorded the key, so a
/// crash between the two can at worst suppress a duplicate's retry rather
/// than let a duplicate slip through (spec.md §4.2).
pub struct DedupOperator {
    pipeline_id: String,
    topic: String,
    window: Duration,
    mapper: Arc<SchemaMapper>,
    pub metrics: Arc<OperatorMetrics>,
}

impl DedupOperator {
    pub fn new(pipeline_id: impl Into<String>, topic: impl Into<String>, window: Duration, mapper: Arc<SchemaMapper>) -> Self {
        Self { pipeline_id: pipeline_id.into(), topic: topic.into(), window, mapper, metrics: Arc::new(OperatorMetrics::default()) }
    }
}

impl Operator for DedupOperator {
    fn name(&self) -> &str {
        "dedup"
    }
}

#[async_trait]
impl Transform for DedupOperator {
    async fn run(&mut self, bus: Arc<dyn StreamBus>, cancel: CancellationToken) -> EtlResult<()> {
        let input_subject = naming::ingestor_subject(&self.pipeline_id, &self.topic);
        let output_subject = naming::dedup_subject(&self.pipeline_id);
        let durable_name = naming::durable_consumer_name(&self.pipeline_id, "dedup");
        let mut sub = bus.subscribe(&input_subject, &durable_name).await?;

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                delivery = sub.next() => delivery?,
            };
            let Some(delivery) = delivery else { continue };
            self.metrics.record_in();

            let fields = match etl_schema::parse_event(&delivery.event.payload) {
                Ok(f) => f,
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "dropping unparseable event");
                    self.metrics.record_dropped("parse");
                    delivery.ack.ack().await?;
                    continue;
                }
            };

            let key = match self.mapper.get_join_key(&self.topic, &fields) {
                Ok(k) => k,
                Err(e) => {
                    debug!(topic = %self.topic, error = %e, "event has no usable dedup key, forwarding unsuppressed");
                    bus.publish(&output_subject, delivery.event.clone()).await?;
                    self.metrics.record_out();
                    delivery.ack.ack().await?;
                    continue;
                }
            };

            let kv_key = format!("{}:{}", self.topic, encode_key(&key));
            let is_first = bus.kv().put_if_absent(&kv_key, Vec::new(), self.window).await?;

            if is_first {
                bus.publish(&output_subject, delivery.event.clone()).await?;
                self.metrics.record_out();
            } else {
                self.metrics.record_dropped("duplicate");
                debug!(topic = %self.topic, key = %kv_key, "suppressing duplicate within window");
            }
            delivery.ack.ack().await?;
        }
    }
}
