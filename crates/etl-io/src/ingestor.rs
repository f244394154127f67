use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use etl_core::{naming, Event, EtlError, EtlResult, IngestorState, Operator, OperatorMetrics, Source, StreamBus};
use etl_schema::TopicSchema;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a topic's consumer group starts reading from on its very first run
/// (spec.md §4.3, §6 `consumer_group_initial_offset`). Irrelevant on every
/// subsequent run, since the group's committed offsets take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Earliest,
    Latest,
}

impl InitialOffset {
    fn as_kafka_str(self) -> &'static str {
        match self {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        }
    }
}

/// One Kafka-compatible consumer per input topic (spec.md §4.3). Validates
/// every event against its declared schema (presence only, no coercion —
/// coercion is the sink's job via `prepare_row`) and republishes survivors
/// on the topic's bus subject; the consumer group commits its own offset
/// immediately after, so the next restart resumes past both published and
/// schema-rejected messages alike.
pub struct KafkaIngestor {
    name: String,
    pipeline_id: String,
    topic: String,
    brokers: String,
    initial_offset: InitialOffset,
    schema: TopicSchema,
    max_publish_retries: u32,
    pub metrics: Arc<OperatorMetrics>,
    pub state: Arc<Mutex<IngestorState>>,
}

impl KafkaIngestor {
    pub fn new(
        pipeline_id: impl Into<String>,
        topic: impl Into<String>,
        brokers: impl Into<String>,
        initial_offset: InitialOffset,
        schema: TopicSchema,
    ) -> Self {
        let topic = topic.into();
        Self {
            name: format!("ingest.{topic}"),
            pipeline_id: pipeline_id.into(),
            topic,
            brokers: brokers.into(),
            initial_offset,
            schema,
            max_publish_retries: 5,
            metrics: Arc::new(OperatorMetrics::default()),
            state: Arc::new(Mutex::new(IngestorState::Initialising)),
        }
    }

    fn consumer_group(&self) -> String {
        format!("{}.{}", self.pipeline_id, self.topic)
    }

    fn set_state(&self, state: IngestorState) {
        *self.state.lock().expect("ingestor state mutex poisoned") = state;
    }

    /// Publishes with bounded exponential backoff (spec.md §4.3, §7
    /// "Transient I/O ... retried with bounded exponential backoff, then
    /// escalated to Fatal"). `BackingOff` is visible to `status()` for the
    /// duration of the retry loop.
    async fn publish_with_backoff(&self, bus: &Arc<dyn StreamBus>, subject: &str, event: Event) -> EtlResult<()> {
        let mut attempt = 0u32;
        let mut delay = Duration::from_millis(100);
        loop {
            match bus.publish(subject, event.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.set_state(IngestorState::Running);
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_publish_retries => {
                    attempt += 1;
                    self.set_state(IngestorState::BackingOff);
                    warn!(topic = %self.topic, attempt, error = %e, "publish failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
                Err(e) => {
                    self.metrics.record_error();
                    self.set_state(IngestorState::Failed);
                    return Err(EtlError::Fatal(format!(
                        "publish to '{subject}' failed after {attempt} retries: {e}"
                    )));
                }
            }
        }
    }
}

impl Operator for KafkaIngestor {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Source for KafkaIngestor {
    async fn run(&mut self, bus: Arc<dyn StreamBus>, cancel: CancellationToken) -> EtlResult<()> {
        self.set_state(IngestorState::Initialising);
        let output_subject = naming::ingestor_subject(&self.pipeline_id, &self.topic);
        let group_id = self.consumer_group();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", self.initial_offset.as_kafka_str())
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set_log_level(RDKafkaLogLevel::Warning)
            .create()
            .map_err(|e| EtlError::Fatal(format!("failed to create kafka consumer for topic '{}': {e}", self.topic)))?;

        consumer.subscribe(&[self.topic.as_str()]).map_err(|e| {
            EtlError::Configuration(format!("failed to subscribe to topic '{}': {e}", self.topic))
        })?;

        info!(topic = %self.topic, group = %group_id, "ingestor subscribed");
        self.set_state(IngestorState::Running);

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(IngestorState::Draining);
                    info!(topic = %self.topic, "ingestor draining on shutdown signal");
                    self.set_state(IngestorState::Stopped);
                    return Ok(());
                }
                message = consumer.recv() => message,
            };

            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "kafka poll error");
                    continue;
                }
            };

            self.metrics.record_in();
            let Some(payload) = message.payload().map(|p| p.to_vec()) else {
                self.metrics.record_dropped("empty_payload");
                let _ = consumer.commit_message(&message, CommitMode::Async);
                continue;
            };

            let validation = etl_schema::parse_event(&payload)
                .map_err(|e| e.to_string())
                .and_then(|fields| self.schema.validate_presence(&fields).map_err(|e| e.to_string()));

            match validation {
                Ok(()) => {
                    let key = message.key().map(|k| k.to_vec());
                    let event = Event::new(self.topic.clone(), key, payload);
                    self.publish_with_backoff(&bus, &output_subject, event).await?;
                    self.metrics.record_out();
                }
                Err(reason) => {
                    debug!(topic = %self.topic, error = %reason, "dropping event failing schema validation");
                    self.metrics.record_dropped("parse");
                }
            }

            // Offset advances after publication of survivors regardless of
            // whether this particular message was one (spec.md §4.3): a
            // rejected message was still fully consumed, just not forwarded.
            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                warn!(topic = %self.topic, error = %e, "failed to commit kafka offset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_schema::TopicSchema;

    fn ingestor() -> KafkaIngestor {
        KafkaIngestor::new("p1", "orders", "localhost:9092", InitialOffset::Earliest, TopicSchema::default())
    }

    #[test]
    fn name_is_namespaced_by_topic() {
        assert_eq!(ingestor().name(), "ingest.orders");
    }

    #[test]
    fn consumer_group_is_namespaced_by_pipeline_and_topic() {
        assert_eq!(ingestor().consumer_group(), "p1.orders");
    }

    #[test]
    fn initial_offset_maps_to_kafka_reset_policy() {
        assert_eq!(InitialOffset::Earliest.as_kafka_str(), "earliest");
        assert_eq!(InitialOffset::Latest.as_kafka_str(), "latest");
    }
}
