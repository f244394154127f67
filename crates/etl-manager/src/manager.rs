use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etl_core::{
    naming, EtlError, EtlResult, InitialOffsetDef, IngestorState, OperatorMetrics, PipelineDefinition, Sink,
    SinkState, Source, StreamBus, Transform,
};
use etl_io::{ClickHouseSink, InitialOffset, KafkaIngestor};
use etl_ops::{DedupOperator, JoinOperator};
use etl_schema::SchemaMapper;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::status::{OperatorStatus, PipelineState, PipelineStatus};

struct IngestorHandle {
    topic: String,
    join_handle: JoinHandle<EtlResult<()>>,
    metrics: Arc<OperatorMetrics>,
    state: Arc<Mutex<IngestorState>>,
    last_error: Arc<Mutex<Option<String>>>,
}

struct StageHandle {
    name: String,
    join_handle: JoinHandle<EtlResult<()>>,
    metrics: Arc<OperatorMetrics>,
    last_error: Arc<Mutex<Option<String>>>,
}

struct SinkHandle {
    join_handle: JoinHandle<EtlResult<()>>,
    metrics: Arc<OperatorMetrics>,
    state: Arc<Mutex<SinkState>>,
    last_error: Arc<Mutex<Option<String>>>,
}

/// Parses and validates a pipeline definition, instantiates its operator
/// set in dependency order, and coordinates cooperative shutdown
/// (spec.md §4.7). Owns nothing but handles and cancellation tokens — the
/// operators themselves own their state exclusively once spawned.
pub struct PipelineManager {
    def: PipelineDefinition,
    bus: Arc<dyn StreamBus>,
    mapper: Arc<SchemaMapper>,

    ingest_cancel: CancellationToken,
    dedup_cancel: CancellationToken,
    join_cancel: CancellationToken,
    sink_cancel: CancellationToken,

    ingestors: Vec<IngestorHandle>,
    dedup: Option<StageHandle>,
    join: Option<StageHandle>,
    sink: Option<SinkHandle>,

    state: Arc<Mutex<PipelineState>>,
}

impl PipelineManager {
    /// `create(pipeline_definition) → pipeline_id | error` (spec.md §6).
    /// Validation happens here, not at runtime: a malformed definition
    /// never reaches `start`.
    pub fn create(def: PipelineDefinition, bus: Arc<dyn StreamBus>) -> EtlResult<Self> {
        def.validate()?;
        if def.topics.len() > 1 && def.join.is_none() {
            return Err(EtlError::Configuration(
                "a pipeline with more than one topic requires a join to reach a single sink subject".into(),
            ));
        }

        let topic_schemas = def.topic_schemas();
        let mapping = def.mapping()?;
        let mapper = Arc::new(SchemaMapper::new(topic_schemas, mapping));

        Ok(Self {
            def,
            bus,
            mapper,
            ingest_cancel: CancellationToken::new(),
            dedup_cancel: CancellationToken::new(),
            join_cancel: CancellationToken::new(),
            sink_cancel: CancellationToken::new(),
            ingestors: Vec::new(),
            dedup: None,
            join: None,
            sink: None,
            state: Arc::new(Mutex::new(PipelineState::Starting)),
        })
    }

    pub fn pipeline_id(&self) -> &str {
        &self.def.pipeline_id
    }

    /// The subject whatever is the *last* configured stage publishes to —
    /// what the sink (or, for a single topic with neither dedup nor join,
    /// the one ingestor) ultimately reads from.
    fn terminal_subject(&self) -> String {
        if self.def.join.is_some() {
            naming::join_subject(&self.def.pipeline_id)
        } else if self.def.dedup.is_some() {
            naming::dedup_subject(&self.def.pipeline_id)
        } else {
            naming::ingestor_subject(&self.def.pipeline_id, &self.def.topics[0].name)
        }
    }

    /// The subject a join side reads from: a topic's dedup output if that
    /// topic is being deduped, otherwise its raw ingestor output.
    fn input_subject_for_topic(&self, topic: &str) -> String {
        let is_deduped = self.def.dedup.as_ref().is_some_and(|d| d.topic == topic);
        if is_deduped {
            naming::dedup_subject(&self.def.pipeline_id)
        } else {
            naming::ingestor_subject(&self.def.pipeline_id, topic)
        }
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().expect("pipeline state mutex poisoned") = state;
    }

    /// Starts operators in dependency order: sink → join → dedup →
    /// ingestors, so nothing publishes to a subject with no subscriber
    /// yet (spec.md §4.7).
    pub async fn start(&mut self) -> EtlResult<()> {
        self.start_sink().await?;
        self.start_join().await?;
        self.start_dedup().await?;
        self.start_ingestors().await?;
        self.set_state(PipelineState::Running);
        info!(pipeline_id = %self.def.pipeline_id, "pipeline started");
        Ok(())
    }

    async fn start_sink(&mut self) -> EtlResult<()> {
        let input_subject = self.terminal_subject();
        let mut sink = ClickHouseSink::new(
            self.def.pipeline_id.clone(),
            input_subject,
            self.mapper.clone(),
            &self.def.sink.dsn,
            self.def.sink.table.clone(),
            self.def.sink.batch_max_rows,
            self.def.sink.batch_max_millis,
            self.def.sink.max_in_flight_batches,
        );
        let metrics = sink.metrics.clone();
        let state = sink.state.clone();
        let bus = self.bus.clone();
        let cancel = self.sink_cancel.clone();
        let pipeline_state = self.state.clone();
        let last_error = Arc::new(Mutex::new(None));
        let join_handle = spawn_watched("sink", pipeline_state, last_error.clone(), async move { sink.run(bus, cancel).await });
        self.sink = Some(SinkHandle { join_handle, metrics, state, last_error });
        Ok(())
    }

    async fn start_join(&mut self) -> EtlResult<()> {
        let Some(join_def) = self.def.join.clone() else { return Ok(()) };
        let left = &join_def.sources[0];
        let right = &join_def.sources[1];

        let mut input_subjects = BTreeMap::new();
        input_subjects.insert(left.source_id.clone(), self.input_subject_for_topic(&left.source_id));
        input_subjects.insert(right.source_id.clone(), self.input_subject_for_topic(&right.source_id));

        let mut join_op = JoinOperator::new(
            self.def.pipeline_id.clone(),
            left.source_id.clone(),
            right.source_id.clone(),
            input_subjects,
            left.window()?,
            right.window()?,
            self.mapper.clone(),
        );
        let metrics = join_op.metrics.clone();
        let bus = self.bus.clone();
        let cancel = self.join_cancel.clone();
        let pipeline_state = self.state.clone();
        let last_error = Arc::new(Mutex::new(None));
        let join_handle = spawn_watched("join", pipeline_state, last_error.clone(), async move { join_op.run(bus, cancel).await });
        self.join = Some(StageHandle { name: "join".to_string(), join_handle, metrics, last_error });
        Ok(())
    }

    async fn start_dedup(&mut self) -> EtlResult<()> {
        let Some(dedup_def) = self.def.dedup.clone() else { return Ok(()) };
        let mut dedup_op = DedupOperator::new(
            self.def.pipeline_id.clone(),
            dedup_def.topic.clone(),
            dedup_def.window()?,
            self.mapper.clone(),
        );
        let metrics = dedup_op.metrics.clone();
        let bus = self.bus.clone();
        let cancel = self.dedup_cancel.clone();
        let pipeline_state = self.state.clone();
        let last_error = Arc::new(Mutex::new(None));
        let join_handle = spawn_watched("dedup", pipeline_state, last_error.clone(), async move { dedup_op.run(bus, cancel).await });
        self.dedup = Some(StageHandle { name: "dedup".to_string(), join_handle, metrics, last_error });
        Ok(())
    }

    async fn start_ingestors(&mut self) -> EtlResult<()> {
        for topic in self.def.topics.clone() {
            let schema = self.mapper.topic_schema(&topic.name).cloned().ok_or_else(|| {
                EtlError::Configuration(format!("no schema resolved for topic '{}'", topic.name))
            })?;
            let initial_offset = match topic.consumer_group_initial_offset {
                InitialOffsetDef::Earliest => InitialOffset::Earliest,
                InitialOffsetDef::Latest => InitialOffset::Latest,
            };
            let mut ingestor = KafkaIngestor::new(
                self.def.pipeline_id.clone(),
                topic.name.clone(),
                topic.brokers.clone(),
                initial_offset,
                schema,
            );
            let metrics = ingestor.metrics.clone();
            let state = ingestor.state.clone();
            let bus = self.bus.clone();
            let cancel = self.ingest_cancel.clone();
            let pipeline_state = self.state.clone();
            let label = format!("ingest.{}", topic.name);
            let last_error = Arc::new(Mutex::new(None));
            let join_handle =
                spawn_watched(label, pipeline_state, last_error.clone(), async move { ingestor.run(bus, cancel).await });
            self.ingestors.push(IngestorHandle { topic: topic.name, join_handle, metrics, state, last_error });
        }
        Ok(())
    }

    /// Cooperative, deadline-bounded shutdown (spec.md §4.7): ingestors
    /// stop first, then dedup/join drain, then the sink flushes its final
    /// batch, applying `deadline` independently at each step. A step that
    /// overruns its deadline has its remaining operators aborted —
    /// in-flight messages stay unacknowledged and are redelivered on the
    /// next start, rather than the shutdown call itself hanging forever.
    pub async fn stop(&mut self, deadline: Duration) -> EtlResult<()> {
        self.set_state(PipelineState::Draining);
        info!(pipeline_id = %self.def.pipeline_id, ?deadline, "stopping pipeline");

        self.ingest_cancel.cancel();
        let ingestor_handles = self.ingestors.drain(..).map(|h| h.join_handle).collect();
        join_with_deadline(ingestor_handles, deadline).await;

        self.dedup_cancel.cancel();
        self.join_cancel.cancel();
        let mut mid_handles = Vec::new();
        if let Some(h) = self.dedup.take() {
            mid_handles.push(h.join_handle);
        }
        if let Some(h) = self.join.take() {
            mid_handles.push(h.join_handle);
        }
        join_with_deadline(mid_handles, deadline).await;

        self.sink_cancel.cancel();
        if let Some(h) = self.sink.take() {
            join_with_deadline(vec![h.join_handle], deadline).await;
        }

        self.set_state(PipelineState::Stopped);
        info!(pipeline_id = %self.def.pipeline_id, "pipeline stopped");
        Ok(())
    }

    /// `status(pipeline_id) → {state, per_operator_state, lag_per_topic}`
    /// (spec.md §6). `lag_per_topic` approximates unacknowledged depth per
    /// topic as `events_in - (events_out + events_dropped)` on that
    /// topic's ingestor — everything read but not yet accounted for
    /// downstream.
    pub fn status(&self) -> PipelineStatus {
        let mut operators = BTreeMap::new();
        let mut lag_per_topic = BTreeMap::new();

        for ih in &self.ingestors {
            let state = *ih.state.lock().expect("ingestor state mutex poisoned");
            let snapshot = ih.metrics.snapshot();
            lag_per_topic.insert(
                ih.topic.clone(),
                snapshot.events_in.saturating_sub(snapshot.events_out + snapshot.events_dropped),
            );
            let last_error = ih.last_error.lock().expect("last-error mutex poisoned").clone();
            operators.insert(
                format!("ingest.{}", ih.topic),
                OperatorStatus { state: format!("{state:?}"), metrics: snapshot, last_error },
            );
        }
        if let Some(h) = &self.dedup {
            let last_error = h.last_error.lock().expect("last-error mutex poisoned").clone();
            operators.insert(
                h.name.to_string(),
                OperatorStatus { state: stage_state(&h.join_handle), metrics: h.metrics.snapshot(), last_error },
            );
        }
        if let Some(h) = &self.join {
            let last_error = h.last_error.lock().expect("last-error mutex poisoned").clone();
            operators.insert(
                h.name.to_string(),
                OperatorStatus { state: stage_state(&h.join_handle), metrics: h.metrics.snapshot(), last_error },
            );
        }
        if let Some(h) = &self.sink {
            let state = *h.state.lock().expect("sink state mutex poisoned");
            let last_error = h.last_error.lock().expect("last-error mutex poisoned").clone();
            operators.insert(
                "sink".to_string(),
                OperatorStatus { state: format!("{state:?}"), metrics: h.metrics.snapshot(), last_error },
            );
        }

        PipelineStatus {
            pipeline_id: self.def.pipeline_id.clone(),
            state: *self.state.lock().expect("pipeline state mutex poisoned"),
            operators,
            lag_per_topic,
        }
    }
}

fn stage_state(handle: &JoinHandle<EtlResult<()>>) -> String {
    if handle.is_finished() {
        "stopped".to_string()
    } else {
        "running".to_string()
    }
}

fn spawn_watched<F>(
    label: impl Into<String>,
    pipeline_state: Arc<Mutex<PipelineState>>,
    last_error: Arc<Mutex<Option<String>>>,
    fut: F,
) -> JoinHandle<EtlResult<()>>
where
    F: Future<Output = EtlResult<()>> + Send + 'static,
{
    let label = label.into();
    tokio::spawn(async move {
        let result = fut.await;
        if let Err(e) = &result {
            error!(operator = %label, error = %e, "operator exited with error");
            *last_error.lock().expect("last-error mutex poisoned") = Some(e.to_string());
            *pipeline_state.lock().expect("pipeline state mutex poisoned") = PipelineState::Failed;
        }
        result
    })
}

/// Awaits every handle against one shared deadline; whatever hasn't
/// finished when it elapses is aborted rather than left to run forever.
async fn join_with_deadline(handles: Vec<JoinHandle<EtlResult<()>>>, deadline: Duration) {
    if handles.is_empty() {
        return;
    }
    let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let joined = async {
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "operator exited with error during shutdown"),
                Err(e) => warn!(error = %e, "operator task panicked during shutdown"),
            }
        }
    };
    if tokio::time::timeout(deadline, joined).await.is_err() {
        warn!(?deadline, "shutdown deadline elapsed, aborting remaining operators");
        for ah in abort_handles {
            ah.abort();
        }
    }
}
