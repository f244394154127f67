use std::collections::BTreeMap;

use etl_core::OperatorMetricsSnapshot;
use serde::Serialize;

/// The pipeline's aggregate lifecycle state, coarser than any one
/// operator's state machine (spec.md §6 `status(pipeline_id)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorStatus {
    pub state: String,
    pub metrics: OperatorMetricsSnapshot,
    /// The most recent `Fatal`/`Transient` error this operator's task
    /// exited or stumbled on, if any (spec.md §7 "user visibility").
    pub last_error: Option<String>,
}

/// `{state, per_operator_state, lag_per_topic}` from spec.md §6. `lag`
/// here is the count of events a topic's ingestor has read but whose
/// downstream effects have not yet been acknowledged by the sink — an
/// approximation of Kafka consumer lag derived from operator counters
/// rather than from the broker, since the core has no broker-side handle.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub pipeline_id: String,
    pub state: PipelineState,
    pub operators: BTreeMap<String, OperatorStatus>,
    pub lag_per_topic: BTreeMap<String, u64>,
}
