use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Lifecycle states an ingestor moves through (spec.md §4.3). Tracked by the
/// manager so `status()` can report whether a pipeline is actually consuming
/// yet, not just "spawned". `BackingOff` is entered on a retryable publish
/// failure and left once the retry succeeds or the retry budget is spent
/// (at which point the operator moves to `Failed` instead of `Running`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum IngestorState {
    Initialising,
    Running,
    BackingOff,
    Draining,
    Stopped,
    Failed,
}

/// Lifecycle states a sink moves through (spec.md §4.6), separate from
/// `IngestorState` because a sink keeps running (draining its buffer) after
/// every upstream ingestor has already stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SinkState {
    Initialising,
    Running,
    Flushing,
    Draining,
    Stopped,
    Failed,
}

/// Monotonic counters an operator updates as it runs. Cheap enough to bump
/// on every event; read by `PipelineManager::status` without locking the
/// hot counters (only the drop-reason breakdown and the sink's batch
/// counters take the mutex, and only on the comparatively rare events that
/// bump them).
#[derive(Debug, Default)]
pub struct OperatorMetrics {
    pub events_in: AtomicU64,
    pub events_out: AtomicU64,
    pub events_dropped: AtomicU64,
    pub errors: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub inserts_failed: AtomicU64,
    dropped_by_reason: Mutex<BTreeMap<String, u64>>,
}

impl OperatorMetrics {
    pub fn record_in(&self) {
        self.events_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.events_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps both the aggregate drop counter and the per-reason breakdown
    /// `status()` surfaces as `events_dropped_by_reason` (spec.md §7).
    pub fn record_dropped(&self, reason: &str) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        let mut reasons = self.dropped_by_reason.lock().expect("metrics mutex poisoned");
        *reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_failed(&self) {
        self.inserts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OperatorMetricsSnapshot {
        OperatorMetricsSnapshot {
            events_in: self.events_in.load(Ordering::Relaxed),
            events_out: self.events_out.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            inserts_failed: self.inserts_failed.load(Ordering::Relaxed),
            dropped_by_reason: self.dropped_by_reason.lock().expect("metrics mutex poisoned").clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct OperatorMetricsSnapshot {
    pub events_in: u64,
    pub events_out: u64,
    pub events_dropped: u64,
    pub errors: u64,
    pub batches_flushed: u64,
    pub inserts_failed: u64,
    pub dropped_by_reason: BTreeMap<String, u64>,
}
