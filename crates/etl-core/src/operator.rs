use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::StreamBus;
use crate::error::EtlResult;

/// Common identity every pipeline operator exposes, for logging and the
/// manager's lifecycle bookkeeping.
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;
}

/// An operator that reads from external systems and publishes onto the
/// bus. Unlike the channel-wired sources this pattern descends from, a
/// `Source` never holds a sender to a specific downstream operator — it
/// only knows the bus and the subject it publishes to.
#[async_trait]
pub trait Source: Operator {
    async fn run(&mut self, bus: Arc<dyn StreamBus>, cancel: CancellationToken) -> EtlResult<()>;
}

/// An operator that durably-consumes one subject and durably-publishes to
/// another, transforming events in between (dedup, join). Runs until
/// `cancel` fires or an unrecoverable error occurs.
#[async_trait]
pub trait Transform: Operator {
    async fn run(&mut self, bus: Arc<dyn StreamBus>, cancel: CancellationToken) -> EtlResult<()>;
}

/// An operator that consumes a subject and writes to an external system.
#[async_trait]
pub trait Sink: Operator {
    async fn run(&mut self, bus: Arc<dyn StreamBus>, cancel: CancellationToken) -> EtlResult<()>;

    /// Flushes any buffered state and acknowledges the deliveries it
    /// covers. Called on graceful shutdown before the operator exits, and
    /// internally whenever the batch policy (size or time) trips.
    async fn flush(&mut self) -> EtlResult<()>;
}
