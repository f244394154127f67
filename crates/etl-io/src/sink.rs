use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use etl_core::{
    naming, AckHandle, EtlError, EtlResult, Operator, OperatorMetrics, Sink, SinkState, StreamBus,
};
use etl_schema::{ColumnValue, SchemaMapper};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type Batch = Vec<(Vec<ColumnValue>, Box<dyn AckHandle>)>;

/// Buffers rows from its input subject and periodically bulk-inserts them
/// into ClickHouse (spec.md §4.6).
///
/// A batch flushes when it reaches `batch_max_rows` or `batch_max_millis`
/// elapses since the last flush, whichever comes first. Every delivery's
/// ack is held until the batch it belongs to has actually committed, so a
/// crash mid-batch redelivers rather than silently drops (at-least-once);
/// a committed insert that then fails to ack is merely a duplicate insert
/// on redelivery, not a lost one.
///
/// Flushed batches are handed to a single background worker over a bounded
/// channel and processed strictly one at a time, so an earlier batch's
/// commit and ack always complete before a later batch's does (spec.md
/// §5). `max_in_flight_batches` bounds the channel's capacity: that many
/// batches can be buffered ahead of the worker before the consuming loop
/// backpressures on `trigger_flush`, but the worker itself never commits
/// two batches concurrently — only pipeline depth is concurrent, not
/// commit order.
pub struct ClickHouseSink {
    name: String,
    input_subject: String,
    durable_name: String,
    mapper: Arc<SchemaMapper>,
    table: String,
    batch_max_rows: usize,
    batch_max_millis: u64,
    pending: Batch,
    flush_tx: Option<mpsc::Sender<Batch>>,
    flush_worker: Option<JoinHandle<()>>,
    pub metrics: Arc<OperatorMetrics>,
    pub state: Arc<Mutex<SinkState>>,
}

impl ClickHouseSink {
    pub fn new(
        pipeline_id: impl Into<String>,
        input_subject: impl Into<String>,
        mapper: Arc<SchemaMapper>,
        dsn: &str,
        table: impl Into<String>,
        batch_max_rows: usize,
        batch_max_millis: u64,
        max_in_flight_batches: usize,
    ) -> Self {
        let pipeline_id = pipeline_id.into();
        let table = table.into();
        let column_names = mapper.column_names();
        let client = clickhouse::Client::default().with_url(dsn);
        let metrics = Arc::new(OperatorMetrics::default());

        let (flush_tx, flush_rx) = mpsc::channel::<Batch>(max_in_flight_batches.max(1));
        let worker_table = table.clone();
        let worker_metrics = metrics.clone();
        let flush_worker = tokio::spawn(run_flush_worker(flush_rx, client, worker_table, column_names, worker_metrics, 3));

        Self {
            name: format!("sink.{table}"),
            input_subject: input_subject.into(),
            durable_name: naming::durable_consumer_name(&pipeline_id, "sink"),
            mapper,
            table,
            batch_max_rows: batch_max_rows.max(1),
            batch_max_millis: batch_max_millis.max(1),
            pending: Vec::new(),
            flush_tx: Some(flush_tx),
            flush_worker: Some(flush_worker),
            metrics,
            state: Arc::new(Mutex::new(SinkState::Initialising)),
        }
    }

    fn set_state(&self, state: SinkState) {
        *self.state.lock().expect("sink state mutex poisoned") = state;
    }

    fn prepare(&self, payload: &[u8]) -> Result<Vec<ColumnValue>, String> {
        let fields = etl_schema::parse_event(payload)?;
        self.mapper.prepare_row(&fields).map_err(|e| e.to_string())
    }

    /// Hands the current buffer to the flush worker and waits for channel
    /// capacity if `max_in_flight_batches` batches are already queued ahead
    /// of it; does not wait for the batch to actually commit.
    async fn trigger_flush(&mut self) -> EtlResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let Some(tx) = self.flush_tx.as_ref() else {
            return Err(EtlError::Fatal("sink flush worker already shut down".into()));
        };
        tx.send(batch)
            .await
            .map_err(|_| EtlError::Fatal(format!("sink flush worker for '{}' terminated unexpectedly", self.table)))
    }
}

impl Operator for ClickHouseSink {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn run(&mut self, bus: Arc<dyn StreamBus>, cancel: CancellationToken) -> EtlResult<()> {
        self.set_state(SinkState::Initialising);
        let mut sub = bus.subscribe(&self.input_subject, &self.durable_name).await?;
        self.set_state(SinkState::Running);
        info!(table = %self.table, "sink subscribed");

        let mut deadline = Instant::now() + Duration::from_millis(self.batch_max_millis);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(SinkState::Draining);
                    info!(table = %self.table, "sink draining, flushing remaining rows");
                    self.flush().await?;
                    self.set_state(SinkState::Stopped);
                    return Ok(());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    deadline = Instant::now() + Duration::from_millis(self.batch_max_millis);
                    self.trigger_flush().await?;
                }
                delivery = sub.next() => {
                    let Some(delivery) = delivery? else { continue };
                    self.metrics.record_in();
                    match self.prepare(&delivery.event.payload) {
                        Ok(row) => {
                            self.pending.push((row, delivery.ack));
                            self.metrics.record_out();
                            if self.pending.len() >= self.batch_max_rows {
                                self.trigger_flush().await?;
                                deadline = Instant::now() + Duration::from_millis(self.batch_max_millis);
                            }
                        }
                        Err(reason) => {
                            warn!(table = %self.table, error = %reason, "dropping event failing row preparation");
                            self.metrics.record_dropped("schema");
                            delivery.ack.ack().await?;
                        }
                    }
                }
            }
        }
    }

    /// Drains the current buffer and waits for the worker to fully commit
    /// (and ack or nak) every batch it has queued, closing the flush
    /// channel so the worker task exits once the queue is empty.
    async fn flush(&mut self) -> EtlResult<()> {
        self.set_state(SinkState::Flushing);
        self.trigger_flush().await?;
        self.flush_tx.take();
        if let Some(handle) = self.flush_worker.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "flush worker panicked while draining");
            }
        }
        Ok(())
    }
}

/// Processes batches strictly in the order they were queued: the next
/// batch is not even dequeued until the previous one has committed and
/// its deliveries acked or nakked, so spec.md §5's "earlier batches
/// commit before later batches are acknowledged" guarantee holds
/// regardless of how many batches `max_in_flight_batches` lets queue up
/// ahead of this worker.
async fn run_flush_worker(
    mut rx: mpsc::Receiver<Batch>,
    client: clickhouse::Client,
    table: String,
    columns: Vec<String>,
    metrics: Arc<OperatorMetrics>,
    max_retries: u32,
) {
    while let Some(batch) = rx.recv().await {
        if let Err(e) = flush_batch(&client, &table, &columns, batch, &metrics, max_retries).await {
            warn!(table = %table, error = %e, "batch flush ultimately failed");
        }
    }
}

async fn flush_batch(
    client: &clickhouse::Client,
    table: &str,
    columns: &[String],
    batch: Vec<(Vec<ColumnValue>, Box<dyn AckHandle>)>,
    metrics: &OperatorMetrics,
    max_retries: u32,
) -> EtlResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let sql = build_insert_sql(table, columns, batch.iter().map(|(row, _)| row));

    let mut attempt = 0u32;
    let mut delay = Duration::from_millis(200);
    loop {
        match client.query(&sql).execute().await {
            Ok(()) => {
                metrics.record_batch_flushed();
                for (_, ack) in batch {
                    if let Err(e) = ack.ack().await {
                        warn!(table = %table, error = %e, "failed to ack delivery after committed insert");
                    }
                }
                return Ok(());
            }
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(table = %table, attempt, error = %e, "insert failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
            Err(e) => {
                metrics.record_insert_failed();
                for (_, ack) in batch {
                    if let Err(nak_err) = ack.nak().await {
                        warn!(table = %table, error = %nak_err, "failed to nak delivery after failed insert");
                    }
                }
                return Err(EtlError::Fatal(format!(
                    "insert into '{table}' failed after {attempt} retries: {e}"
                )));
            }
        }
    }
}

fn build_insert_sql<'a>(
    table: &str,
    columns: &[String],
    rows: impl Iterator<Item = &'a Vec<ColumnValue>>,
) -> String {
    let cols = columns.join(", ");
    let mut sql = format!("INSERT INTO {table} ({cols}) VALUES ");
    let mut first = true;
    for row in rows {
        if !first {
            sql.push_str(", ");
        }
        first = false;
        sql.push('(');
        let values: Vec<String> = row.iter().map(|v| v.to_sql_literal()).collect();
        sql.push_str(&values.join(", "));
        sql.push(')');
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_renders_one_tuple_per_row() {
        let columns = vec!["order_id".to_string(), "order_amount".to_string()];
        let rows = vec![
            vec![ColumnValue::String("ord-1".into()), ColumnValue::Int64(42)],
            vec![ColumnValue::String("ord-2".into()), ColumnValue::Null],
        ];
        let sql = build_insert_sql("orders_flat", &columns, rows.iter());
        assert_eq!(
            sql,
            "INSERT INTO orders_flat (order_id, order_amount) VALUES ('ord-1', 42), ('ord-2', NULL)"
        );
    }

    #[test]
    fn insert_sql_is_empty_values_clause_for_no_rows() {
        let columns = vec!["order_id".to_string()];
        let rows: Vec<Vec<ColumnValue>> = Vec::new();
        let sql = build_insert_sql("orders_flat", &columns, rows.iter());
        assert_eq!(sql, "INSERT INTO orders_flat (order_id) VALUES ");
    }
}
