//! Pipeline runner: loads a pipeline definition document and drives it
//! through `etl-manager` until Ctrl-C, then drains and exits.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use etl_bus::{JetStreamBus, MemoryBus};
use etl_core::{PipelineDefinition, StreamBus};
use etl_manager::PipelineManager;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Runs a streaming ETL pipeline from a JSON pipeline definition (spec.md §6).
#[derive(Parser, Debug)]
#[command(name = "etl-cli")]
#[command(about = "Streaming ETL pipeline runner")]
struct Args {
    /// Path to the pipeline definition JSON file.
    #[arg(short, long)]
    pipeline: PathBuf,

    /// NATS JetStream URL to run against instead of the in-process bus.
    /// Omit for a single-process quick start backed by `MemoryBus`.
    #[arg(long)]
    nats_url: Option<String>,

    /// JetStream KV bucket name for dedup/join window state, when `--nats-url` is set.
    #[arg(long, default_value = "etl-windows")]
    kv_bucket: String,

    /// How long to wait for operators to drain on shutdown before aborting them.
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.pipeline)
        .with_context(|| format!("reading pipeline definition at {}", args.pipeline.display()))?;
    let def: PipelineDefinition =
        serde_json::from_str(&raw).context("parsing pipeline definition JSON")?;

    let bus: Arc<dyn StreamBus> = match &args.nats_url {
        Some(url) => Arc::new(
            JetStreamBus::connect(url, &args.kv_bucket)
                .await
                .context("connecting to NATS JetStream")?,
        ),
        None => MemoryBus::new(),
    };

    let mut manager = PipelineManager::create(def, bus).context("validating pipeline definition")?;
    manager.start().await.context("starting pipeline")?;
    tracing::info!(pipeline_id = %manager.pipeline_id(), "pipeline running, awaiting Ctrl-C");

    tokio::signal::ctrl_c().await.context("waiting on ctrl-c")?;
    tracing::info!("received Ctrl-C, draining pipeline");

    manager.stop(Duration::from_secs(args.shutdown_timeout_secs)).await?;
    tracing::info!("pipeline stopped");

    Ok(())
}
