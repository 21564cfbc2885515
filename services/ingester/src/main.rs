//! Wildfire data ingester service.
//!
//! Pulls perimeters, incidents, damage inspections and live alerts from the
//! configured sources, validates and enriches them, and writes curated and
//! quarantined records as JSON lines.

mod config_loader;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config_loader::{apply_overrides, load_rules, load_service_config, resolve_credentials, SinkKind};
use ingestion::{
    ConnectorContext, IngestionPipeline, JsonLinesSink, MemorySink, PrometheusEmitter, RecordSink, SourceStatus,
};

#[derive(Parser, Debug)]
#[command(name = "ingester")]
#[command(about = "Wildfire data ingestion and quality pipeline")]
struct Args {
    /// Pipeline configuration file
    #[arg(short, long, env = "PIPELINE_CONFIG", default_value = "config/pipeline.yaml")]
    config: PathBuf,

    /// Run a single pass per source and exit (streams still run until closed)
    #[arg(long)]
    once: bool,

    /// Run only this source (default: all configured)
    #[arg(short, long)]
    source: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output directory for the JSON lines sink (overrides the config file)
    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting wildfire data ingester");

    // Load configuration
    let config = load_service_config(&args.config)?;
    let mut config = apply_overrides(config, args.once, args.source.as_deref())?;
    if let Some(dir) = &args.output_dir {
        config.sink.output_dir = dir.clone();
    }
    info!(
        sources = ?config.sources.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "Loaded configuration"
    );

    if let Some(port) = args.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port, "Prometheus metrics exporter listening");
    }

    let rules = load_rules(config.rulesets_dir.as_deref())?;
    let reference = config
        .settings
        .enrichment
        .load_reference()
        .context("Failed to load reference polygons")?;
    if let Some(index) = &reference {
        info!(polygons = index.len(), "Loaded reference polygons");
    }

    let memory_sink = Arc::new(MemorySink::new());
    let sink: Arc<dyn RecordSink> = match config.sink.kind {
        SinkKind::JsonLines => {
            let sink = JsonLinesSink::new(&config.sink.output_dir)
                .await
                .with_context(|| format!("Failed to open sink at {:?}", config.sink.output_dir))?;
            Arc::new(sink)
        }
        SinkKind::Memory => memory_sink.clone(),
    };

    let ctx = ConnectorContext {
        retry: config.settings.retry.clone(),
        credentials: resolve_credentials(&config.sources),
    };

    // Ctrl-C cancels the run; workers quarantine what they have not flushed
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let pipeline = IngestionPipeline::new(config.settings, rules, reference, sink, Arc::new(PrometheusEmitter));
    let summary = pipeline.run(config.sources, &ctx, cancel).await;

    if config.sink.kind == SinkKind::Memory {
        info!(
            written = memory_sink.records().await.len(),
            quarantined = memory_sink.quarantined().await.len(),
            "Dry run finished"
        );
    }
    for source in summary.sources.iter().filter(|s| s.status != SourceStatus::Completed) {
        warn!(source = %source.name, status = ?source.status, detail = ?source.detail, "Source did not complete");
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
