//! Prolepsis Simulation Driver
//!
//! Runs the speculative engine against a synthetic rollout whose progress
//! drifts towards 100%. Status frames are rendered ahead of time and
//! milestone posts are committed to an in-memory status board, then
//! confirmed or retracted as the real rollout catches up.
//!
//! ## Usage
//!
//! ```bash
//! # Default run (200 steps of 50 ms)
//! prolepsis-sim
//!
//! # Longer run with a setback every 25 steps and a JSONL audit trail
//! prolepsis-sim --steps 1000 --setback-every 25 --audit-log audit.jsonl
//!
//! # Expose Prometheus metrics while running
//! prolepsis-sim --metrics-port 9090
//! ```

mod domain;

use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use prolepsis_core::{NormalizedL1, QuantizationSpec};
use prolepsis_speculative::{
    AuditEvent, AuditSink, ChannelAuditSink, SpeculationConfig, SpeculativeEngine,
    TracingAuditSink,
};

use domain::{DriftingRollout, LinearPredictor, StatusBoard, StatusRenderer};

#[derive(Parser, Debug)]
#[command(name = "prolepsis-sim")]
#[command(author = "Daemoniorum LLC")]
#[command(version)]
#[command(about = "Prolepsis speculative precomputation simulator", long_about = None)]
struct Args {
    /// Number of real state transitions to simulate
    #[arg(long, default_value = "200")]
    steps: u64,

    /// Wall time between transitions in milliseconds
    #[arg(long, default_value = "50")]
    step_ms: u64,

    /// Mean progress gained per step
    #[arg(long, default_value = "1.5")]
    rate: f64,

    /// Fall back 15 points every N steps (0 disables)
    #[arg(long, default_value = "40")]
    setback_every: u64,

    /// Simulated render latency in milliseconds
    #[arg(long, default_value = "30")]
    render_ms: u64,

    /// Stage a status post every N points of progress
    #[arg(long, default_value = "10")]
    milestone_every: f64,

    /// Write audit events as JSON lines to this file
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Engine settings scaled to the simulated step length
fn default_config(step: Duration) -> SpeculationConfig {
    let mut config = SpeculationConfig::default()
        .with_capacity(128)
        .with_quantization(QuantizationSpec::default().with_field("progress", 1.0));
    config.commitment_deadline_ms = step.as_millis() as u64 * 40;
    config.scheduler.tick_interval_ms = step.as_millis() as u64;
    config.scheduler.build_timeout_ms = step.as_millis() as u64 * 10;
    config.verification.sweep_interval_ms = step.as_millis() as u64 * 2;
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
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
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(port) = args.metrics_port {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        info!("Starting Prometheus metrics server on {}", metrics_addr);
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
    }

    let step = Duration::from_millis(args.step_ms.max(1));
    let config = match &args.config {
        Some(path) => SpeculationConfig::load(path)?,
        None => default_config(step),
    };

    // Audit trail: JSON lines on a blocking writer, or structured logs
    let (audit, writer): (Arc<dyn AuditSink>, _) = match &args.audit_log {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let (sink, mut events) = ChannelAuditSink::new(1024);
            let writer = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
                let mut out = BufWriter::new(file);
                let mut written = 0;
                while let Some(event) = events.blocking_recv() {
                    write_event(&mut out, &event)?;
                    written += 1;
                }
                out.flush()?;
                Ok(written)
            });
            let sink: Arc<dyn AuditSink> = Arc::new(sink);
            (sink, Some(writer))
        }
        None => {
            let sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
            (sink, None)
        }
    };

    let renderer = Arc::new(StatusRenderer::new(
        Duration::from_millis(args.render_ms),
        args.milestone_every,
    ));
    let board = Arc::new(StatusBoard::new());

    let engine = SpeculativeEngine::<String>::builder(config)
        .artifact_builder(renderer.clone())
        .predictor(Arc::new(LinearPredictor::new(3, step)))
        .external_action(board.clone())
        .deviation_metric(Arc::new(NormalizedL1::new().with_scale("progress", 100.0)))
        .audit_sink(audit)
        .build()?;

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║           PROLEPSIS SPECULATIVE SIMULATOR                    ║");
    info!("║                                                               ║");
    info!("║  Answering each state before it arrives                       ║");
    info!("╚══════════════════════════════════════════════════════════════╝");
    info!("");
    info!("  Steps:            {} x {:?}", args.steps, step);
    info!("  Render latency:   {} ms", args.render_ms);
    info!("  Cache capacity:   {}", engine.config().capacity);
    info!(
        "  Audit log:        {}",
        args.audit_log
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "tracing".to_string())
    );
    info!("");

    let background = engine.start_background();
    let mut rollout = DriftingRollout::new(args.rate, args.setback_every);
    let mut ticker = tokio::time::interval(step);
    let mut build_errors = 0u64;

    for n in 0..args.steps {
        ticker.tick().await;
        let state = rollout.next_state();

        let artifacts = match engine.lookup(&state).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                build_errors += 1;
                warn!("Step {}: render failed: {}", n, e);
                continue;
            }
        };
        debug!("Step {}: {}", n, artifacts.payload);

        if artifacts.has_uncommitted_action() {
            match engine.commit(&state, &artifacts).await {
                Ok(receipt) => debug!(
                    "Step {}: posted {} as {}",
                    n, receipt.action_id, receipt.external_ref
                ),
                Err(e) => debug!("Step {}: commit skipped: {}", n, e),
            }
        }
    }

    // Let verification see the tail of the run
    tokio::time::sleep(step * 4).await;
    engine.sweep().await;
    background.shutdown().await;

    let stats = engine.stats();
    info!("");
    info!("Simulation complete");
    info!("  Lookups:          {} hits / {} misses", stats.hits, stats.misses);
    info!("  Hit rate:         {:.1}%", stats.hit_rate() * 100.0);
    info!("  Renders:          {}", renderer.renders());
    info!("  Render failures:  {}", build_errors);
    info!("  Gate rejections:  {}", stats.gate_rejections);
    info!("  Commits:          {}", stats.commits);
    info!(
        "  Verification:     {} confirmed, {} rolled back, {} escalated, {} open",
        stats.verification.confirmed,
        stats.verification.rolled_back,
        stats.verification.escalated,
        stats.verification.open
    );
    info!(
        "  Status board:     {} live, {} retracted",
        board.live(),
        board.retracted()
    );
    info!(
        "  Cache:            {}/{} entries, {} pinned, {} evictions",
        stats.cache.entries, stats.cache.capacity, stats.cache.pinned, stats.cache.evictions
    );

    // Dropping the engine closes the audit channel and ends the writer
    drop(engine);
    if let Some(writer) = writer {
        let written = writer.await??;
        info!("  Audit events:     {} written", written);
    }

    Ok(())
}

fn write_event(out: &mut impl Write, event: &AuditEvent) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")
}
