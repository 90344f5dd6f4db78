//! # API Relay Gateway
//!
//! Centralized forwarding gateway between internal services and external
//! upstream APIs.
//!
//! ## Features
//!
//! - Pattern-based route matching with credential injection
//! - Per-route circuit breakers with configurable recovery
//! - Static quotas plus adaptive, predictive, and behavioral throttling
//! - Response caching with TTL, tag, pattern, and event-driven invalidation
//! - Hot configuration reload from disk or the admin endpoint
//!
//! ## Usage
//!
//! ```bash
//! # Start with a config file, hot-reloaded on change
//! api-relay-gateway --config /etc/relay/gateway.yaml
//!
//! # Or point the environment at it
//! RELAY_CONFIG=/etc/relay/gateway.yaml api-relay-gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use relay_config::{load_from_path, ConfigHandle, ConfigWatcher, GatewayConfig};
use relay_pipeline::{HttpTransport, LogUsageSink, Pipeline};
use relay_server::AppState;
use relay_telemetry::init_logging;
use relay_throttle::{SharedMetricsFeed, SystemMetrics};

/// Interval between load observations fed to the adaptive throttler.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between tracker and window pruning passes.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Settle time after a config file change before re-reading it.
const RELOAD_SETTLE: Duration = Duration::from_millis(200);

const USAGE: &str = "\
Usage: api-relay-gateway [--config <path>]

Options:
  -c, --config <path>  Configuration file (YAML or TOML); also RELAY_CONFIG
  -h, --help           Print help
  -V, --version        Print version";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("api-relay-gateway failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let path = config_path()?;

    let config = match &path {
        Some(path) => load_from_path(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    init_logging(&config.telemetry).context("initializing logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        routes = config.routes.len(),
        "starting api-relay-gateway"
    );
    if path.is_none() {
        warn!("no config file given, starting with defaults and zero routes");
    }

    let transport = Arc::new(HttpTransport::new().context("building upstream client")?);
    let feed = Arc::new(SharedMetricsFeed::new());
    let handle = Arc::new(ConfigHandle::new(config.clone()));

    let (pipeline, workers) =
        Pipeline::new(config, transport, feed.clone(), Arc::new(LogUsageSink))
            .context("building pipeline")?;
    let pipeline = Arc::new(pipeline);

    let mut background = Vec::new();
    background.push(tokio::spawn(workers.invalidation.run()));
    background.push(tokio::spawn(workers.usage.run()));

    let boot = pipeline.config();
    background.push(tokio::spawn(
        Arc::clone(pipeline.cache())
            .sweep_loop(boot.cache.sweep_interval, boot.cache.sweep_batch_size),
    ));
    background.push(tokio::spawn(
        Arc::clone(&pipeline).maintenance_loop(MAINTENANCE_INTERVAL),
    ));
    background.push(tokio::spawn(feed_system_metrics(
        Arc::clone(&pipeline),
        feed,
        METRICS_SAMPLE_INTERVAL,
    )));

    // The watcher stops when dropped, so it lives until serve() returns.
    let watcher = match &path {
        Some(config_file) => {
            let (tx, rx) = mpsc::channel(1);
            let watcher = ConfigWatcher::spawn(config_file, tx)
                .with_context(|| format!("watching {}", config_file.display()))?;
            background.push(tokio::spawn(reload_loop(
                rx,
                config_file.clone(),
                Arc::clone(&pipeline),
                Arc::clone(&handle),
            )));
            Some(watcher)
        }
        None => None,
    };

    let server_settings = boot.server.clone();
    let state = AppState::new(Arc::clone(&pipeline), handle, path);
    relay_server::serve(state, &server_settings)
        .await
        .context("server failed")?;

    // serve() has already drained in-flight requests; the workers hold no
    // request state, so they are cancelled rather than waited out.
    drop(watcher);
    info!(workers = background.len(), "stopping background workers");
    for worker in &background {
        worker.abort();
    }
    for worker in background {
        let _ = worker.await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolves the config file from `--config`/`-c`, then `RELAY_CONFIG`.
fn config_path() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().context("--config requires a path")?;
                return Ok(Some(PathBuf::from(value)));
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("api-relay-gateway {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                if let Some(value) = other.strip_prefix("--config=") {
                    return Ok(Some(PathBuf::from(value)));
                }
                anyhow::bail!("unknown argument {other}\n{USAGE}");
            }
        }
    }
    Ok(std::env::var_os("RELAY_CONFIG").map(PathBuf::from))
}

/// Applies config file changes as they land. A file that fails to load or
/// validate is logged and skipped while the previous snapshot keeps serving.
async fn reload_loop(
    mut rx: mpsc::Receiver<()>,
    path: PathBuf,
    pipeline: Arc<Pipeline>,
    handle: Arc<ConfigHandle>,
) {
    while rx.recv().await.is_some() {
        // Editors write in bursts; the channel coalesces them and the
        // settle keeps us from reading a half-written file.
        tokio::time::sleep(RELOAD_SETTLE).await;

        let config = match load_from_path(&path).await {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "changed config failed to load, keeping previous");
                continue;
            }
        };
        match pipeline.reload(config.clone()) {
            Ok(()) => {
                let version = handle.publish(config);
                info!(version, "configuration reloaded from disk");
            }
            Err(err) => warn!(error = %err, "changed config rejected, keeping previous"),
        }
    }
}

/// Cumulative counters read from the request ledger at one instant.
struct LedgerCursor {
    total: u64,
    failures: u64,
    latency_micros: u64,
    latency_samples: u64,
}

impl LedgerCursor {
    fn read(pipeline: &Pipeline) -> Self {
        let snapshot = pipeline.stats().snapshot();
        let (latency_micros, latency_samples) = pipeline.stats().upstream_latency_totals();
        Self {
            total: snapshot.total_requests,
            failures: snapshot.upstream_failures + snapshot.internal_errors,
            latency_micros,
            latency_samples,
        }
    }
}

/// Turns the request ledger into interval load observations for the
/// adaptive throttler. Baselines drift toward observed values during
/// healthy intervals, so "slow" stays relative to this deployment.
async fn feed_system_metrics(
    pipeline: Arc<Pipeline>,
    feed: Arc<SharedMetricsFeed>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last = LedgerCursor::read(&pipeline);
    let mut baseline_latency = Duration::from_millis(200);
    let mut baseline_rps: f64 = 10.0;

    loop {
        ticker.tick().await;
        let current = LedgerCursor::read(&pipeline);
        let requests = current.total.saturating_sub(last.total);
        let failures = current.failures.saturating_sub(last.failures);
        let samples = current.latency_samples.saturating_sub(last.latency_samples);
        let micros = current.latency_micros.saturating_sub(last.latency_micros);
        last = current;

        if requests == 0 {
            // Idle; adaptive throttling stands down until traffic returns.
            feed.clear();
            continue;
        }

        // An all-cache interval has no upstream legs and reads as baseline.
        let avg_response_time = if samples == 0 {
            baseline_latency
        } else {
            Duration::from_micros(micros / samples)
        };
        let requests_per_second = requests as f64 / interval.as_secs_f64();
        let error_rate = failures as f64 / requests as f64;

        if error_rate < 0.05 {
            let blended = baseline_latency
                .as_secs_f64()
                .mul_add(0.8, avg_response_time.as_secs_f64() * 0.2);
            baseline_latency = Duration::from_secs_f64(blended);
            baseline_rps = baseline_rps.mul_add(0.8, requests_per_second * 0.2);
        }

        feed.store(SystemMetrics {
            avg_response_time,
            requests_per_second,
            error_rate,
            // No host-level probe is wired; utilization reads as unloaded.
            resource_utilization: 0.0,
            baseline_response_time: baseline_latency,
            baseline_throughput: baseline_rps.max(1.0),
            cost_rate: None,
            age: Duration::ZERO,
        });
    }
}
