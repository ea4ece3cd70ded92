//! PPE Acceleration Simulator
//!
//! Drives the admission core and NPTv6 slot ownership against a simulated
//! offload engine and prints the final statistics as JSON.
//!
//! # Usage
//!
//! ```bash
//! ppe-accel-sim --connections 5000 --workers 8 --fail-rate 0.02 --hold-ms 5
//! PPE_ACCEL_CONFIG=/etc/ppe-accel.json RUST_LOG=ppe_accel=debug ppe-accel-sim
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;
use ppe_accel::{AccelConfig, Nptv6Frontend, PendingWatchdog};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod driver;
mod engine;

#[derive(Parser)]
#[command(name = "ppe-accel-sim")]
#[command(version)]
#[command(about = "Simulate PPE acceleration admission and NPTv6 offload", long_about = None)]
struct Cli {
    /// Acceleration config file (JSON)
    #[arg(long, env = "PPE_ACCEL_CONFIG")]
    config: Option<PathBuf>,

    /// Connections to offload
    #[arg(long, default_value_t = 1000)]
    connections: u32,

    /// Worker threads
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Probability that an engine programming call fails
    #[arg(long, default_value_t = 0.05)]
    fail_rate: f64,

    /// How long each connection stays accelerated
    #[arg(long, default_value_t = 10)]
    hold_ms: u64,

    /// Simulated engine call latency in microseconds
    #[arg(long, default_value_t = 0)]
    latency_us: u64,
}

fn load_config(path: Option<&PathBuf>) -> AccelConfig {
    let Some(path) = path else {
        return AccelConfig::default();
    };
    AccelConfig::load(path).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "config not usable, using defaults");
        AccelConfig::default()
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    ensure!((0.0..=1.0).contains(&cli.fail_rate), "--fail-rate must be within 0.0..=1.0");
    ensure!(cli.workers > 0, "--workers must be at least 1");

    tracing::info!("ppe-accel-sim v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_ref());
    tracing::info!(
        limit_mode = ?config.limit_mode,
        max_connections = config.max_connections,
        prefix_table_size = config.prefix_table_size,
        iid_table_size = config.iid_table_size,
        "acceleration config"
    );

    let hal = Arc::new(engine::SimulatedHal::new(
        cli.fail_rate,
        Duration::from_micros(cli.latency_us),
    ));
    let fe = Nptv6Frontend::from_config(&config, Arc::clone(&hal))
        .context("failed to build offload frontend")?;

    let watchdog = match config.pending_timeout() {
        Some(_) => Some(
            PendingWatchdog::spawn(Arc::clone(fe.state_machine()), config.watchdog_interval())
                .context("failed to start pending watchdog")?,
        ),
        None => None,
    };

    let workload = driver::Workload {
        connections: cli.connections,
        workers: cli.workers,
        hold: Duration::from_millis(cli.hold_ms),
        iid_slots: config.iid_table_size,
    };
    let report = driver::run(&fe, &workload);
    drop(watchdog);

    tracing::info!(
        offloaded = report.offloaded,
        refused = report.refused,
        failed = report.failed,
        elapsed_ms = report.elapsed_ms,
        "simulation complete"
    );

    let output = serde_json::json!({
        "workload": report,
        "engine": hal.counters(),
        "accel": fe.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
