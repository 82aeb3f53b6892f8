//! Cadence — multi-step email outreach engine.
//!
//! Main entry point: wires storage, transport, the dispatch worker, and the
//! reconciler, then runs until interrupted.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use cadence_core::clock::system_clock;
use cadence_core::config::AppConfig;
use cadence_dispatch::{
    BlackholeSender, DispatchWorker, EmailSender, MemoryStore, OutreachStore, Reconciler,
};

#[derive(Parser, Debug)]
#[command(name = "cadence-server")]
#[command(about = "Multi-step email outreach engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CADENCE__NODE_ID")]
    node_id: Option<String>,

    /// Worker poll interval in seconds (overrides config)
    #[arg(long, env = "CADENCE__WORKER__POLL_INTERVAL_SECS")]
    poll_interval: Option<u64>,

    /// Reconciler scan interval in seconds (overrides config)
    #[arg(long, env = "CADENCE__RECOVERY__SCAN_INTERVAL_SECS")]
    scan_interval: Option<u64>,

    /// Disable the reconciler loop (worker-only mode)
    #[arg(long, default_value_t = false)]
    no_recovery: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Cadence starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.poll_interval {
        config.worker.poll_interval_secs = interval;
    }
    if let Some(interval) = cli.scan_interval {
        config.recovery.scan_interval_secs = interval;
    }

    info!(
        node_id = %config.node_id,
        poll_interval_secs = config.worker.poll_interval_secs,
        reference_timezone = %config.delivery.reference_timezone,
        "Configuration loaded"
    );

    // In-process store and development transport; production deployments
    // swap both through the trait seams.
    let store: Arc<dyn OutreachStore> = Arc::new(MemoryStore::new());
    let sender: Arc<dyn EmailSender> = Arc::new(BlackholeSender);
    let clock = system_clock();

    let worker = Arc::new(DispatchWorker::new(
        &config,
        store.clone(),
        sender,
        clock.clone(),
    ));

    // Daily counter reset at the reference-zone midnight is an external
    // trigger; checked periodically, applied only on day rollover.
    let rate = worker.rate_controller();
    let reset_clock = clock.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            if rate.roll_day(reset_clock.now()) {
                info!("Daily send counters reset");
            }
        }
    });

    if !cli.no_recovery {
        let reconciler = Arc::new(Reconciler::new(
            &config.recovery,
            store.clone(),
            worker.clone(),
            clock.clone(),
        ));
        tokio::spawn(reconciler.run());
    } else {
        info!("Running without the reconciler loop");
    }

    tokio::spawn(worker.run());

    info!("Cadence is running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    Ok(())
}
