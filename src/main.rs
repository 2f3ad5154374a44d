//! prospectord: the background reconciliation daemon.
//!
//! Phase services are embedded by the host orchestrator through
//! `services::build_registry`; this binary runs the pieces that belong to
//! no single orchestrator process: the counter reconciler, the extraction
//! task reconciler, and the stale-score detector, all against the shared
//! store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use prospector::config::EngineConfig;
use prospector::engines::flags::StaticFlags;
use prospector::events::BroadcastBus;
use prospector::reconcile::{
    CounterReconciler, ExtractionReconciler, StaleScoreDetector, SystemClock,
};
use prospector::store::{CampaignStore, SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "prospectord", about = "Campaign engine reconciliation daemon")]
struct Args {
    /// Path to prospector.toml
    #[arg(long, default_value = "prospector.toml")]
    config: PathBuf,

    /// Override the database path from the config file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log JSON instead of human-readable lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = EngineConfig::load_or_default(&args.config)
        .context("Failed to load engine configuration")?;
    if let Some(db) = args.db {
        config.engine.db_path = db;
    }
    tracing::info!(
        db_path = %config.engine.db_path.display(),
        "prospectord starting"
    );

    let store: Arc<dyn CampaignStore> = Arc::new(
        SqliteStore::new(&config.engine.db_path).context("Failed to open campaign store")?,
    );
    let bus = Arc::new(BroadcastBus::with_capacity(config.engine.event_buffer));
    let clock = Arc::new(SystemClock);
    let flags = Arc::new(StaticFlags::new());

    let cancel = CancellationToken::new();
    let counter_reconciler = Arc::new(CounterReconciler::new(
        Arc::clone(&store),
        bus,
        config.reconciler.counters.clone(),
    ));
    let extraction_reconciler = Arc::new(ExtractionReconciler::new(
        Arc::clone(&store),
        clock.clone() as Arc<dyn prospector::reconcile::Clock>,
        config.reconciler.extraction.clone(),
    ));
    let stale_detector = Arc::new(StaleScoreDetector::new(
        Arc::clone(&store),
        clock as Arc<dyn prospector::reconcile::Clock>,
        flags,
        config.reconciler.stale_scores.clone(),
    ));

    let mut workers = Vec::new();
    workers.push(tokio::spawn(
        Arc::clone(&counter_reconciler).run_loop(cancel.clone()),
    ));
    workers.push(tokio::spawn(
        Arc::clone(&extraction_reconciler).run_loop(cancel.clone()),
    ));
    workers.push(tokio::spawn(
        Arc::clone(&stale_detector).run_loop(cancel.clone()),
    ));
    tracing::info!("reconciliation workers running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, stopping workers");
    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("prospectord stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
