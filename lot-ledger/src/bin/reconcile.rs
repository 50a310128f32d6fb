//! Reconciliation checker binary
//!
//! Prints the report as JSON. Exits non-zero while findings stay unresolved.
//!
//! Offline only: RocksDB locks the data directory for a single process, so
//! this cannot open a store that `lot-ledger-server` is serving. The server
//! runs the same checker itself every `reconciliation.interval_secs`.

use anyhow::Context;
use clap::Parser;
use lot_ledger::collaborators::{InMemoryReferenceData, NoSanityIssues, ReferenceSnapshot};
use lot_ledger::notify::NullNotifier;
use lot_ledger::{Config, LotLedger, ReconciliationReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "lot-reconcile",
    about = "Audit stock positions, lineage and event chains of the lot ledger",
    version
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Reference data snapshot (TOML) used for biofuel categories
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Write corrections back (operator confirmation)
    #[arg(long)]
    apply: bool,

    /// Keep running on an interval instead of once
    #[arg(long)]
    watch: bool,

    /// Seconds between runs in watch mode (default from configuration)
    #[arg(long, requires = "watch")]
    interval: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if cli.apply {
        config.reconciliation.apply_corrections = true;
    }
    let every = cli.interval.unwrap_or(config.reconciliation.interval_secs);

    let reference = match &cli.reference {
        Some(path) => InMemoryReferenceData::from_snapshot(ReferenceSnapshot::from_file(path)?),
        None => InMemoryReferenceData::new(),
    };

    let data_dir = config.data_dir.clone();
    let ledger = LotLedger::open(
        config,
        Arc::new(reference),
        Arc::new(NoSanityIssues),
        Arc::new(NullNotifier),
    )
    .with_context(|| {
        format!(
            "cannot open {}; is lot-ledger-server running on it?",
            data_dir.display()
        )
    })?;

    if !cli.watch {
        let report = run_once(&ledger).await?;
        if report.unresolved() > 0 {
            std::process::exit(2);
        }
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_once(&ledger).await {
                    tracing::error!("Reconciliation run failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping reconciliation watch");
                return Ok(());
            }
        }
    }
}

async fn run_once(ledger: &LotLedger) -> anyhow::Result<ReconciliationReport> {
    let ledger = ledger.clone();
    let report = tokio::task::spawn_blocking(move || ledger.reconcile()).await??;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report)
}
