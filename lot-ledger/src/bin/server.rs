//! Lot ledger server binary

use lot_ledger::collaborators::{InMemoryReferenceData, NoSanityIssues, ReferenceSnapshot};
use lot_ledger::notify::{spawn_notifier, LoggingSink, NullNotifier, Notifier};
use lot_ledger::{Config, LotLedger};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting lot ledger server");

    // Load configuration
    let config = match std::env::var("LOT_LEDGER_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env()?;
            config
        }
        Err(_) => Config::from_env()?,
    };

    let reference = match std::env::var("LOT_LEDGER_REFERENCE") {
        Ok(path) => InMemoryReferenceData::from_snapshot(ReferenceSnapshot::from_file(path)?),
        Err(_) => InMemoryReferenceData::new(),
    };

    let notifier: Arc<dyn Notifier> = if config.notifications.enabled {
        Arc::new(spawn_notifier(LoggingSink, config.notifications.channel_capacity))
    } else {
        Arc::new(NullNotifier)
    };

    let reconcile_every = config.reconciliation.interval_secs;

    // Open ledger
    let ledger = LotLedger::open(config, Arc::new(reference), Arc::new(NoSanityIssues), notifier)?;
    let stats = ledger.stats()?;
    tracing::info!(
        lots = stats.total_lots,
        positions = stats.total_stock_positions,
        events = stats.total_events,
        "Ledger opened successfully"
    );

    // The store is held exclusively, so the checker runs in-process
    let reconciliation = (reconcile_every > 0).then(|| {
        tracing::info!(interval_secs = reconcile_every, "Scheduling reconciliation");
        ledger
            .checker()
            .clone()
            .spawn_periodic(Duration::from_secs(reconcile_every))
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down lot ledger server");
    if let Some(task) = reconciliation {
        task.abort();
    }
    Ok(())
}
