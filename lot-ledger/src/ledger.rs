//! Main ledger orchestration layer
//!
//! This module ties together storage, lineage, stock, events and the state
//! machine into a single handle for the calling layer.
//!
//! # Example
//!
//! ```no_run
//! use lot_ledger::collaborators::{InMemoryReferenceData, NoSanityIssues};
//! use lot_ledger::notify::NullNotifier;
//! use lot_ledger::{Config, LotLedger};
//! use std::sync::Arc;
//!
//! fn main() -> lot_ledger::Result<()> {
//!     let ledger = LotLedger::open(
//!         Config::default(),
//!         Arc::new(InMemoryReferenceData::new()),
//!         Arc::new(NoSanityIssues),
//!         Arc::new(NullNotifier),
//!     )?;
//!
//!     // let draft = ledger.machine().create_draft(&owner, new_lot)?;
//!     // ledger.submit(draft.id, &owner)?;
//!
//!     Ok(())
//! }
//! ```

use rust_decimal::Decimal;
use std::sync::Arc;

use crate::collaborators::{ReferenceData, SanityChecker};
use crate::events::EventLog;
use crate::lineage::LineageStore;
use crate::machine::{LotStateMachine, OutcomeParams, Transition};
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::reconcile::{ReconciliationChecker, ReconciliationReport};
use crate::stock::StockLedger;
use crate::storage::{Storage, StorageStats};
use crate::types::{DeliveryType, EntityId, Lot, LotId, StockId, StockPosition};
use crate::{Config, Error, Result};

/// Main ledger interface
#[derive(Clone)]
pub struct LotLedger {
    storage: Arc<Storage>,
    lineage: LineageStore,
    events: EventLog,
    stock: StockLedger,
    machine: LotStateMachine,
    checker: ReconciliationChecker,
    metrics: Metrics,
    config: Config,
}

impl LotLedger {
    /// Open ledger with configuration and collaborators
    pub fn open(
        config: Config,
        reference: Arc<dyn ReferenceData>,
        sanity: Arc<dyn SanityChecker>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let lineage = LineageStore::new(storage.clone());
        let events = EventLog::new(storage.clone());
        let stock = StockLedger::new(
            storage.clone(),
            lineage.clone(),
            events.clone(),
            metrics.clone(),
        );
        let machine = LotStateMachine::new(
            storage.clone(),
            lineage.clone(),
            events.clone(),
            stock.clone(),
            reference.clone(),
            sanity,
            notifier,
            metrics.clone(),
        );
        let checker = ReconciliationChecker::new(
            storage.clone(),
            lineage.clone(),
            stock.clone(),
            events.clone(),
            reference,
            metrics.clone(),
            config.reconciliation.clone(),
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            "Lot ledger opened"
        );

        Ok(Self {
            storage,
            lineage,
            events,
            stock,
            machine,
            checker,
            metrics,
            config,
        })
    }

    /// Submit a draft
    pub fn submit(&self, lot_id: LotId, acting: &EntityId) -> Result<Transition> {
        self.machine.submit(lot_id, acting)
    }

    /// Accept a pending lot
    pub fn accept(
        &self,
        lot_id: LotId,
        acting: &EntityId,
        outcome: DeliveryType,
        params: OutcomeParams,
    ) -> Result<Transition> {
        self.machine.accept(lot_id, acting, outcome, params)
    }

    /// Freeze a pending lot
    pub fn freeze(
        &self,
        lot_id: LotId,
        acting: &EntityId,
        outcome: DeliveryType,
        params: OutcomeParams,
    ) -> Result<Transition> {
        self.machine.freeze(lot_id, acting, outcome, params)
    }

    /// Reject a pending lot
    pub fn reject(&self, lot_id: LotId, acting: &EntityId, comment: &str) -> Result<Transition> {
        self.machine.reject(lot_id, acting, comment)
    }

    /// Delete a draft
    pub fn delete(&self, lot_id: LotId, acting: &EntityId) -> Result<Transition> {
        self.machine.delete(lot_id, acting)
    }

    /// Open (or find) the stock position of a stored lot
    pub fn create_position(&self, origin: LotId) -> Result<StockPosition> {
        self.stock.create_position(origin)
    }

    /// Extract from a stock position into a new draft
    pub fn extract(&self, position: StockId, amount: Decimal, acting: &EntityId) -> Result<Lot> {
        self.stock.extract(position, amount, acting)
    }

    /// Run the reconciliation checker with the configured flags
    pub fn reconcile(&self) -> Result<ReconciliationReport> {
        self.checker.run()
    }

    /// Get lot by ID
    pub fn lot(&self, lot_id: LotId) -> Result<Lot> {
        self.lineage.get(lot_id)
    }

    /// Get stock position by ID
    pub fn position(&self, position: StockId) -> Result<StockPosition> {
        self.stock.get(position)
    }

    /// State machine
    pub fn machine(&self) -> &LotStateMachine {
        &self.machine
    }

    /// Stock ledger
    pub fn stock(&self) -> &StockLedger {
        &self.stock
    }

    /// Lineage store
    pub fn lineage(&self) -> &LineageStore {
        &self.lineage
    }

    /// Event log
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Reconciliation checker
    pub fn checker(&self) -> &ReconciliationChecker {
        &self.checker
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Raw storage (operator tooling and tests)
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
