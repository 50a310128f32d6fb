//! Biofuel lot ledger
//!
//! Lifecycle state machine and traceability/stock ledger for batches of
//! biofuel ("lots") moving between producers, traders and operators.
//!
//! # Architecture
//!
//! - **Lot State Machine**: single authority for status transitions and child derivation
//! - **Lineage Store**: lots as a forest, each lot with at most one parent
//! - **Stock Ledger**: depot positions with conservation-checked extractions
//! - **Event Log**: hash-chained audit trail written in the same transaction
//! - **Reconciliation Checker**: offline audit that reports and repairs drift
//!
//! # Invariants
//!
//! - Conservation: Σ(live children) ≤ parent amount
//! - Stock bounds: 0 ≤ remaining ≤ initial
//! - Extraction additivity: initial − remaining == Σ(live extractions)
//! - Status monotonicity: nothing leaves a terminal status

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod lineage;
pub mod machine;
pub mod metrics;
pub mod notify;
pub mod quantity;
pub mod reconcile;
pub mod stock;
pub mod storage;
pub mod types;

// Re-exports
pub use collaborators::{InMemoryReferenceData, ReferenceData, SanityChecker};
pub use config::Config;
pub use error::{Error, ErrorCode, Result};
pub use events::EventLog;
pub use ledger::LotLedger;
pub use lineage::LineageStore;
pub use machine::{LotStateMachine, LotUpdate, NewLot, OutcomeParams, Transition};
pub use metrics::Metrics;
pub use notify::{Notification, Notifier};
pub use quantity::Quantity;
pub use reconcile::{ReconciliationChecker, ReconciliationReport};
pub use stock::{StockDrift, StockLedger};
pub use storage::Storage;
pub use types::{
    DeliveryType, EntityId, Event, EventType, Lot, LotId, LotStatus, Party, StockId,
    StockPosition, Unit,
};
