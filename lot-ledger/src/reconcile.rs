//! Reconciliation checker
//!
//! Audit of the ledger invariants. It scans committed state, holding a
//! shared lock on each position while comparing it with its extractions,
//! and only locks exclusively the single position or lot it corrects.
//! [`ReconciliationChecker::spawn_periodic`] runs it inside the process that
//! owns the store.
//!
//! - Stock: `initial − Σ(live extractions)` against `remaining_amount`.
//!   Drift beyond ε is reported; with `apply` the remaining amount is reset
//!   to the derived value when that value is within bounds.
//! - Lineage: every live child must share its parent's biofuel category and
//!   fit in the parent's amount. A misplaced child is relinked only when
//!   exactly one candidate parent exists and `apply` is set; several
//!   candidates are always left for manual resolution.
//! - Event chains: every lot's hash chain must verify.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::collaborators::ReferenceData;
use crate::config::ReconciliationConfig;
use crate::events::{payload, EventLog};
use crate::lineage::LineageStore;
use crate::metrics::Metrics;
use crate::stock::StockLedger;
use crate::storage::Storage;
use crate::types::{BiofuelCode, EntityId, EventType, Lot, LotId, LotStatus, StockId};
use crate::{Error, Result};

/// Stock position whose remaining amount drifted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockFinding {
    /// Position
    pub position: StockId,
    /// Derived remaining amount
    pub expected: Decimal,
    /// Stored remaining amount
    pub actual: Decimal,
    /// `actual − expected`
    pub diff: Decimal,
    /// Whether the checker wrote the correction
    pub corrected: bool,
    /// Why no correction was written
    pub note: Option<String>,
}

/// What is wrong with a child lot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineageIssue {
    /// Parent record does not exist
    MissingParent,
    /// Child biofuel category differs from the parent's
    IncompatibleCategory {
        /// Parent category
        parent_category: String,
        /// Child category
        child_category: String,
    },
    /// Child pushes the live children above the parent amount
    OverAllocated {
        /// Parent amount
        parent_amount: Decimal,
        /// Σ of live children up to and including this one
        claimed: Decimal,
    },
}

/// How a lineage finding was handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    /// No parent fits; manual resolution
    NoCandidate,
    /// Exactly one parent fits; relink with `apply`
    Candidate {
        /// Proposed parent
        parent: LotId,
    },
    /// Relinked to the single fitting parent
    Relinked {
        /// New parent
        parent: LotId,
    },
    /// Several parents fit; never guessed
    Ambiguous {
        /// Fitting parents
        candidates: Vec<LotId>,
    },
}

/// Child lot breaking a lineage invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageFinding {
    /// Child lot
    pub lot: LotId,
    /// Current parent
    pub parent: LotId,
    /// Issue
    pub issue: LineageIssue,
    /// Handling
    pub resolution: Resolution,
}

/// Lot whose event chain does not verify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFinding {
    /// Lot
    pub lot: LotId,
    /// Verification error
    pub reason: String,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Whether corrections were allowed
    pub applied: bool,
    /// Positions scanned
    pub positions_checked: usize,
    /// Lots scanned
    pub lots_checked: usize,
    /// Stock drift
    pub stock: Vec<StockFinding>,
    /// Lineage violations
    pub lineage: Vec<LineageFinding>,
    /// Broken event chains
    pub chains: Vec<ChainFinding>,
}

impl ReconciliationReport {
    /// Nothing found
    pub fn is_clean(&self) -> bool {
        self.findings() == 0
    }

    /// Total findings
    pub fn findings(&self) -> usize {
        self.stock.len() + self.lineage.len() + self.chains.len()
    }

    /// Findings the run repaired
    pub fn corrections(&self) -> usize {
        self.stock.iter().filter(|f| f.corrected).count()
            + self
                .lineage
                .iter()
                .filter(|f| matches!(f.resolution, Resolution::Relinked { .. }))
                .count()
    }

    /// Findings still needing attention
    pub fn unresolved(&self) -> usize {
        self.findings() - self.corrections()
    }

    /// `Err(ReconciliationDrift)` while anything is unresolved
    pub fn into_result(self) -> Result<Self> {
        let unresolved = self.unresolved();
        if unresolved > 0 {
            return Err(Error::ReconciliationDrift(format!(
                "{} unresolved finding(s): {} stock, {} lineage, {} event chain",
                unresolved,
                self.stock.iter().filter(|f| !f.corrected).count(),
                self.lineage
                    .iter()
                    .filter(|f| !matches!(f.resolution, Resolution::Relinked { .. }))
                    .count(),
                self.chains.len()
            )));
        }
        Ok(self)
    }
}

/// Reconciliation checker
#[derive(Clone)]
pub struct ReconciliationChecker {
    storage: Arc<Storage>,
    lineage: LineageStore,
    stock: StockLedger,
    events: EventLog,
    reference: Arc<dyn ReferenceData>,
    metrics: Metrics,
    config: ReconciliationConfig,
}

impl ReconciliationChecker {
    /// Create checker
    pub fn new(
        storage: Arc<Storage>,
        lineage: LineageStore,
        stock: StockLedger,
        events: EventLog,
        reference: Arc<dyn ReferenceData>,
        metrics: Metrics,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            storage,
            lineage,
            stock,
            events,
            reference,
            metrics,
            config,
        }
    }

    /// Run with the configured `apply_corrections` flag
    pub fn run(&self) -> Result<ReconciliationReport> {
        self.run_with(self.config.apply_corrections)
    }

    /// Run on a fixed interval on the current tokio runtime, first run
    /// immediately. Each run executes on the blocking pool.
    pub fn spawn_periodic(self, every: Duration) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let checker = self.clone();
                match tokio::task::spawn_blocking(move || checker.run()).await {
                    Ok(Ok(report)) => tracing::debug!(
                        findings = report.findings(),
                        unresolved = report.unresolved(),
                        "Scheduled reconciliation finished"
                    ),
                    Ok(Err(e)) => tracing::error!("Scheduled reconciliation failed: {}", e),
                    Err(e) => tracing::error!("Scheduled reconciliation panicked: {}", e),
                }
            }
        })
    }

    /// Run, writing corrections only if `apply` is set
    pub fn run_with(&self, apply: bool) -> Result<ReconciliationReport> {
        let started = Instant::now();
        let started_at = Utc::now();
        let operator = EntityId::new(self.config.operator.clone());

        tracing::info!(apply, epsilon = %self.config.epsilon, "Reconciliation started");

        let positions = self.stock.positions()?;
        let stock = self.check_stock(&positions, apply, &operator)?;

        let lots = self.lineage.all_lots()?;
        let lineage = self.check_lineage(&lots, apply, &operator)?;
        let chains = self.check_chains(&lots)?;

        let report = ReconciliationReport {
            started_at,
            finished_at: Utc::now(),
            applied: apply,
            positions_checked: positions.len(),
            lots_checked: lots.len(),
            stock,
            lineage,
            chains,
        };

        self.metrics.record_reconciliation(
            report.findings(),
            report.corrections(),
            started.elapsed().as_secs_f64(),
        );

        if report.is_clean() {
            tracing::info!(lots = report.lots_checked, positions = report.positions_checked, "Reconciliation clean");
        } else {
            tracing::warn!(
                findings = report.findings(),
                corrections = report.corrections(),
                "Reconciliation found drift"
            );
        }

        Ok(report)
    }

    fn check_stock(
        &self,
        positions: &[crate::types::StockPosition],
        apply: bool,
        operator: &EntityId,
    ) -> Result<Vec<StockFinding>> {
        let mut findings = Vec::new();

        for position in positions {
            let drift = self.stock.reconcile_expected(position.id)?;
            if !drift.exceeds(self.config.epsilon) {
                continue;
            }

            tracing::warn!(
                stock_id = %position.id,
                expected = %drift.expected,
                actual = %drift.actual,
                "Stock drift"
            );

            let mut finding = StockFinding {
                position: position.id,
                expected: drift.expected,
                actual: drift.actual,
                diff: drift.drift,
                corrected: false,
                note: None,
            };

            if drift.expected < Decimal::ZERO || drift.expected > position.initial_amount {
                finding.note = Some("derived remaining amount out of bounds".to_string());
            } else if apply {
                match self.stock.correct_remaining(position.id, operator) {
                    Ok(Some(_)) => finding.corrected = true,
                    Ok(None) => {
                        tracing::debug!(stock_id = %position.id, "Drift gone on re-check");
                        continue;
                    }
                    Err(e) => finding.note = Some(e.to_string()),
                }
            }

            findings.push(finding);
        }

        Ok(findings)
    }

    fn check_lineage(&self, lots: &[Lot], apply: bool, operator: &EntityId) -> Result<Vec<LineageFinding>> {
        let by_id: HashMap<LotId, &Lot> = lots.iter().map(|lot| (lot.id, lot)).collect();
        let mut categories = CategoryCache::new(self.reference.as_ref());

        // Live children grouped by parent, oldest first
        let mut groups: BTreeMap<LotId, Vec<&Lot>> = BTreeMap::new();
        for lot in lots.iter().filter(|lot| lot.status.is_live()) {
            if let Some(parent) = lot.parent_lot() {
                groups.entry(parent).or_default().push(lot);
            }
        }

        let mut flagged = Vec::new();
        for (parent_id, mut children) in groups {
            children.sort_by_key(|lot| (lot.created_at, lot.id));

            let Some(parent) = by_id.get(&parent_id) else {
                for child in children {
                    flagged.push((child, parent_id, LineageIssue::MissingParent));
                }
                continue;
            };

            let parent_category = categories.get(&parent.biofuel);
            let mut claimed = Decimal::ZERO;
            for child in children {
                let child_category = categories.get(&child.biofuel);
                if child_category != parent_category {
                    flagged.push((
                        child,
                        parent_id,
                        LineageIssue::IncompatibleCategory {
                            parent_category: parent_category.clone(),
                            child_category,
                        },
                    ));
                    continue;
                }

                let next = claimed + child.amount;
                if next > parent.amount + self.config.epsilon {
                    flagged.push((
                        child,
                        parent_id,
                        LineageIssue::OverAllocated {
                            parent_amount: parent.amount,
                            claimed: next,
                        },
                    ));
                    continue;
                }
                claimed = next;
            }
        }

        let mut findings = Vec::with_capacity(flagged.len());
        for (child, parent, issue) in flagged {
            tracing::warn!(lot_id = %child.id, parent = %parent, issue = ?issue, "Lineage violation");

            let candidates = self.candidate_parents(child, parent, lots, &mut categories)?;
            let resolution = match candidates.as_slice() {
                [] => Resolution::NoCandidate,
                [only] if apply => match self.relink(*only, child.id, operator) {
                    Ok(()) => Resolution::Relinked { parent: *only },
                    Err(e) => {
                        tracing::warn!(lot_id = %child.id, candidate = %only, "Relink failed: {}", e);
                        Resolution::Candidate { parent: *only }
                    }
                },
                [only] => Resolution::Candidate { parent: *only },
                many => Resolution::Ambiguous {
                    candidates: many.to_vec(),
                },
            };

            findings.push(LineageFinding {
                lot: child.id,
                parent,
                issue,
                resolution,
            });
        }

        Ok(findings)
    }

    /// Accepted forwarding lots that could own `child` instead of `current`
    fn candidate_parents(
        &self,
        child: &Lot,
        current: LotId,
        lots: &[Lot],
        categories: &mut CategoryCache<'_>,
    ) -> Result<Vec<LotId>> {
        let child_category = categories.get(&child.biofuel);
        let mut candidates = Vec::new();

        for lot in lots {
            if lot.id == child.id || lot.id == current {
                continue;
            }
            if !matches!(lot.status, LotStatus::Accepted | LotStatus::Frozen)
                || !lot.delivery_type.forwards_volume()
            {
                continue;
            }
            if lot.client.as_ref() != Some(&child.supplier) {
                continue;
            }
            if categories.get(&lot.biofuel) != child_category {
                continue;
            }
            if lot.amount - self.lineage.live_children_amount(lot.id)? < child.amount {
                continue;
            }
            if self.lineage.would_create_cycle(child.id, lot.id)? {
                continue;
            }
            candidates.push(lot.id);
        }

        Ok(candidates)
    }

    /// Move `child` under `parent`; locks the parent, then the child
    fn relink(&self, parent: LotId, child: LotId, operator: &EntityId) -> Result<()> {
        let txn = self.storage.begin();
        let new_parent = txn.lock_lot(parent)?;
        let lot = txn.lock_lot(child)?;
        let previous = lot
            .parent_lot()
            .map_or_else(|| "none".to_string(), |id| id.to_string());

        let moved = self.lineage.relink(&txn, &new_parent, &lot)?;
        self.events.append(
            &txn,
            moved.id,
            EventType::Updated,
            operator,
            payload([
                ("parent_lot", format!("{} -> {}", previous, parent)),
                ("reason", "reconciliation".to_string()),
            ]),
        )?;
        txn.commit()?;

        self.metrics.record_transition(EventType::Updated);
        tracing::warn!(lot_id = %child, parent = %parent, operator = %operator, "Lot relinked");
        Ok(())
    }

    fn check_chains(&self, lots: &[Lot]) -> Result<Vec<ChainFinding>> {
        let mut findings = Vec::new();
        for lot in lots {
            match self.events.verify_chain(lot.id) {
                Ok(()) => {}
                Err(Error::ReconciliationDrift(reason)) => {
                    tracing::warn!(lot_id = %lot.id, "Event chain broken: {}", reason);
                    findings.push(ChainFinding { lot: lot.id, reason });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(findings)
    }
}

/// Biofuel category lookups, falling back to the code itself
struct CategoryCache<'a> {
    reference: &'a dyn ReferenceData,
    cache: HashMap<BiofuelCode, String>,
}

impl<'a> CategoryCache<'a> {
    fn new(reference: &'a dyn ReferenceData) -> Self {
        Self {
            reference,
            cache: HashMap::new(),
        }
    }

    fn get(&mut self, code: &BiofuelCode) -> String {
        let reference = self.reference;
        self.cache
            .entry(code.clone())
            .or_insert_with(|| {
                reference
                    .biofuel(code)
                    .map(|b| b.category)
                    .unwrap_or_else(|_| code.as_str().to_string())
            })
            .clone()
    }
}
