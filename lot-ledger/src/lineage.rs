//! Lineage store
//!
//! Lots form a forest: each lot has at most one parent lot (or one parent
//! stock position). Reads here see committed state; writes go through a
//! caller-owned [`Txn`] after the caller has locked the parent row.

use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::storage::{Storage, Txn};
use crate::types::{Lineage, Lot, LotId, StockId};
use crate::{Error, Result};

/// Lineage store
#[derive(Debug, Clone)]
pub struct LineageStore {
    storage: Arc<Storage>,
}

impl LineageStore {
    /// Create lineage store
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Get lot by ID
    pub fn get(&self, id: LotId) -> Result<Lot> {
        self.storage.get_lot(id)
    }

    /// Every lot in the store
    pub fn all_lots(&self) -> Result<Vec<Lot>> {
        self.storage.scan_lots()
    }

    /// Children of `parent`, oldest first
    pub fn children(&self, parent: LotId) -> Result<Vec<Lot>> {
        let mut children = self
            .storage
            .child_ids(parent)?
            .into_iter()
            .map(|id| self.storage.get_lot(id))
            .collect::<Result<Vec<_>>>()?;
        children.sort_by_key(|lot| (lot.created_at, lot.id));
        Ok(children)
    }

    /// Children that still claim volume (not rejected or deleted)
    pub fn live_children(&self, parent: LotId) -> Result<Vec<Lot>> {
        Ok(self
            .children(parent)?
            .into_iter()
            .filter(|lot| lot.status.is_live())
            .collect())
    }

    /// Σ amount of live children
    pub fn live_children_amount(&self, parent: LotId) -> Result<Decimal> {
        Ok(self
            .live_children(parent)?
            .iter()
            .map(|lot| lot.amount)
            .sum())
    }

    /// Lots extracted from a stock position, oldest first
    pub fn extractions(&self, stock: StockId) -> Result<Vec<Lot>> {
        let mut lots = self
            .storage
            .extraction_ids(stock)?
            .into_iter()
            .map(|id| self.storage.get_lot(id))
            .collect::<Result<Vec<_>>>()?;
        lots.sort_by_key(|lot| (lot.created_at, lot.id));
        Ok(lots)
    }

    /// Σ amount of live extractions
    pub fn live_extracted_amount(&self, stock: StockId) -> Result<Decimal> {
        Ok(self
            .extractions(stock)?
            .iter()
            .filter(|lot| lot.status.is_live())
            .map(|lot| lot.amount)
            .sum())
    }

    /// Ancestors of `id`, nearest first.
    ///
    /// A parent link pointing back into the chain is reported as drift.
    pub fn ancestors(&self, id: LotId) -> Result<Vec<Lot>> {
        let mut seen = HashSet::from([id]);
        let mut ancestors = Vec::new();
        let mut current = self.get(id)?;

        while let Some(parent_id) = current.parent_lot() {
            if !seen.insert(parent_id) {
                return Err(Error::ReconciliationDrift(format!(
                    "lineage cycle through lot {}",
                    parent_id
                )));
            }
            let parent = self.get(parent_id)?;
            ancestors.push(parent.clone());
            current = parent;
        }

        Ok(ancestors)
    }

    /// Root of the tree `id` belongs to
    pub fn root(&self, id: LotId) -> Result<Lot> {
        match self.ancestors(id)?.pop() {
            Some(root) => Ok(root),
            None => self.get(id),
        }
    }

    /// All descendants of `id`, breadth first
    pub fn descendants(&self, id: LotId) -> Result<Vec<Lot>> {
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);
        let mut descendants = Vec::new();

        while let Some(next) = queue.pop_front() {
            for child in self.children(next)? {
                if !seen.insert(child.id) {
                    return Err(Error::ReconciliationDrift(format!(
                        "lineage cycle through lot {}",
                        child.id
                    )));
                }
                queue.push_back(child.id);
                descendants.push(child);
            }
        }

        Ok(descendants)
    }

    /// Whether making `parent` the parent of `child` would close a cycle
    pub fn would_create_cycle(&self, child: LotId, parent: LotId) -> Result<bool> {
        if child == parent {
            return Ok(true);
        }
        Ok(self.ancestors(parent)?.iter().any(|lot| lot.id == child))
    }

    /// Write `child` under `parent` inside `txn`.
    ///
    /// The caller holds the lock on `parent`. Refuses with drift if the
    /// child would push the live children above the parent amount.
    pub fn attach_child(&self, txn: &Txn<'_>, parent: &Lot, child: &Lot) -> Result<()> {
        if child.lineage != Lineage::ParentLot(parent.id) {
            return Err(Error::MalformedParams(format!(
                "lot {} is not declared as a child of {}",
                child.id, parent.id
            )));
        }

        let claimed = self.live_children_amount(parent.id)? + child.amount;
        if claimed > parent.amount {
            return Err(Error::ReconciliationDrift(format!(
                "children of lot {} would claim {} out of {}",
                parent.id, claimed, parent.amount
            )));
        }

        txn.put_lot(child)?;
        txn.link_child(parent.id, child.id)?;
        Ok(())
    }

    /// Move `child` under `new_parent` inside `txn`.
    ///
    /// The caller holds the locks on `new_parent` then `child`. Returns the
    /// updated child; the caller records the change in the event log.
    pub fn relink(&self, txn: &Txn<'_>, new_parent: &Lot, child: &Lot) -> Result<Lot> {
        if self.would_create_cycle(child.id, new_parent.id)? {
            return Err(Error::ReconciliationDrift(format!(
                "linking lot {} under {} would create a cycle",
                child.id, new_parent.id
            )));
        }

        if let Some(old_parent) = child.parent_lot() {
            txn.unlink_child(old_parent, child.id)?;
        }

        let mut moved = child.clone();
        moved.lineage = Lineage::ParentLot(new_parent.id);
        moved.updated_at = chrono::Utc::now();
        self.attach_child(txn, new_parent, &moved)?;

        Ok(moved)
    }
}
