//! Stock ledger
//!
//! A stock position is opened once, when a lot is accepted as STOCK, and
//! drained by extractions. `remaining_amount` is only written here, always
//! under the position's row lock, so concurrent extractions serialize and the
//! second one sees the first one's debit.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::events::{payload, EventLog};
use crate::lineage::LineageStore;
use crate::metrics::Metrics;
use crate::storage::{Storage, Txn};
use crate::types::{
    current_period, traceability_code, DeliveryType, DepotId, EntityId, EventType, Lineage, Lot,
    LotId, LotStatus, Party, StockId, StockPosition,
};
use crate::{Error, Result};

/// Expected versus recorded remaining amount of a position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDrift {
    /// Position
    pub position: StockId,
    /// `initial_amount − Σ(live extractions)`
    pub expected: Decimal,
    /// Stored `remaining_amount`
    pub actual: Decimal,
    /// `actual − expected`
    pub drift: Decimal,
}

impl StockDrift {
    /// Whether the drift exceeds `epsilon`
    pub fn exceeds(&self, epsilon: Decimal) -> bool {
        self.drift.abs() > epsilon
    }
}

/// Stock ledger
#[derive(Clone)]
pub struct StockLedger {
    storage: Arc<Storage>,
    lineage: LineageStore,
    events: EventLog,
    metrics: Metrics,
}

impl StockLedger {
    /// Create stock ledger
    pub fn new(
        storage: Arc<Storage>,
        lineage: LineageStore,
        events: EventLog,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            lineage,
            events,
            metrics,
        }
    }

    /// Get position by ID
    pub fn get(&self, id: StockId) -> Result<StockPosition> {
        self.storage.get_stock(id)
    }

    /// Position opened by `origin`, if any
    pub fn position_for(&self, origin: LotId) -> Result<Option<StockPosition>> {
        match self.storage.stock_for_origin(origin)? {
            Some(id) => self.get(id).map(Some),
            None => Ok(None),
        }
    }

    /// Every position
    pub fn positions(&self) -> Result<Vec<StockPosition>> {
        self.storage.scan_stocks()
    }

    /// Open the position for a lot accepted as STOCK.
    ///
    /// Idempotent: a second call for the same origin returns the position
    /// created by the first.
    pub fn create_position(&self, origin: LotId) -> Result<StockPosition> {
        let txn = self.storage.begin();
        let lot = txn.lock_lot(origin)?;

        if !matches!(lot.status, LotStatus::Accepted | LotStatus::Frozen) {
            return Err(Error::InvalidStatus {
                lot: origin,
                status: lot.status,
                operation: "open a stock position for",
            });
        }
        if lot.delivery_type != DeliveryType::Stock {
            return Err(Error::MalformedParams(format!(
                "lot {} was delivered as {}, not STOCK",
                origin, lot.delivery_type
            )));
        }
        let depot = lot.delivery_depot.clone().ok_or(Error::MissingDepot(origin))?;
        let owner = lot
            .client_entity()
            .cloned()
            .ok_or_else(|| Error::Forbidden(format!("lot {} has no registered client", origin)))?;

        let (position, created) = self.open_position(&txn, &lot, depot, owner)?;
        txn.commit()?;

        if created {
            self.metrics.record_position_created();
        }
        Ok(position)
    }

    /// Open (or find) the position for `lot` inside `txn`.
    ///
    /// The caller holds the lock on `lot`. Returns the position and whether
    /// this call created it.
    pub fn open_position(
        &self,
        txn: &Txn<'_>,
        lot: &Lot,
        depot: DepotId,
        owner: EntityId,
    ) -> Result<(StockPosition, bool)> {
        if let Some(existing) = txn.lock_origin(lot.id)? {
            tracing::debug!(lot_id = %lot.id, stock_id = %existing, "Stock position already open");
            return Ok((txn.lock_stock(existing)?, false));
        }

        let now = Utc::now();
        let position = StockPosition {
            id: StockId::new(),
            origin_lot: lot.id,
            depot,
            owner,
            biofuel: lot.biofuel.clone(),
            initial_amount: lot.amount,
            remaining_amount: lot.amount,
            created_at: now,
            updated_at: now,
        };

        txn.put_stock(&position)?;
        txn.put_origin(lot.id, position.id)?;

        tracing::info!(
            lot_id = %lot.id,
            stock_id = %position.id,
            depot = %position.depot,
            amount = %position.initial_amount,
            "Stock position opened"
        );

        Ok((position, true))
    }

    /// Extract `amount` from a position into a new DRAFT lot.
    ///
    /// The new lot belongs to the position owner, carries the origin lot's
    /// attributes and has the position as parent.
    pub fn extract(&self, position_id: StockId, amount: Decimal, acting: &EntityId) -> Result<Lot> {
        if amount <= Decimal::ZERO {
            return Err(Error::MalformedParams(format!(
                "extracted amount must be positive, got {}",
                amount
            )));
        }

        let txn = self.storage.begin();
        let mut position = txn.lock_stock(position_id)?;

        if &position.owner != acting {
            tracing::warn!(stock_id = %position_id, actor = %acting, "Extraction by non-owner refused");
            return Err(Error::Forbidden(format!(
                "{} does not own stock position {}",
                acting, position_id
            )));
        }
        if amount > position.remaining_amount {
            self.metrics.record_extraction_refused();
            tracing::warn!(
                stock_id = %position_id,
                requested = %amount,
                remaining = %position.remaining_amount,
                "Extraction refused"
            );
            return Err(Error::InsufficientStock {
                position: position_id,
                requested: amount,
                remaining: position.remaining_amount,
            });
        }

        let origin = self.storage.get_lot(position.origin_lot)?;
        let now = Utc::now();
        let id = LotId::new();
        let period = current_period();
        let lot = Lot {
            id,
            traceability_code: traceability_code(period, origin.production_country.as_deref(), id),
            period,
            status: LotStatus::Draft,
            delivery_type: DeliveryType::Unknown,
            declared_delivery: None,
            amount,
            biofuel: position.biofuel.clone(),
            feedstock: origin.feedstock.clone(),
            production_country: origin.production_country.clone(),
            emissions: origin.emissions.clone(),
            supplier: Party::Known(position.owner.clone()),
            client: None,
            owner: position.owner.clone(),
            delivery_depot: Some(position.depot.clone()),
            lineage: Lineage::ParentStock(position_id),
            warnings: vec![],
            created_at: now,
            updated_at: now,
        };

        position.remaining_amount -= amount;
        position.updated_at = now;

        txn.put_lot(&lot)?;
        txn.link_extraction(position_id, lot.id)?;
        txn.put_stock(&position)?;
        self.events.append(
            &txn,
            lot.id,
            EventType::Created,
            acting,
            payload([
                ("parent_stock", position_id.to_string()),
                ("amount", amount.to_string()),
            ]),
        )?;
        txn.commit()?;

        self.metrics.record_extraction(amount);
        self.metrics.record_transition(EventType::Created);
        tracing::info!(
            stock_id = %position_id,
            lot_id = %lot.id,
            amount = %amount,
            remaining = %position.remaining_amount,
            "Stock extracted"
        );

        Ok(lot)
    }

    /// Take `amount` out of a position inside `txn`
    pub fn debit(&self, txn: &Txn<'_>, position_id: StockId, amount: Decimal) -> Result<StockPosition> {
        let mut position = txn.lock_stock(position_id)?;
        if amount > position.remaining_amount {
            self.metrics.record_extraction_refused();
            return Err(Error::InsufficientStock {
                position: position_id,
                requested: amount,
                remaining: position.remaining_amount,
            });
        }
        position.remaining_amount -= amount;
        position.updated_at = Utc::now();
        txn.put_stock(&position)?;
        Ok(position)
    }

    /// Return `amount` to a position inside `txn` (restock)
    pub fn credit(&self, txn: &Txn<'_>, position_id: StockId, amount: Decimal) -> Result<StockPosition> {
        let mut position = txn.lock_stock(position_id)?;
        let restocked = position.remaining_amount + amount;
        if restocked > position.initial_amount {
            return Err(Error::ReconciliationDrift(format!(
                "restocking {} into {} would exceed its initial amount {}",
                amount, position_id, position.initial_amount
            )));
        }
        position.remaining_amount = restocked;
        position.updated_at = Utc::now();
        txn.put_stock(&position)?;

        tracing::info!(stock_id = %position_id, amount = %amount, remaining = %restocked, "Stock restocked");
        Ok(position)
    }

    /// Compare the stored remaining amount with the one derived from
    /// extractions. Read-only.
    ///
    /// Both values are read under a shared lock on the position, which every
    /// writer of its extractions holds exclusively until commit.
    pub fn reconcile_expected(&self, position_id: StockId) -> Result<StockDrift> {
        let txn = self.storage.begin();
        let position = txn.share_stock(position_id)?;
        let expected = position.initial_amount - self.lineage.live_extracted_amount(position_id)?;
        drop(txn);
        Ok(StockDrift {
            position: position_id,
            expected,
            actual: position.remaining_amount,
            drift: position.remaining_amount - expected,
        })
    }

    /// Operator correction: set `remaining_amount` to the derived value.
    ///
    /// Re-derives under the position lock and refuses when the derived value
    /// falls outside `[0, initial_amount]`. Returns `None` without writing
    /// when the position already matches; otherwise logs UPDATED on the
    /// origin lot.
    pub fn correct_remaining(
        &self,
        position_id: StockId,
        operator: &EntityId,
    ) -> Result<Option<StockPosition>> {
        let txn = self.storage.begin();
        let mut position = txn.lock_stock(position_id)?;
        let expected = position.initial_amount - self.lineage.live_extracted_amount(position_id)?;

        if expected < Decimal::ZERO || expected > position.initial_amount {
            return Err(Error::ReconciliationDrift(format!(
                "derived remaining {} of {} is outside [0, {}]; manual resolution required",
                expected, position_id, position.initial_amount
            )));
        }
        if expected == position.remaining_amount {
            return Ok(None);
        }

        let previous = position.remaining_amount;
        position.remaining_amount = expected;
        position.updated_at = Utc::now();
        txn.put_stock(&position)?;
        self.events.append(
            &txn,
            position.origin_lot,
            EventType::Updated,
            operator,
            payload([
                ("stock", position_id.to_string()),
                ("remaining_amount", format!("{} -> {}", previous, expected)),
                ("reason", "reconciliation".to_string()),
            ]),
        )?;
        txn.commit()?;

        self.metrics.record_transition(EventType::Updated);
        tracing::warn!(
            stock_id = %position_id,
            previous = %previous,
            corrected = %expected,
            operator = %operator,
            "Stock remaining amount corrected"
        );

        Ok(Some(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BiofuelCode, Lineage};
    use crate::Config;
    use tempfile::TempDir;

    struct Fixture {
        stock: StockLedger,
        storage: Arc<Storage>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let lineage = LineageStore::new(storage.clone());
        let events = EventLog::new(storage.clone());
        let stock = StockLedger::new(storage.clone(), lineage, events, Metrics::new().unwrap());
        Fixture {
            stock,
            storage,
            _temp: temp,
        }
    }

    fn stored_lot(storage: &Storage, amount: i64) -> Lot {
        let id = LotId::new();
        let lot = Lot {
            id,
            traceability_code: traceability_code(202401, Some("FR"), id),
            period: 202401,
            status: LotStatus::Accepted,
            delivery_type: DeliveryType::Stock,
            declared_delivery: None,
            amount: Decimal::new(amount, 0),
            biofuel: BiofuelCode::new("ETH"),
            feedstock: Some("BEET".into()),
            production_country: Some("FR".into()),
            emissions: None,
            supplier: Party::known("PRODUCER"),
            client: Some(Party::known("OPERATOR")),
            owner: EntityId::new("PRODUCER"),
            delivery_depot: Some(DepotId::new("DEP-1")),
            lineage: Lineage::Root,
            warnings: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let txn = storage.begin();
        txn.put_lot(&lot).unwrap();
        txn.commit().unwrap();
        lot
    }

    #[test]
    fn test_create_position_is_idempotent() {
        let f = fixture();
        let lot = stored_lot(&f.storage, 1000);

        let first = f.stock.create_position(lot.id).unwrap();
        let second = f.stock.create_position(lot.id).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.initial_amount, Decimal::new(1000, 0));
        assert_eq!(first.owner, EntityId::new("OPERATOR"));
        assert_eq!(f.storage.get_stats().unwrap().total_stock_positions, 1);
    }

    #[test]
    fn test_extract_debits_and_refuses_overdraw() {
        let f = fixture();
        let lot = stored_lot(&f.storage, 1000);
        let position = f.stock.create_position(lot.id).unwrap();
        let operator = EntityId::new("OPERATOR");

        let extracted = f
            .stock
            .extract(position.id, Decimal::new(400, 0), &operator)
            .unwrap();
        assert_eq!(extracted.parent_stock(), Some(position.id));
        assert_eq!(extracted.status, LotStatus::Draft);
        assert_eq!(extracted.feedstock.as_deref(), Some("BEET"));
        assert_eq!(f.stock.get(position.id).unwrap().remaining_amount, Decimal::new(600, 0));

        let err = f
            .stock
            .extract(position.id, Decimal::new(700, 0), &operator)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientStock { .. }));
        assert_eq!(f.stock.get(position.id).unwrap().remaining_amount, Decimal::new(600, 0));
    }

    #[test]
    fn test_extract_requires_owner_and_positive_amount() {
        let f = fixture();
        let lot = stored_lot(&f.storage, 1000);
        let position = f.stock.create_position(lot.id).unwrap();

        let err = f
            .stock
            .extract(position.id, Decimal::new(1, 0), &EntityId::new("PRODUCER"))
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Forbidden);

        let err = f
            .stock
            .extract(position.id, Decimal::ZERO, &EntityId::new("OPERATOR"))
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::MalformedParams);
    }

    #[test]
    fn test_reconcile_and_correct() {
        let f = fixture();
        let lot = stored_lot(&f.storage, 1000);
        let position = f.stock.create_position(lot.id).unwrap();
        let operator = EntityId::new("OPERATOR");
        f.stock
            .extract(position.id, Decimal::new(250, 0), &operator)
            .unwrap();

        let clean = f.stock.reconcile_expected(position.id).unwrap();
        assert_eq!(clean.drift, Decimal::ZERO);

        // Simulate a lost debit
        let mut tampered = f.stock.get(position.id).unwrap();
        tampered.remaining_amount = Decimal::new(1000, 0);
        let txn = f.storage.begin();
        txn.put_stock(&tampered).unwrap();
        txn.commit().unwrap();

        let drift = f.stock.reconcile_expected(position.id).unwrap();
        assert_eq!(drift.expected, Decimal::new(750, 0));
        assert_eq!(drift.drift, Decimal::new(250, 0));
        assert!(drift.exceeds(Decimal::new(1, 1)));

        let checker = EntityId::new("reconciliation-checker");
        let corrected = f
            .stock
            .correct_remaining(position.id, &checker)
            .unwrap()
            .unwrap();
        assert_eq!(corrected.remaining_amount, Decimal::new(750, 0));
        assert_eq!(
            f.stock.reconcile_expected(position.id).unwrap().drift,
            Decimal::ZERO
        );

        // Already consistent: nothing written, no event
        let history = f.stock.events.history(lot.id).unwrap().len();
        assert!(f.stock.correct_remaining(position.id, &checker).unwrap().is_none());
        assert_eq!(f.stock.events.history(lot.id).unwrap().len(), history);
    }

    #[test]
    fn test_reconcile_waits_for_inflight_extraction() {
        let f = fixture();
        let lot = stored_lot(&f.storage, 1000);
        let position = f.stock.create_position(lot.id).unwrap();

        // Extraction half-way through its transaction: debited, linked, not committed
        let mut extracted = lot.clone();
        extracted.id = LotId::new();
        extracted.status = LotStatus::Draft;
        extracted.amount = Decimal::new(300, 0);
        extracted.lineage = Lineage::ParentStock(position.id);
        let txn = f.storage.begin();
        f.stock
            .debit(&txn, position.id, extracted.amount)
            .unwrap();
        txn.put_lot(&extracted).unwrap();
        txn.link_extraction(position.id, extracted.id).unwrap();

        let reader = {
            let stock = f.stock.clone();
            std::thread::spawn(move || stock.reconcile_expected(position.id))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!reader.is_finished());
        txn.commit().unwrap();

        let drift = reader.join().unwrap().unwrap();
        assert_eq!(drift.actual, Decimal::new(700, 0));
        assert_eq!(drift.expected, Decimal::new(700, 0));
        assert_eq!(drift.drift, Decimal::ZERO);
    }

    #[test]
    fn test_credit_cannot_exceed_initial() {
        let f = fixture();
        let lot = stored_lot(&f.storage, 100);
        let position = f.stock.create_position(lot.id).unwrap();

        let txn = f.storage.begin();
        let err = f.stock.credit(&txn, position.id, Decimal::ONE).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ReconciliationDrift);
    }
}
