//! Lot state machine
//!
//! The single authority for lot status transitions:
//!
//! ```text
//! DRAFT ──submit──▶ PENDING ──accept──▶ ACCEPTED
//!   │                  ├─────freeze───▶ FROZEN
//!   │                  └─────reject───▶ REJECTED
//!   └──────delete────▶ DELETED
//! ```
//!
//! Every operation runs in one storage transaction: the lot row is locked
//! first, then any parent or stock position it touches, and the documenting
//! events are written before commit. A refused operation drops the
//! transaction, leaving nothing behind.

use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt::Display;
use std::sync::Arc;

use crate::collaborators::{ReferenceData, SanityChecker};
use crate::events::{payload, EventLog, Payload};
use crate::lineage::LineageStore;
use crate::metrics::Metrics;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::quantity;
use crate::stock::StockLedger;
use crate::storage::Storage;
use crate::types::{
    traceability_code, BiofuelCode, DeliveryType, DepotId, Emissions, EntityId, Event, EventType,
    Lineage, Lot, LotId, LotStatus, Party, StockPosition, Unit,
};
use crate::{Error, Result};

/// Attributes of a new draft lot
#[derive(Debug, Clone, PartialEq)]
pub struct NewLot {
    /// Declaration period, YYYYMM
    pub period: u32,
    /// Declared quantity
    pub amount: Decimal,
    /// Unit of `amount`
    pub unit: Unit,
    /// Biofuel
    pub biofuel: BiofuelCode,
    /// Feedstock code
    pub feedstock: Option<String>,
    /// Production country
    pub production_country: Option<String>,
    /// Emission figures
    pub emissions: Option<Emissions>,
    /// Supplier side
    pub supplier: Party,
    /// Client side; `None` for exports or releases without counterpart
    pub client: Option<Party>,
    /// Delivery depot
    pub delivery_depot: Option<DepotId>,
    /// Final use declared for a lot without client
    pub declared_delivery: Option<DeliveryType>,
}

impl NewLot {
    /// Volume-denominated lot with no client
    pub fn new(period: u32, amount: Decimal, biofuel: BiofuelCode, supplier: Party) -> Self {
        Self {
            period,
            amount,
            unit: Unit::Volume,
            biofuel,
            feedstock: None,
            production_country: None,
            emissions: None,
            supplier,
            client: None,
            delivery_depot: None,
            declared_delivery: None,
        }
    }

    /// Set the client
    pub fn with_client(mut self, client: Party) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the delivery depot
    pub fn with_depot(mut self, depot: DepotId) -> Self {
        self.delivery_depot = Some(depot);
        self
    }

    /// Declare the final use of a lot without client
    pub fn with_declared_delivery(mut self, delivery: DeliveryType) -> Self {
        self.declared_delivery = Some(delivery);
        self
    }

    /// Express `amount` in another unit
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Set the production country
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.production_country = Some(country.into());
        self
    }
}

/// Patch applied to a draft; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LotUpdate {
    /// New canonical amount
    pub amount: Option<Decimal>,
    /// New client (or none)
    pub client: Option<Option<Party>>,
    /// New delivery depot (or none)
    pub delivery_depot: Option<Option<DepotId>>,
    /// New declared final use (or none)
    pub declared_delivery: Option<Option<DeliveryType>>,
    /// New feedstock (or none)
    pub feedstock: Option<Option<String>>,
    /// New emission figures (or none)
    pub emissions: Option<Option<Emissions>>,
}

/// Parameters required by some outcomes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeParams {
    /// Downstream party for TRADING / PROCESSING
    pub downstream: Option<Party>,
    /// Depot for STOCK (falls back to the lot's delivery depot)
    pub depot: Option<DepotId>,
}

impl OutcomeParams {
    /// No parameters
    pub fn none() -> Self {
        Self::default()
    }

    /// Downstream party for a forwarded lot
    pub fn downstream(party: Party) -> Self {
        Self {
            downstream: Some(party),
            depot: None,
        }
    }

    /// Depot for a stored lot
    pub fn depot(depot: DepotId) -> Self {
        Self {
            downstream: None,
            depot: Some(depot),
        }
    }
}

/// Result of a committed transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The lot after the transition
    pub lot: Lot,
    /// Child lots created by it
    pub children: Vec<Lot>,
    /// Stock position opened or touched by it
    pub stock: Option<StockPosition>,
}

impl Transition {
    fn of(lot: Lot) -> Self {
        Self {
            lot,
            children: Vec::new(),
            stock: None,
        }
    }
}

/// Lot state machine
#[derive(Clone)]
pub struct LotStateMachine {
    storage: Arc<Storage>,
    lineage: LineageStore,
    events: EventLog,
    stock: StockLedger,
    reference: Arc<dyn ReferenceData>,
    sanity: Arc<dyn SanityChecker>,
    notifier: Arc<dyn Notifier>,
    metrics: Metrics,
}

impl LotStateMachine {
    /// Assemble the state machine from its stores and collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        lineage: LineageStore,
        events: EventLog,
        stock: StockLedger,
        reference: Arc<dyn ReferenceData>,
        sanity: Arc<dyn SanityChecker>,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            lineage,
            events,
            stock,
            reference,
            sanity,
            notifier,
            metrics,
        }
    }

    /// Get lot by ID
    pub fn get(&self, lot_id: LotId) -> Result<Lot> {
        self.lineage.get(lot_id)
    }

    /// Event history of a lot
    pub fn history(&self, lot_id: LotId) -> Result<Vec<Event>> {
        self.events.history(lot_id)
    }

    /// Declare a new DRAFT lot owned by `acting`
    pub fn create_draft(&self, acting: &EntityId, new: NewLot) -> Result<Lot> {
        self.reference.entity(acting)?;
        validate_period(new.period)?;
        if new.amount <= Decimal::ZERO {
            return Err(Error::MalformedParams(format!(
                "amount must be positive, got {}",
                new.amount
            )));
        }

        let biofuel = self.reference.biofuel(&new.biofuel)?;
        let amount = quantity::to_canonical(new.amount, new.unit, &biofuel)?;
        if amount <= Decimal::ZERO {
            return Err(Error::MalformedParams(format!(
                "{} {:?} rounds to a zero volume",
                new.amount, new.unit
            )));
        }

        self.resolve_party(&new.supplier)?;
        if let Some(client) = &new.client {
            self.resolve_party(client)?;
        }
        if let Some(depot) = &new.delivery_depot {
            self.reference.depot(depot)?;
        }
        if let Some(delivery) = new.declared_delivery {
            validate_final_use(delivery)?;
        }

        let now = Utc::now();
        let id = LotId::new();
        let lot = Lot {
            id,
            traceability_code: traceability_code(new.period, new.production_country.as_deref(), id),
            period: new.period,
            status: LotStatus::Draft,
            delivery_type: DeliveryType::Unknown,
            declared_delivery: new.declared_delivery,
            amount,
            biofuel: new.biofuel,
            feedstock: new.feedstock,
            production_country: new.production_country,
            emissions: new.emissions,
            supplier: new.supplier,
            client: new.client,
            owner: acting.clone(),
            delivery_depot: new.delivery_depot,
            lineage: Lineage::Root,
            warnings: vec![],
            created_at: now,
            updated_at: now,
        };

        let txn = self.storage.begin();
        txn.put_lot(&lot)?;
        self.events.append(
            &txn,
            lot.id,
            EventType::Created,
            acting,
            payload([
                ("amount", lot.amount.to_string()),
                ("declared", format!("{} {:?}", new.amount, new.unit)),
                ("supplier", lot.supplier.to_string()),
            ]),
        )?;
        txn.commit()?;

        self.metrics.record_transition(EventType::Created);
        tracing::info!(lot_id = %lot.id, code = %lot.traceability_code, owner = %acting, "Draft created");

        Ok(lot)
    }

    /// Amend a DRAFT lot
    pub fn update_draft(&self, lot_id: LotId, acting: &EntityId, update: LotUpdate) -> Result<Transition> {
        let txn = self.storage.begin();
        let mut lot = txn.lock_lot(lot_id)?;
        ensure_status(&lot, LotStatus::Draft, "update")?;
        ensure_owner(&lot, acting)?;

        let mut diff = Payload::new();
        let mut stock = None;

        if let Some(amount) = update.amount.filter(|a| *a != lot.amount) {
            if amount <= Decimal::ZERO {
                return Err(Error::MalformedParams(format!(
                    "amount must be positive, got {}",
                    amount
                )));
            }
            match lot.lineage {
                Lineage::ParentLot(parent) => {
                    return Err(Error::MalformedParams(format!(
                        "amount of lot {} follows its parent {}",
                        lot_id, parent
                    )));
                }
                Lineage::ParentStock(position) => {
                    let delta = amount - lot.amount;
                    stock = Some(if delta > Decimal::ZERO {
                        self.stock.debit(&txn, position, delta)?
                    } else {
                        self.stock.credit(&txn, position, -delta)?
                    });
                }
                Lineage::Root => {}
            }
            diff.insert("amount".into(), change(&lot.amount, &amount));
            lot.amount = amount;
        }

        if let Some(client) = update.client.filter(|c| *c != lot.client) {
            if let Some(party) = &client {
                self.resolve_party(party)?;
            }
            diff.insert("client".into(), change_opt(&lot.client, &client));
            lot.client = client;
        }

        if let Some(depot) = update.delivery_depot.filter(|d| *d != lot.delivery_depot) {
            if let Some(id) = &depot {
                self.reference.depot(id)?;
            }
            diff.insert("delivery_depot".into(), change_opt(&lot.delivery_depot, &depot));
            lot.delivery_depot = depot;
        }

        if let Some(declared) = update.declared_delivery.filter(|d| *d != lot.declared_delivery) {
            if let Some(delivery) = declared {
                validate_final_use(delivery)?;
            }
            diff.insert(
                "declared_delivery".into(),
                change_opt(&lot.declared_delivery, &declared),
            );
            lot.declared_delivery = declared;
        }

        if let Some(feedstock) = update.feedstock.filter(|f| *f != lot.feedstock) {
            diff.insert("feedstock".into(), change_opt(&lot.feedstock, &feedstock));
            lot.feedstock = feedstock;
        }

        if let Some(emissions) = update.emissions.filter(|e| *e != lot.emissions) {
            diff.insert(
                "emissions".into(),
                format!("{} -> {}", describe_emissions(&lot.emissions), describe_emissions(&emissions)),
            );
            lot.emissions = emissions;
        }

        if diff.is_empty() {
            return Ok(Transition::of(lot));
        }

        lot.updated_at = Utc::now();
        txn.put_lot(&lot)?;
        self.events
            .append(&txn, lot.id, EventType::Updated, acting, diff)?;
        txn.commit()?;

        self.metrics.record_transition(EventType::Updated);
        tracing::info!(lot_id = %lot_id, actor = %acting, "Draft updated");

        Ok(Transition {
            lot,
            children: vec![],
            stock,
        })
    }

    /// DRAFT → PENDING, then resolve the deterministic outcome.
    ///
    /// - no registered client (none, or an unregistered name): ACCEPTED with
    ///   the declared final use, which is then required;
    /// - pure pass-through (acting is neither supplier nor client): the lot
    ///   becomes the ACCEPTED/TRADING leg with client = acting, and one
    ///   PENDING child carries the same amount on to the original client;
    /// - otherwise the lot waits in PENDING for its client.
    pub fn submit(&self, lot_id: LotId, acting: &EntityId) -> Result<Transition> {
        let txn = self.storage.begin();
        let mut lot = txn.lock_lot(lot_id)?;
        ensure_status(&lot, LotStatus::Draft, "submit")?;
        ensure_owner(&lot, acting)?;

        let biofuel = self.reference.biofuel(&lot.biofuel)?;
        let snapshot = lot.quantity(&biofuel)?;
        let (blocking, warnings): (Vec<_>, Vec<_>) = self
            .sanity
            .check(&lot, &snapshot)
            .into_iter()
            .partition(|issue| issue.is_blocking);

        if !blocking.is_empty() {
            tracing::warn!(
                lot_id = %lot_id,
                blocking = blocking.len(),
                warnings = warnings.len(),
                "Submission refused by sanity checks"
            );
            let mut issues = blocking;
            issues.extend(warnings);
            return Err(Error::SanityCheckFailed(issues));
        }

        let now = Utc::now();
        lot.warnings = warnings;
        lot.status = LotStatus::Pending;
        lot.updated_at = now;

        let mut logged = vec![EventType::Submitted];
        self.events.append(
            &txn,
            lot.id,
            EventType::Submitted,
            acting,
            payload([
                ("status", "DRAFT -> PENDING".to_string()),
                ("warnings", lot.warnings.len().to_string()),
            ]),
        )?;

        let mut children = Vec::new();
        match lot.client_entity().cloned() {
            None => {
                let outcome = lot
                    .declared_delivery
                    .filter(DeliveryType::is_final_use)
                    .ok_or_else(|| {
                        Error::MalformedParams(format!(
                            "lot {} has no registered client and no declared final use",
                            lot_id
                        ))
                    })?;
                lot.status = LotStatus::Accepted;
                lot.delivery_type = outcome;
                self.events.append(
                    &txn,
                    lot.id,
                    EventType::Accepted,
                    acting,
                    payload([
                        ("status", "PENDING -> ACCEPTED".to_string()),
                        ("delivery_type", outcome.to_string()),
                    ]),
                )?;
                logged.push(EventType::Accepted);
            }
            Some(client) if !lot.supplier.is_entity(acting) && &client != acting => {
                lot.client = Some(Party::Known(acting.clone()));
                lot.status = LotStatus::Accepted;
                lot.delivery_type = DeliveryType::Trading;

                let child = derive_child(&lot, acting, Party::Known(client.clone()));
                self.lineage.attach_child(&txn, &lot, &child)?;
                self.events.append(
                    &txn,
                    child.id,
                    EventType::Created,
                    acting,
                    payload([
                        ("parent_lot", lot.id.to_string()),
                        ("amount", child.amount.to_string()),
                    ]),
                )?;
                self.events.append(
                    &txn,
                    lot.id,
                    EventType::Accepted,
                    acting,
                    payload([
                        ("status", "PENDING -> ACCEPTED".to_string()),
                        ("delivery_type", DeliveryType::Trading.to_string()),
                        ("client", format!("{} -> {}", client, acting)),
                        ("child", child.id.to_string()),
                    ]),
                )?;
                logged.extend([EventType::Created, EventType::Accepted]);
                children.push(child);
            }
            Some(_) => {}
        }

        txn.put_lot(&lot)?;
        txn.commit()?;

        for event_type in logged {
            self.metrics.record_transition(event_type);
        }
        tracing::info!(
            lot_id = %lot_id,
            status = %lot.status,
            delivery_type = %lot.delivery_type,
            children = children.len(),
            "Lot submitted"
        );

        match lot.status {
            LotStatus::Pending => {
                self.notify(NotificationKind::Submitted, &lot, lot.client_entity().cloned(), acting)
            }
            _ => self.notify(NotificationKind::Accepted, &lot, lot.supplier.entity().cloned(), acting),
        }
        for child in &children {
            self.notify(NotificationKind::Submitted, child, child.client_entity().cloned(), acting);
        }

        Ok(Transition {
            lot,
            children,
            stock: None,
        })
    }

    /// PENDING → ACCEPTED with the given outcome
    pub fn accept(
        &self,
        lot_id: LotId,
        acting: &EntityId,
        outcome: DeliveryType,
        params: OutcomeParams,
    ) -> Result<Transition> {
        self.settle(lot_id, acting, outcome, params, LotStatus::Accepted)
    }

    /// PENDING → FROZEN with the given outcome (declaration period closed)
    pub fn freeze(
        &self,
        lot_id: LotId,
        acting: &EntityId,
        outcome: DeliveryType,
        params: OutcomeParams,
    ) -> Result<Transition> {
        self.settle(lot_id, acting, outcome, params, LotStatus::Frozen)
    }

    fn settle(
        &self,
        lot_id: LotId,
        acting: &EntityId,
        outcome: DeliveryType,
        params: OutcomeParams,
        target: LotStatus,
    ) -> Result<Transition> {
        let (operation, event_type, kind) = match target {
            LotStatus::Frozen => ("freeze", EventType::Frozen, NotificationKind::Frozen),
            _ => ("accept", EventType::Accepted, NotificationKind::Accepted),
        };

        let txn = self.storage.begin();
        let mut lot = txn.lock_lot(lot_id)?;
        ensure_status(&lot, LotStatus::Pending, operation)?;
        ensure_client(&lot, acting)?;
        if outcome == DeliveryType::Unknown {
            return Err(Error::MalformedParams(format!(
                "cannot {} lot {} without an outcome",
                operation, lot_id
            )));
        }

        lot.status = target;
        lot.delivery_type = outcome;
        lot.updated_at = Utc::now();

        let mut details = payload([
            ("status", format!("PENDING -> {}", target)),
            ("delivery_type", outcome.to_string()),
        ]);
        let mut children = Vec::new();
        let mut stock = None;
        let mut position_created = false;

        match outcome {
            DeliveryType::Stock => {
                let depot = params
                    .depot
                    .or_else(|| lot.delivery_depot.clone())
                    .ok_or(Error::MissingDepot(lot_id))?;
                self.reference.depot(&depot).map_err(|e| match e {
                    Error::NotFound(_) => Error::MissingDepot(lot_id),
                    other => other,
                })?;
                lot.delivery_depot = Some(depot.clone());

                let (position, created) = self.stock.open_position(&txn, &lot, depot, acting.clone())?;
                details.insert("stock".into(), position.id.to_string());
                position_created = created;
                stock = Some(position);
            }
            DeliveryType::Trading | DeliveryType::Processing => {
                let downstream = params.downstream.ok_or_else(|| {
                    Error::MalformedParams(format!(
                        "{} requires a downstream entity or unknown client name",
                        outcome
                    ))
                })?;
                self.resolve_party(&downstream)?;

                let child = derive_child(&lot, acting, downstream);
                self.lineage.attach_child(&txn, &lot, &child)?;
                self.events.append(
                    &txn,
                    child.id,
                    EventType::Created,
                    acting,
                    payload([
                        ("parent_lot", lot.id.to_string()),
                        ("amount", child.amount.to_string()),
                    ]),
                )?;
                if child.status == LotStatus::Accepted {
                    self.events.append(
                        &txn,
                        child.id,
                        EventType::Accepted,
                        acting,
                        payload([
                            ("status", "PENDING -> ACCEPTED".to_string()),
                            ("reason", "client not registered".to_string()),
                        ]),
                    )?;
                }
                details.insert("child".into(), child.id.to_string());
                children.push(child);
            }
            _ => {}
        }

        txn.put_lot(&lot)?;
        self.events.append(&txn, lot.id, event_type, acting, details)?;
        txn.commit()?;

        self.metrics.record_transition(event_type);
        for child in &children {
            self.metrics.record_transition(EventType::Created);
            if child.status == LotStatus::Accepted {
                self.metrics.record_transition(EventType::Accepted);
            }
        }
        if position_created {
            self.metrics.record_position_created();
        }
        tracing::info!(
            lot_id = %lot_id,
            status = %lot.status,
            delivery_type = %outcome,
            children = children.len(),
            "Lot settled"
        );

        self.notify(kind, &lot, lot.supplier.entity().cloned(), acting);
        for child in children.iter().filter(|c| c.status == LotStatus::Pending) {
            self.notify(NotificationKind::Submitted, child, child.client_entity().cloned(), acting);
        }

        Ok(Transition {
            lot,
            children,
            stock,
        })
    }

    /// PENDING → REJECTED by the client; restocks an extracted lot
    pub fn reject(&self, lot_id: LotId, acting: &EntityId, comment: &str) -> Result<Transition> {
        let txn = self.storage.begin();
        let mut lot = txn.lock_lot(lot_id)?;
        ensure_status(&lot, LotStatus::Pending, "reject")?;
        ensure_client(&lot, acting)?;

        lot.status = LotStatus::Rejected;
        lot.updated_at = Utc::now();

        let stock = match lot.parent_stock() {
            Some(position) => Some(self.stock.credit(&txn, position, lot.amount)?),
            None => None,
        };

        txn.put_lot(&lot)?;
        self.events.append(
            &txn,
            lot.id,
            EventType::Rejected,
            acting,
            payload([
                ("status", "PENDING -> REJECTED".to_string()),
                ("comment", comment.to_string()),
            ]),
        )?;
        txn.commit()?;

        self.metrics.record_transition(EventType::Rejected);
        tracing::info!(lot_id = %lot_id, actor = %acting, "Lot rejected");

        Ok(Transition {
            lot,
            children: vec![],
            stock,
        })
    }

    /// DRAFT → DELETED by the owner; restocks an extracted lot
    pub fn delete(&self, lot_id: LotId, acting: &EntityId) -> Result<Transition> {
        let txn = self.storage.begin();
        let mut lot = txn.lock_lot(lot_id)?;
        ensure_status(&lot, LotStatus::Draft, "delete")?;
        ensure_owner(&lot, acting)?;

        lot.status = LotStatus::Deleted;
        lot.updated_at = Utc::now();

        let stock = match lot.parent_stock() {
            Some(position) => Some(self.stock.credit(&txn, position, lot.amount)?),
            None => None,
        };

        txn.put_lot(&lot)?;
        self.events.append(
            &txn,
            lot.id,
            EventType::Deleted,
            acting,
            payload([("status", "DRAFT -> DELETED")]),
        )?;
        txn.commit()?;

        self.metrics.record_transition(EventType::Deleted);
        tracing::info!(lot_id = %lot_id, actor = %acting, "Lot deleted");

        Ok(Transition {
            lot,
            children: vec![],
            stock,
        })
    }

    fn resolve_party(&self, party: &Party) -> Result<()> {
        match party {
            Party::Known(id) => self.reference.entity(id).map(|_| ()),
            Party::Unknown(name) if name.trim().is_empty() => Err(Error::MalformedParams(
                "unknown party name must not be empty".to_string(),
            )),
            Party::Unknown(_) => Ok(()),
        }
    }

    fn notify(
        &self,
        kind: NotificationKind,
        lot: &Lot,
        recipient: Option<EntityId>,
        actor: &EntityId,
    ) {
        self.notifier.notify(Notification {
            kind,
            lot_id: lot.id,
            traceability_code: lot.traceability_code.clone(),
            recipient,
            actor: actor.clone(),
            at: lot.updated_at,
        });
    }
}

/// Equal-amount child forwarded by `acting` to `client`.
///
/// PENDING when the client is a registered entity. An unregistered client can
/// never act on the platform, so its child is ACCEPTED on creation with an
/// UNKNOWN outcome.
fn derive_child(parent: &Lot, acting: &EntityId, client: Party) -> Lot {
    let id = LotId::new();
    let now = Utc::now();
    let status = match client {
        Party::Known(_) => LotStatus::Pending,
        Party::Unknown(_) => LotStatus::Accepted,
    };
    Lot {
        id,
        traceability_code: traceability_code(parent.period, parent.production_country.as_deref(), id),
        period: parent.period,
        status,
        delivery_type: DeliveryType::Unknown,
        declared_delivery: None,
        amount: parent.amount,
        biofuel: parent.biofuel.clone(),
        feedstock: parent.feedstock.clone(),
        production_country: parent.production_country.clone(),
        emissions: parent.emissions.clone(),
        supplier: Party::Known(acting.clone()),
        client: Some(client),
        owner: acting.clone(),
        delivery_depot: None,
        lineage: Lineage::ParentLot(parent.id),
        warnings: vec![],
        created_at: now,
        updated_at: now,
    }
}

fn ensure_status(lot: &Lot, expected: LotStatus, operation: &'static str) -> Result<()> {
    if lot.status != expected {
        tracing::warn!(lot_id = %lot.id, status = %lot.status, operation, "Invalid status");
        return Err(Error::InvalidStatus {
            lot: lot.id,
            status: lot.status,
            operation,
        });
    }
    Ok(())
}

fn ensure_owner(lot: &Lot, acting: &EntityId) -> Result<()> {
    if &lot.owner != acting {
        tracing::warn!(lot_id = %lot.id, actor = %acting, "Not the lot owner");
        return Err(Error::Forbidden(format!(
            "{} is not the owner of lot {}",
            acting, lot.id
        )));
    }
    Ok(())
}

fn ensure_client(lot: &Lot, acting: &EntityId) -> Result<()> {
    if lot.client_entity() != Some(acting) {
        tracing::warn!(lot_id = %lot.id, actor = %acting, "Not the lot client");
        return Err(Error::Forbidden(format!(
            "{} is not the client of lot {}",
            acting, lot.id
        )));
    }
    Ok(())
}

fn validate_period(period: u32) -> Result<()> {
    let month = period % 100;
    if period < 2000_01 || !(1..=12).contains(&month) {
        return Err(Error::MalformedParams(format!(
            "period {} is not a valid YYYYMM",
            period
        )));
    }
    Ok(())
}

fn validate_final_use(delivery: DeliveryType) -> Result<()> {
    if !delivery.is_final_use() {
        return Err(Error::MalformedParams(format!(
            "{} is not a final use",
            delivery
        )));
    }
    Ok(())
}

fn change<T: Display>(old: &T, new: &T) -> String {
    format!("{} -> {}", old, new)
}

fn change_opt<T: Display>(old: &Option<T>, new: &Option<T>) -> String {
    let show = |v: &Option<T>| v.as_ref().map_or_else(|| "none".to_string(), T::to_string);
    format!("{} -> {}", show(old), show(new))
}

fn describe_emissions(emissions: &Option<Emissions>) -> String {
    match emissions {
        Some(e) => format!("{} gCO2eq/MJ ({}%)", e.total, e.reduction),
        None => "none".to_string(),
    }
}
