//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::Utc;
use lot_ledger::collaborators::{InMemoryReferenceData, NoSanityIssues, SanityChecker};
use lot_ledger::machine::NewLot;
use lot_ledger::notify::{Notification, Notifier};
use lot_ledger::types::{
    traceability_code, Biofuel, BiofuelCode, Depot, DepotId, Entity, Lineage,
};
use lot_ledger::{
    Config, DeliveryType, EntityId, Lot, LotId, LotLedger, LotStatus, Party,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

pub const PERIOD: u32 = 202403;

/// Ledger on a fresh RocksDB directory; the directory lives as long as this
pub struct TestLedger {
    pub ledger: LotLedger,
    pub reference: Arc<InMemoryReferenceData>,
    pub notifications: Arc<RecordingNotifier>,
    _temp: TempDir,
}

impl std::ops::Deref for TestLedger {
    type Target = LotLedger;

    fn deref(&self) -> &LotLedger {
        &self.ledger
    }
}

/// Notifier keeping everything it receives
#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<Notification>>);

impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.0.lock().push(notification);
    }
}

pub fn eid(id: &str) -> EntityId {
    EntityId::new(id)
}

pub fn dec(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

pub fn reference_data() -> InMemoryReferenceData {
    let data = InMemoryReferenceData::new();
    for (id, name) in [
        ("PRODUCER", "Sucrerie du Nord"),
        ("TRADER", "Biotrade SA"),
        ("OPERATOR", "Dépôts Pétroliers"),
        ("BLENDER", "Raffinerie Atlantique"),
        ("REFINER", "HVO Industries"),
    ] {
        data.insert_entity(Entity {
            id: eid(id),
            name: name.to_string(),
        });
    }
    data.insert_depot(Depot {
        id: DepotId::new("DEP-1"),
        name: "Fos-sur-Mer".to_string(),
        country: Some("FR".to_string()),
    });
    data.insert_biofuel(Biofuel {
        code: BiofuelCode::new("ETH"),
        category: "ALCOHOL".to_string(),
        density: Decimal::new(794, 3),
        lhv: dec(27),
    });
    data.insert_biofuel(Biofuel {
        code: BiofuelCode::new("ED95"),
        category: "ALCOHOL".to_string(),
        density: Decimal::new(820, 3),
        lhv: dec(26),
    });
    data.insert_biofuel(Biofuel {
        code: BiofuelCode::new("EMHV"),
        category: "ESTER".to_string(),
        density: Decimal::new(883, 3),
        lhv: dec(37),
    });
    data
}

pub fn open() -> TestLedger {
    open_with(Arc::new(NoSanityIssues))
}

pub fn open_with(sanity: Arc<dyn SanityChecker>) -> TestLedger {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp.path().to_path_buf();

    let reference = Arc::new(reference_data());
    let notifications = Arc::new(RecordingNotifier::default());
    let ledger = LotLedger::open(config, reference.clone(), sanity, notifications.clone()).unwrap();

    TestLedger {
        ledger,
        reference,
        notifications,
        _temp: temp,
    }
}

/// Draft of ETH owned by `owner`
pub fn draft(
    t: &TestLedger,
    owner: &str,
    supplier: Party,
    client: Option<Party>,
    amount: i64,
) -> Lot {
    let mut new = NewLot::new(PERIOD, dec(amount), BiofuelCode::new("ETH"), supplier)
        .with_country("FR");
    new.client = client;
    t.machine().create_draft(&eid(owner), new).unwrap()
}

/// PRODUCER → OPERATOR lot accepted as STOCK in DEP-1
pub fn stocked(t: &TestLedger, amount: i64) -> (Lot, lot_ledger::StockPosition) {
    let lot = draft(
        t,
        "PRODUCER",
        Party::known("PRODUCER"),
        Some(Party::known("OPERATOR")),
        amount,
    );
    t.submit(lot.id, &eid("PRODUCER")).unwrap();
    let accepted = t
        .accept(
            lot.id,
            &eid("OPERATOR"),
            DeliveryType::Stock,
            lot_ledger::OutcomeParams::depot(DepotId::new("DEP-1")),
        )
        .unwrap();
    let position = accepted.stock.unwrap();
    (accepted.lot, position)
}

/// Lot record written straight to storage, bypassing the state machine
pub fn raw_lot(
    biofuel: &str,
    amount: i64,
    status: LotStatus,
    delivery_type: DeliveryType,
    supplier: Party,
    client: Option<Party>,
    lineage: Lineage,
) -> Lot {
    let id = LotId::new();
    let owner = supplier
        .entity()
        .cloned()
        .unwrap_or_else(|| eid("PRODUCER"));
    Lot {
        id,
        traceability_code: traceability_code(PERIOD, Some("FR"), id),
        period: PERIOD,
        status,
        delivery_type,
        declared_delivery: None,
        amount: dec(amount),
        biofuel: BiofuelCode::new(biofuel),
        feedstock: None,
        production_country: Some("FR".to_string()),
        emissions: None,
        supplier,
        client,
        owner,
        delivery_depot: None,
        lineage,
        warnings: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn write_raw(t: &TestLedger, lots: &[&Lot]) {
    let txn = t.storage().begin();
    for lot in lots {
        txn.put_lot(lot).unwrap();
        if let Some(parent) = lot.parent_lot() {
            txn.link_child(parent, lot.id).unwrap();
        }
    }
    txn.commit().unwrap();
}
