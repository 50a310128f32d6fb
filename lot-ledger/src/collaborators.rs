//! External collaborators consumed by the ledger
//!
//! Reference data and sanity checks are owned by other parts of the
//! platform. The ledger only sees them through these traits, injected at
//! construction.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::quantity::Quantity;
use crate::types::{Biofuel, BiofuelCode, Depot, DepotId, Entity, EntityId, Lot, SanityIssue};
use crate::{Error, Result};

/// Business-rule checks run on submission
pub trait SanityChecker: Send + Sync {
    /// Issues found for `lot`; blocking ones refuse the submission
    fn check(&self, lot: &Lot, quantity: &Quantity) -> Vec<SanityIssue>;
}

impl<F> SanityChecker for F
where
    F: Fn(&Lot, &Quantity) -> Vec<SanityIssue> + Send + Sync,
{
    fn check(&self, lot: &Lot, quantity: &Quantity) -> Vec<SanityIssue> {
        self(lot, quantity)
    }
}

/// Checker that never reports anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSanityIssues;

impl SanityChecker for NoSanityIssues {
    fn check(&self, _lot: &Lot, _quantity: &Quantity) -> Vec<SanityIssue> {
        Vec::new()
    }
}

/// Read-only lookups of entities, depots and biofuels.
///
/// Every miss is `Error::NotFound`.
pub trait ReferenceData: Send + Sync {
    /// Registered entity
    fn entity(&self, id: &EntityId) -> Result<Entity>;

    /// Depot
    fn depot(&self, id: &DepotId) -> Result<Depot>;

    /// Biofuel with density and LHV
    fn biofuel(&self, code: &BiofuelCode) -> Result<Biofuel>;
}

/// Reference data held in memory
#[derive(Debug, Default)]
pub struct InMemoryReferenceData {
    entities: RwLock<HashMap<EntityId, Entity>>,
    depots: RwLock<HashMap<DepotId, Depot>>,
    biofuels: RwLock<HashMap<BiofuelCode, Biofuel>>,
}

impl InMemoryReferenceData {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store loaded from a snapshot
    pub fn from_snapshot(snapshot: ReferenceSnapshot) -> Self {
        let data = Self::new();
        for entity in snapshot.entities {
            data.insert_entity(entity);
        }
        for depot in snapshot.depots {
            data.insert_depot(depot);
        }
        for biofuel in snapshot.biofuels {
            data.insert_biofuel(biofuel);
        }
        data
    }

    /// Add or replace an entity
    pub fn insert_entity(&self, entity: Entity) {
        self.entities.write().insert(entity.id.clone(), entity);
    }

    /// Add or replace a depot
    pub fn insert_depot(&self, depot: Depot) {
        self.depots.write().insert(depot.id.clone(), depot);
    }

    /// Add or replace a biofuel
    pub fn insert_biofuel(&self, biofuel: Biofuel) {
        self.biofuels.write().insert(biofuel.code.clone(), biofuel);
    }
}

impl ReferenceData for InMemoryReferenceData {
    fn entity(&self, id: &EntityId) -> Result<Entity> {
        self.entities
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("entity {}", id)))
    }

    fn depot(&self, id: &DepotId) -> Result<Depot> {
        self.depots
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("depot {}", id)))
    }

    fn biofuel(&self, code: &BiofuelCode) -> Result<Biofuel> {
        self.biofuels
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("biofuel {}", code)))
    }
}

/// Serializable dump of reference data
///
/// ```toml
/// [[biofuels]]
/// code = "ETH"
/// category = "ALCOHOL"
/// density = "0.794"
/// lhv = "27"
///
/// [[depots]]
/// id = "DEP-1"
/// name = "Fos-sur-Mer"
/// country = "FR"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSnapshot {
    /// Entities
    pub entities: Vec<Entity>,
    /// Depots
    pub depots: Vec<Depot>,
    /// Biofuels
    pub biofuels: Vec<Biofuel>,
}

impl ReferenceSnapshot {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse reference data: {}", e)))
    }
}
