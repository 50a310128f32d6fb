//! Core types for the lot ledger
//!
//! All persisted types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for quantities)
//! - Tagged variants instead of flag-selected columns (parties, lineage)

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::quantity::{self, Quantity};
use crate::{Error, Result};

/// Lot identifier (UUIDv7 for time-ordering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LotId(Uuid);

impl LotId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Raw UUID bytes, used as storage key
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stock position identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockId(Uuid);

impl StockId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Raw UUID bytes, used as storage key
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for StockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered economic entity (producer, trader, operator)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Create new entity ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage depot identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepotId(String);

impl DepotId {
    /// Create new depot ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DepotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Biofuel reference code (ETH, EMHV, HVO...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BiofuelCode(String);

impl BiofuelCode {
    /// Create new biofuel code
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BiofuelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supplier or client of a lot.
///
/// A side is either a platform entity or a free-text name for a counterpart
/// that is not registered. Never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    /// Registered platform entity
    Known(EntityId),
    /// Unregistered counterpart, by name
    Unknown(String),
}

impl Party {
    /// Registered entity
    pub fn known(id: impl Into<String>) -> Self {
        Party::Known(EntityId::new(id))
    }

    /// Unregistered counterpart; the name must not be blank
    pub fn unknown(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(Error::MalformedParams(
                "unknown party name must not be empty".to_string(),
            ));
        }
        Ok(Party::Unknown(trimmed.to_string()))
    }

    /// Entity behind this party, if registered
    pub fn entity(&self) -> Option<&EntityId> {
        match self {
            Party::Known(id) => Some(id),
            Party::Unknown(_) => None,
        }
    }

    /// Whether this party is the given registered entity
    pub fn is_entity(&self, id: &EntityId) -> bool {
        self.entity() == Some(id)
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Known(id) => write!(f, "{}", id),
            Party::Unknown(name) => write!(f, "unknown:{}", name),
        }
    }
}

/// Lot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LotStatus {
    /// Being prepared by its owner
    Draft = 1,
    /// Sent, awaiting the client
    Pending = 2,
    /// Accepted by the client (terminal)
    Accepted = 3,
    /// Accepted and locked by a closed declaration (terminal)
    Frozen = 4,
    /// Refused by the client (terminal)
    Rejected = 5,
    /// Withdrawn while still a draft (terminal)
    Deleted = 6,
}

impl LotStatus {
    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            LotStatus::Draft => "DRAFT",
            LotStatus::Pending => "PENDING",
            LotStatus::Accepted => "ACCEPTED",
            LotStatus::Frozen => "FROZEN",
            LotStatus::Rejected => "REJECTED",
            LotStatus::Deleted => "DELETED",
        }
    }

    /// No transition ever leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LotStatus::Accepted | LotStatus::Frozen | LotStatus::Rejected | LotStatus::Deleted
        )
    }

    /// Edges of the lot state graph
    pub fn can_transition_to(&self, next: LotStatus) -> bool {
        matches!(
            (self, next),
            (LotStatus::Draft, LotStatus::Pending)
                | (LotStatus::Draft, LotStatus::Deleted)
                | (LotStatus::Pending, LotStatus::Accepted)
                | (LotStatus::Pending, LotStatus::Frozen)
                | (LotStatus::Pending, LotStatus::Rejected)
        )
    }

    /// Whether the lot still claims its volume (counts toward its parent)
    pub fn is_live(&self) -> bool {
        !matches!(self, LotStatus::Rejected | LotStatus::Deleted)
    }
}

impl fmt::Display for LotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery outcome of an accepted lot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryType {
    /// Not decided yet
    Unknown = 0,
    /// Placed into a depot
    Stock = 1,
    /// Release for consumption
    Rfc = 2,
    /// Exported
    Export = 3,
    /// Blended into fossil fuel
    Blending = 4,
    /// Direct delivery
    Direct = 5,
    /// Transformed into another product
    Processing = 6,
    /// Re-invoiced downstream
    Trading = 7,
}

impl DeliveryType {
    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Unknown => "UNKNOWN",
            DeliveryType::Stock => "STOCK",
            DeliveryType::Rfc => "RFC",
            DeliveryType::Export => "EXPORT",
            DeliveryType::Blending => "BLENDING",
            DeliveryType::Direct => "DIRECT",
            DeliveryType::Processing => "PROCESSING",
            DeliveryType::Trading => "TRADING",
        }
    }

    /// Parse from code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "UNKNOWN" => Some(DeliveryType::Unknown),
            "STOCK" => Some(DeliveryType::Stock),
            "RFC" => Some(DeliveryType::Rfc),
            "EXPORT" => Some(DeliveryType::Export),
            "BLENDING" => Some(DeliveryType::Blending),
            "DIRECT" => Some(DeliveryType::Direct),
            "PROCESSING" => Some(DeliveryType::Processing),
            "TRADING" => Some(DeliveryType::Trading),
            _ => None,
        }
    }

    /// Outcomes that forward the full volume to one downstream child
    pub fn forwards_volume(&self) -> bool {
        matches!(self, DeliveryType::Trading | DeliveryType::Processing)
    }

    /// Outcomes that end the chain without a counterpart
    pub fn is_final_use(&self) -> bool {
        matches!(
            self,
            DeliveryType::Rfc | DeliveryType::Export | DeliveryType::Blending | DeliveryType::Direct
        )
    }
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Measurement unit a quantity is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// Litres at 15°C (canonical)
    Volume,
    /// Kilograms
    Mass,
    /// Megajoules (lower heating value)
    Energy,
}

/// Biofuel reference data needed by the converter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Biofuel {
    /// Reference code
    pub code: BiofuelCode,
    /// Compatibility category (alcohols, esters, HVO...)
    pub category: String,
    /// Density in kg/L
    pub density: Decimal,
    /// Lower heating value in MJ/kg
    pub lhv: Decimal,
}

/// Depot reference data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depot {
    /// Depot ID
    pub id: DepotId,
    /// Display name
    pub name: String,
    /// ISO country code
    pub country: Option<String>,
}

/// Entity reference data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity ID
    pub id: EntityId,
    /// Display name
    pub name: String,
}

/// Emission figures; carried through, never interpreted here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emissions {
    /// Total emissions, gCO2eq/MJ
    pub total: Decimal,
    /// Reduction against the fossil comparator, percent
    pub reduction: Decimal,
}

/// Sanity-check verdict attached to a lot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityIssue {
    /// Check code
    pub code: String,
    /// Blocking issues refuse the submission
    pub is_blocking: bool,
    /// Free-form context
    pub metadata: BTreeMap<String, String>,
}

impl SanityIssue {
    /// Blocking issue
    pub fn blocking(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_blocking: true,
            metadata: BTreeMap::new(),
        }
    }

    /// Non-blocking warning
    pub fn warning(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_blocking: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach context
    pub fn with_meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Where a lot's volume comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lineage {
    /// Declared at the start of the chain
    Root,
    /// Forwarded or split from another lot
    ParentLot(LotId),
    /// Extracted from a stock position
    ParentStock(StockId),
}

/// A quantity of biofuel tracked as a single accountable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    /// Lot ID
    pub id: LotId,

    /// Human-readable traceability code
    pub traceability_code: String,

    /// Declaration period, YYYYMM
    pub period: u32,

    /// Current status
    pub status: LotStatus,

    /// Delivery outcome (set on acceptance)
    pub delivery_type: DeliveryType,

    /// Outcome declared by the owner for lots without a client
    pub declared_delivery: Option<DeliveryType>,

    /// Canonical amount: litres at 15°C
    pub amount: Decimal,

    /// Biofuel
    pub biofuel: BiofuelCode,

    /// Feedstock code
    pub feedstock: Option<String>,

    /// Production country (ISO code)
    pub production_country: Option<String>,

    /// Emission figures
    pub emissions: Option<Emissions>,

    /// Supplier side
    pub supplier: Party,

    /// Client side
    pub client: Option<Party>,

    /// Entity that declared the lot and may submit/delete it
    pub owner: EntityId,

    /// Delivery depot
    pub delivery_depot: Option<DepotId>,

    /// Lineage
    pub lineage: Lineage,

    /// Non-blocking sanity-check warnings
    pub warnings: Vec<SanityIssue>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Lot {
    /// Parent lot, if split from one
    pub fn parent_lot(&self) -> Option<LotId> {
        match self.lineage {
            Lineage::ParentLot(id) => Some(id),
            _ => None,
        }
    }

    /// Parent stock position, if extracted from one
    pub fn parent_stock(&self) -> Option<StockId> {
        match self.lineage {
            Lineage::ParentStock(id) => Some(id),
            _ => None,
        }
    }

    /// Registered client, if any
    pub fn client_entity(&self) -> Option<&EntityId> {
        self.client.as_ref().and_then(Party::entity)
    }

    /// Check if lot is in terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Volume, mass and energy re-derived from the canonical amount
    pub fn quantity(&self, biofuel: &Biofuel) -> Result<Quantity> {
        quantity::convert(self.amount, Unit::Volume, biofuel)
    }
}

/// Derive the traceability code shown to operators.
///
/// Format: `{period}-{country}-{first 8 hex digits of the id}`, with `XX`
/// when the production country is not known.
pub fn traceability_code(period: u32, production_country: Option<&str>, id: LotId) -> String {
    let country = production_country
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "XX".to_string());
    let simple = id.as_uuid().simple().to_string().to_ascii_uppercase();
    format!("{}-{}-{}", period, country, &simple[..8])
}

/// Current declaration period, YYYYMM
pub fn current_period() -> u32 {
    let now = Utc::now();
    now.year() as u32 * 100 + now.month()
}

/// Depot-scoped stock balance created when a lot is accepted into storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockPosition {
    /// Position ID
    pub id: StockId,

    /// Lot accepted as STOCK that opened this position
    pub origin_lot: LotId,

    /// Depot holding the volume
    pub depot: DepotId,

    /// Owning entity
    pub owner: EntityId,

    /// Biofuel held
    pub biofuel: BiofuelCode,

    /// Amount at creation (immutable)
    pub initial_amount: Decimal,

    /// Amount still available for extraction
    pub remaining_amount: Decimal,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl StockPosition {
    /// Volume already extracted, according to the stored balance
    pub fn extracted_amount(&self) -> Decimal {
        self.initial_amount - self.remaining_amount
    }

    /// `0 <= remaining <= initial`
    pub fn is_within_bounds(&self) -> bool {
        self.remaining_amount >= Decimal::ZERO && self.remaining_amount <= self.initial_amount
    }
}

/// Event type recorded in the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// Lot record created (draft, derived child or extraction)
    Created = 1,
    /// Attributes amended without a status change
    Updated = 2,
    /// DRAFT → PENDING
    Submitted = 3,
    /// PENDING → ACCEPTED
    Accepted = 4,
    /// PENDING → FROZEN
    Frozen = 5,
    /// PENDING → REJECTED
    Rejected = 6,
    /// DRAFT → DELETED
    Deleted = 7,
}

impl EventType {
    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Updated => "UPDATED",
            EventType::Submitted => "SUBMITTED",
            EventType::Accepted => "ACCEPTED",
            EventType::Frozen => "FROZEN",
            EventType::Rejected => "REJECTED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable audit record of a change to a lot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID
    pub event_id: Uuid,

    /// Lot this event belongs to
    pub lot_id: LotId,

    /// Position in the lot's chain, starting at 0
    pub sequence: u64,

    /// Type of event
    pub event_type: EventType,

    /// Acting entity
    pub actor: EntityId,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Structured diff / context
    pub payload: BTreeMap<String, String>,

    /// Hash of the previous event of the same lot (zero for the first)
    pub previous_hash: [u8; 32],

    /// SHA-256 of this event's canonical bytes
    pub hash: [u8; 32],
}

impl Event {
    /// Bytes covered by the hash (everything but the hash itself)
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unsealed = self.clone();
        unsealed.hash = [0u8; 32];
        Ok(bincode::serialize(&unsealed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_graph() {
        assert!(LotStatus::Draft.can_transition_to(LotStatus::Pending));
        assert!(LotStatus::Draft.can_transition_to(LotStatus::Deleted));
        assert!(LotStatus::Pending.can_transition_to(LotStatus::Frozen));
        assert!(!LotStatus::Pending.can_transition_to(LotStatus::Deleted));
        assert!(!LotStatus::Draft.can_transition_to(LotStatus::Accepted));

        for terminal in [
            LotStatus::Accepted,
            LotStatus::Frozen,
            LotStatus::Rejected,
            LotStatus::Deleted,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                LotStatus::Draft,
                LotStatus::Pending,
                LotStatus::Accepted,
                LotStatus::Frozen,
                LotStatus::Rejected,
                LotStatus::Deleted,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_unknown_party_requires_name() {
        assert!(Party::unknown("   ").is_err());
        let party = Party::unknown(" Raffinerie du Nord ").unwrap();
        assert_eq!(party, Party::Unknown("Raffinerie du Nord".to_string()));
        assert_eq!(party.entity(), None);
    }

    #[test]
    fn test_known_party_matches_entity() {
        let party = Party::known("ENT-1");
        assert!(party.is_entity(&EntityId::new("ENT-1")));
        assert!(!party.is_entity(&EntityId::new("ENT-2")));
    }

    #[test]
    fn test_delivery_type_codes() {
        for delivery in [
            DeliveryType::Unknown,
            DeliveryType::Stock,
            DeliveryType::Rfc,
            DeliveryType::Export,
            DeliveryType::Blending,
            DeliveryType::Direct,
            DeliveryType::Processing,
            DeliveryType::Trading,
        ] {
            assert_eq!(DeliveryType::from_code(delivery.as_str()), Some(delivery));
        }
        assert_eq!(DeliveryType::from_code("SHIP"), None);
    }

    #[test]
    fn test_traceability_code() {
        let id = LotId::from_uuid(Uuid::parse_str("0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b").unwrap());
        assert_eq!(traceability_code(202403, Some("fr"), id), "202403-FR-0190A1B2");
        assert_eq!(traceability_code(202403, None, id), "202403-XX-0190A1B2");
    }
}
