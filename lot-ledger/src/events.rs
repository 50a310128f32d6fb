//! Append-only event log
//!
//! Every committed change to a lot is documented by an [`Event`] written in
//! the same transaction. Events of one lot form a SHA-256 hash chain: each
//! event stores the hash of its predecessor, so rewriting or dropping a past
//! event is detectable by [`EventLog::verify_chain`].

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{Storage, Txn};
use crate::types::{EntityId, Event, EventType, LotId};
use crate::{Error, Result};

/// Event payload: field name → value or `old -> new` diff
pub type Payload = BTreeMap<String, String>;

/// Build a payload from pairs
pub fn payload<I, K, V>(pairs: I) -> Payload
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash of an event's canonical bytes
pub fn hash_event(event: &Event) -> Result<[u8; 32]> {
    Ok(hash_bytes(&event.canonical_bytes()?))
}

/// Event log over the ledger storage
#[derive(Debug, Clone)]
pub struct EventLog {
    storage: Arc<Storage>,
}

impl EventLog {
    /// Create event log
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Append an event for `lot` inside `txn`.
    ///
    /// Locks the lot's chain head, so concurrent appends to the same lot
    /// serialize; the event is visible only once `txn` commits.
    pub fn append(
        &self,
        txn: &Txn<'_>,
        lot: LotId,
        event_type: EventType,
        actor: &EntityId,
        payload: Payload,
    ) -> Result<Event> {
        let head = txn.lock_chain_head(lot)?;

        let mut event = Event {
            event_id: Uuid::now_v7(),
            lot_id: lot,
            sequence: head.next_sequence,
            event_type,
            actor: actor.clone(),
            timestamp: Utc::now(),
            payload,
            previous_hash: head.last_hash,
            hash: [0u8; 32],
        };
        event.hash = hash_event(&event)?;

        txn.put_event(&event)?;

        tracing::debug!(
            lot_id = %lot,
            sequence = event.sequence,
            event_type = %event_type,
            actor = %actor,
            "Event appended"
        );

        Ok(event)
    }

    /// Full history of a lot, oldest first
    pub fn history(&self, lot: LotId) -> Result<Vec<Event>> {
        self.storage
            .lot_event_ids(lot)?
            .into_iter()
            .map(|id| self.storage.get_event(id))
            .collect()
    }

    /// Get event by ID
    pub fn get(&self, event_id: Uuid) -> Result<Event> {
        self.storage.get_event(event_id)
    }

    /// Check sequence numbers, links and hashes of a lot's chain
    pub fn verify_chain(&self, lot: LotId) -> Result<()> {
        let mut previous = [0u8; 32];

        for (position, event) in self.history(lot)?.into_iter().enumerate() {
            if event.sequence != position as u64 {
                return Err(Error::ReconciliationDrift(format!(
                    "lot {} event {} has sequence {}, expected {}",
                    lot, event.event_id, event.sequence, position
                )));
            }
            if event.previous_hash != previous {
                return Err(Error::ReconciliationDrift(format!(
                    "lot {} event {} does not link to its predecessor",
                    lot, event.event_id
                )));
            }
            if hash_event(&event)? != event.hash {
                return Err(Error::ReconciliationDrift(format!(
                    "lot {} event {} hash mismatch (expected {})",
                    lot,
                    event.event_id,
                    hex::encode(event.hash)
                )));
            }
            previous = event.hash;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    fn test_log() -> (EventLog, Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        (EventLog::new(storage.clone()), storage, temp_dir)
    }

    #[test]
    fn test_hash_bytes() {
        let hash1 = hash_bytes(b"lot");
        let hash2 = hash_bytes(b"lot");
        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash_bytes(b"lots"));
    }

    #[test]
    fn test_chain_links_events_of_one_lot() {
        let (log, storage, _temp) = test_log();
        let lot = LotId::new();
        let actor = EntityId::new("OWNER");

        let txn = storage.begin();
        let first = log
            .append(&txn, lot, EventType::Created, &actor, Payload::new())
            .unwrap();
        let second = log
            .append(
                &txn,
                lot,
                EventType::Submitted,
                &actor,
                payload([("status", "DRAFT -> PENDING")]),
            )
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(first.previous_hash, [0u8; 32]);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.previous_hash, first.hash);

        let history = log.history(lot).unwrap();
        assert_eq!(history, vec![first, second]);
        log.verify_chain(lot).unwrap();
    }

    #[test]
    fn test_rolled_back_events_leave_no_trace() {
        let (log, storage, _temp) = test_log();
        let lot = LotId::new();
        {
            let txn = storage.begin();
            log.append(&txn, lot, EventType::Created, &EntityId::new("A"), Payload::new())
                .unwrap();
        }
        assert!(log.history(lot).unwrap().is_empty());

        // The next append starts the chain from scratch
        let txn = storage.begin();
        let event = log
            .append(&txn, lot, EventType::Created, &EntityId::new("A"), Payload::new())
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(event.sequence, 0);
    }

    #[test]
    fn test_tampered_event_breaks_chain() {
        let (log, storage, _temp) = test_log();
        let lot = LotId::new();
        let actor = EntityId::new("OWNER");

        let txn = storage.begin();
        log.append(&txn, lot, EventType::Created, &actor, Payload::new())
            .unwrap();
        let mut rejected = log
            .append(&txn, lot, EventType::Rejected, &actor, payload([("comment", "bad")]))
            .unwrap();
        txn.commit().unwrap();

        // Rewrite the comment in place, keeping the stored hash
        rejected.payload.insert("comment".into(), "fine".into());
        let txn = storage.begin();
        txn.put_event(&rejected).unwrap();
        txn.commit().unwrap();

        let err = log.verify_chain(lot).unwrap_err();
        assert!(matches!(err, Error::ReconciliationDrift(_)));
    }
}
