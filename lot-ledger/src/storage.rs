//! Storage layer using RocksDB
//!
//! Lots, stock positions and events live in a pessimistic `TransactionDB`.
//! Every state change runs inside a [`Txn`]; rows are locked with
//! `get_for_update` (the RocksDB equivalent of `SELECT ... FOR UPDATE`), so
//! two transactions touching the same lot or stock position serialize while
//! transactions on disjoint rows proceed in parallel. Dropping a `Txn`
//! without committing rolls it back.
//!
//! # Column Families
//!
//! - `lots` - Lot records (key: lot_id)
//! - `stocks` - Stock positions (key: stock_id)
//! - `events` - Append-only event log (key: event_id)
//! - `indices` - Secondary indices (key: tag || ids)
//!
//! # Index keys
//!
//! - `c` parent_lot || child_lot → children of a lot
//! - `x` stock || lot → lots extracted from a position
//! - `o` origin_lot → stock (unique origin of a position)
//! - `e` lot || sequence → event_id
//! - `h` lot → head of the lot's event chain

use crate::{
    error::{Error, Result},
    types::{Event, Lot, LotId, StockId, StockPosition},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    SingleThreaded, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Column family names
const CF_LOTS: &str = "lots";
const CF_STOCKS: &str = "stocks";
const CF_EVENTS: &str = "events";
const CF_INDICES: &str = "indices";

/// Index tags
const IDX_CHILD: u8 = b'c';
const IDX_EXTRACTION: u8 = b'x';
const IDX_ORIGIN: u8 = b'o';
const IDX_EVENT: u8 = b'e';
const IDX_HEAD: u8 = b'h';

/// Head of a lot's event chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    /// Sequence number the next event will get
    pub next_sequence: u64,
    /// Hash of the last event (zero before the first)
    pub last_hash: [u8; 32],
}

impl Default for ChainHead {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            last_hash: [0u8; 32],
        }
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: TransactionDB<SingleThreaded>,
    lock_timeout_ms: i64,
    deadlock_detect: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("deadlock_detect", &self.deadlock_detect)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let lock_timeout_ms = config.transactions.lock_timeout_ms as i64;
        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(lock_timeout_ms);
        txn_db_opts.set_default_lock_timeout(lock_timeout_ms);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_LOTS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_STOCKS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_EVENTS, Self::cf_options_events()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db: TransactionDB<SingleThreaded> =
            TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            lock_timeout_ms,
            "Opened RocksDB transaction store"
        );

        Ok(Self {
            db,
            lock_timeout_ms,
            deadlock_detect: config.transactions.deadlock_detect,
        })
    }

    // Column family options

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Records are read on every transition, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_events() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Begin a pessimistic transaction
    pub fn begin(&self) -> Txn<'_> {
        let write_opts = WriteOptions::default();
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        txn_opts.set_deadlock_detect(self.deadlock_detect);

        Txn {
            inner: self.db.transaction_opt(&write_opts, &txn_opts),
            storage: self,
        }
    }

    // Unlocked reads (committed state)

    /// Get lot by ID
    pub fn get_lot(&self, id: LotId) -> Result<Lot> {
        self.find_lot(id)?
            .ok_or_else(|| Error::NotFound(format!("lot {}", id)))
    }

    /// Get lot by ID, `None` if absent
    pub fn find_lot(&self, id: LotId) -> Result<Option<Lot>> {
        let cf = self.cf_handle(CF_LOTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get stock position by ID
    pub fn get_stock(&self, id: StockId) -> Result<StockPosition> {
        let cf = self.cf_handle(CF_STOCKS)?;
        let value = self
            .db
            .get_cf(cf, id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("stock position {}", id)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Get event by ID
    pub fn get_event(&self, event_id: Uuid) -> Result<Event> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let value = self
            .db
            .get_cf(cf, event_id.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("event {}", event_id)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// IDs of lots whose parent is `parent`
    pub fn child_ids(&self, parent: LotId) -> Result<Vec<LotId>> {
        let prefix = index_key(IDX_CHILD, parent.as_bytes(), None);
        self.scan_index(&prefix)?
            .into_iter()
            .map(|suffix| uuid_from_suffix(&suffix).map(LotId::from_uuid))
            .collect()
    }

    /// IDs of lots extracted from `stock`
    pub fn extraction_ids(&self, stock: StockId) -> Result<Vec<LotId>> {
        let prefix = index_key(IDX_EXTRACTION, stock.as_bytes(), None);
        self.scan_index(&prefix)?
            .into_iter()
            .map(|suffix| uuid_from_suffix(&suffix).map(LotId::from_uuid))
            .collect()
    }

    /// Stock position opened by `origin`, if any
    pub fn stock_for_origin(&self, origin: LotId) -> Result<Option<StockId>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_ORIGIN, origin.as_bytes(), None);
        match self.db.get_cf(cf, &key)? {
            Some(value) => uuid_from_suffix(&value).map(|id| Some(StockId::from_uuid(id))),
            None => Ok(None),
        }
    }

    /// Event IDs of a lot, in chain order
    pub fn lot_event_ids(&self, lot: LotId) -> Result<Vec<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let prefix = index_key(IDX_EVENT, lot.as_bytes(), None);

        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(uuid_from_suffix(&value)?);
        }
        Ok(ids)
    }

    /// All lots
    pub fn scan_lots(&self) -> Result<Vec<Lot>> {
        let cf = self.cf_handle(CF_LOTS)?;
        let mut lots = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            lots.push(bincode::deserialize(&value)?);
        }
        Ok(lots)
    }

    /// All stock positions
    pub fn scan_stocks(&self) -> Result<Vec<StockPosition>> {
        let cf = self.cf_handle(CF_STOCKS)?;
        let mut stocks = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            stocks.push(bincode::deserialize(&value)?);
        }
        Ok(stocks)
    }

    /// Suffixes (key minus prefix) of every index entry under `prefix`
    fn scan_index(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let mut suffixes = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            suffixes.push(key[prefix.len()..].to_vec());
        }
        Ok(suffixes)
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_lots: self.count(CF_LOTS)?,
            total_stock_positions: self.count(CF_STOCKS)?,
            total_events: self.count(CF_EVENTS)?,
        })
    }

    fn count(&self, name: &str) -> Result<u64> {
        let cf = self.cf_handle(name)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

/// A pessimistic transaction over the ledger tables.
///
/// Lock order across the crate: parent lot before child lot, lot before its
/// stock position.
pub struct Txn<'a> {
    inner: Transaction<'a, TransactionDB<SingleThreaded>>,
    storage: &'a Storage,
}

impl<'a> Txn<'a> {
    /// Lock a lot row and read it
    pub fn lock_lot(&self, id: LotId) -> Result<Lot> {
        let cf = self.storage.cf_handle(CF_LOTS)?;
        let value = self
            .inner
            .get_for_update_cf(cf, id.as_bytes(), true)?
            .ok_or_else(|| Error::NotFound(format!("lot {}", id)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Lock a stock position row and read it
    pub fn lock_stock(&self, id: StockId) -> Result<StockPosition> {
        let cf = self.storage.cf_handle(CF_STOCKS)?;
        let value = self
            .inner
            .get_for_update_cf(cf, id.as_bytes(), true)?
            .ok_or_else(|| Error::NotFound(format!("stock position {}", id)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Take a shared lock on a stock position row and read it. Blocks writers
    /// until the transaction ends; other readers go through.
    pub fn share_stock(&self, id: StockId) -> Result<StockPosition> {
        let cf = self.storage.cf_handle(CF_STOCKS)?;
        let value = self
            .inner
            .get_for_update_cf(cf, id.as_bytes(), false)?
            .ok_or_else(|| Error::NotFound(format!("stock position {}", id)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Lock the origin slot of `lot` and return the position already in it
    pub fn lock_origin(&self, lot: LotId) -> Result<Option<StockId>> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_ORIGIN, lot.as_bytes(), None);
        match self.inner.get_for_update_cf(cf, &key, true)? {
            Some(value) => uuid_from_suffix(&value).map(|id| Some(StockId::from_uuid(id))),
            None => Ok(None),
        }
    }

    /// Lock the event chain head of `lot`
    pub fn lock_chain_head(&self, lot: LotId) -> Result<ChainHead> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_HEAD, lot.as_bytes(), None);
        match self.inner.get_for_update_cf(cf, &key, true)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(ChainHead::default()),
        }
    }

    /// Write a lot record
    pub fn put_lot(&self, lot: &Lot) -> Result<()> {
        let cf = self.storage.cf_handle(CF_LOTS)?;
        self.inner
            .put_cf(cf, lot.id.as_bytes(), bincode::serialize(lot)?)?;
        Ok(())
    }

    /// Write a stock position record
    pub fn put_stock(&self, stock: &StockPosition) -> Result<()> {
        let cf = self.storage.cf_handle(CF_STOCKS)?;
        self.inner
            .put_cf(cf, stock.id.as_bytes(), bincode::serialize(stock)?)?;
        Ok(())
    }

    /// Record `child` under `parent`
    pub fn link_child(&self, parent: LotId, child: LotId) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_CHILD, parent.as_bytes(), Some(child.as_bytes()));
        self.inner.put_cf(cf, key, b"")?;
        Ok(())
    }

    /// Remove `child` from under `parent`
    pub fn unlink_child(&self, parent: LotId, child: LotId) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_CHILD, parent.as_bytes(), Some(child.as_bytes()));
        self.inner.delete_cf(cf, key)?;
        Ok(())
    }

    /// Record `lot` as extracted from `stock`
    pub fn link_extraction(&self, stock: StockId, lot: LotId) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_EXTRACTION, stock.as_bytes(), Some(lot.as_bytes()));
        self.inner.put_cf(cf, key, b"")?;
        Ok(())
    }

    /// Bind `origin` to the position it opened
    pub fn put_origin(&self, origin: LotId, stock: StockId) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let key = index_key(IDX_ORIGIN, origin.as_bytes(), None);
        self.inner.put_cf(cf, key, stock.as_bytes())?;
        Ok(())
    }

    /// Append an event and advance its lot's chain head.
    ///
    /// The caller must hold the chain head lock (see [`Txn::lock_chain_head`]).
    pub fn put_event(&self, event: &Event) -> Result<()> {
        let cf_events = self.storage.cf_handle(CF_EVENTS)?;
        let cf_indices = self.storage.cf_handle(CF_INDICES)?;

        self.inner
            .put_cf(cf_events, event.event_id.as_bytes(), bincode::serialize(event)?)?;

        let seq = event.sequence.to_be_bytes();
        let idx = index_key(IDX_EVENT, event.lot_id.as_bytes(), Some(&seq));
        self.inner.put_cf(cf_indices, idx, event.event_id.as_bytes())?;

        let head = ChainHead {
            next_sequence: event.sequence + 1,
            last_hash: event.hash,
        };
        let head_key = index_key(IDX_HEAD, event.lot_id.as_bytes(), None);
        self.inner
            .put_cf(cf_indices, head_key, bincode::serialize(&head)?)?;

        Ok(())
    }

    /// Atomic commit
    pub fn commit(self) -> Result<()> {
        self.inner.commit()?;
        Ok(())
    }
}

// Index key helpers

fn index_key(tag: u8, first: &[u8], second: Option<&[u8]>) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + first.len() + second.map_or(0, <[u8]>::len));
    key.push(tag);
    key.extend_from_slice(first);
    if let Some(second) = second {
        key.extend_from_slice(second);
    }
    key
}

fn uuid_from_suffix(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes)
        .map_err(|e| Error::Storage(format!("Corrupt index entry: {}", e)))
}

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Lot records
    pub total_lots: u64,
    /// Stock positions
    pub total_stock_positions: u64,
    /// Events
    pub total_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BiofuelCode, DeliveryType, EntityId, Lineage, LotStatus, Party};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.transactions.lock_timeout_ms = 100;
        (config, temp_dir)
    }

    fn test_lot(lineage: Lineage) -> Lot {
        let id = LotId::new();
        Lot {
            id,
            traceability_code: crate::types::traceability_code(202401, Some("FR"), id),
            period: 202401,
            status: LotStatus::Draft,
            delivery_type: DeliveryType::Unknown,
            declared_delivery: None,
            amount: Decimal::new(1000, 0),
            biofuel: BiofuelCode::new("ETH"),
            feedstock: None,
            production_country: Some("FR".to_string()),
            emissions: None,
            supplier: Party::known("SUP"),
            client: Some(Party::known("CLI")),
            owner: EntityId::new("SUP"),
            delivery_depot: None,
            lineage,
            warnings: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.cf_handle(CF_LOTS).is_ok());
        assert!(storage.cf_handle(CF_INDICES).is_ok());
    }

    #[test]
    fn test_commit_and_read_back() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let parent = test_lot(Lineage::Root);
        let child = test_lot(Lineage::ParentLot(parent.id));

        let txn = storage.begin();
        txn.put_lot(&parent).unwrap();
        txn.put_lot(&child).unwrap();
        txn.link_child(parent.id, child.id).unwrap();
        txn.commit().unwrap();

        assert_eq!(storage.get_lot(parent.id).unwrap(), parent);
        assert_eq!(storage.child_ids(parent.id).unwrap(), vec![child.id]);
        assert!(storage.child_ids(child.id).unwrap().is_empty());
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let lot = test_lot(Lineage::Root);
        {
            let txn = storage.begin();
            txn.put_lot(&lot).unwrap();
        }

        assert!(storage.find_lot(lot.id).unwrap().is_none());
        assert_eq!(storage.get_stats().unwrap().total_lots, 0);
    }

    #[test]
    fn test_locked_row_times_out_second_writer() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let lot = test_lot(Lineage::Root);
        let txn = storage.begin();
        txn.put_lot(&lot).unwrap();
        txn.commit().unwrap();

        let first = storage.begin();
        first.lock_lot(lot.id).unwrap();

        let second = storage.begin();
        let err = second.lock_lot(lot.id).unwrap_err();
        assert!(err.is_retryable(), "expected a lock timeout, got {:?}", err);

        first.commit().unwrap();
    }

    #[test]
    fn test_index_prefixes_do_not_leak() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let a = test_lot(Lineage::Root);
        let b = test_lot(Lineage::Root);
        let txn = storage.begin();
        for _ in 0..3 {
            txn.link_child(a.id, LotId::new()).unwrap();
        }
        txn.link_child(b.id, LotId::new()).unwrap();
        let stock = StockId::new();
        txn.put_origin(a.id, stock).unwrap();
        txn.commit().unwrap();

        assert_eq!(storage.child_ids(a.id).unwrap().len(), 3);
        assert_eq!(storage.child_ids(b.id).unwrap().len(), 1);
        assert_eq!(storage.stock_for_origin(a.id).unwrap(), Some(stock));
        assert_eq!(storage.stock_for_origin(b.id).unwrap(), None);
    }
}
