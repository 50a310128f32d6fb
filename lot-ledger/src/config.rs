//! Configuration for the ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Transaction / locking configuration
    pub transactions: TransactionConfig,

    /// Reconciliation checker configuration
    pub reconciliation: ReconciliationConfig,

    /// Notification dispatch configuration
    pub notifications: NotificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/lot-ledger"),
            service_name: "lot-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            transactions: TransactionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Transaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How long a transaction waits for a row lock before failing (ms)
    pub lock_timeout_ms: u64,

    /// Detect lock cycles instead of waiting for the timeout
    pub deadlock_detect: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2_000,
            deadlock_detect: true,
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Tolerated difference between expected and recorded amounts (litres)
    pub epsilon: Decimal,

    /// Write corrections back; requires operator confirmation
    pub apply_corrections: bool,

    /// Interval between scheduled runs in the server and in
    /// `lot-reconcile --watch` (seconds). 0 disables the server schedule.
    pub interval_secs: u64,

    /// Entity recorded as actor of corrections
    pub operator: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            epsilon: Decimal::new(1, 1), // 0.1 L
            apply_corrections: false,
            interval_secs: 3_600,
            operator: "reconciliation-checker".to_string(),
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Dispatch notifications at all
    pub enabled: bool,

    /// Mailbox capacity; notifications beyond it are dropped with a warning
    pub channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1_024,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("LOT_LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(timeout) = std::env::var("LOT_LEDGER_LOCK_TIMEOUT_MS") {
            self.transactions.lock_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LOT_LEDGER_LOCK_TIMEOUT_MS: {}", e))
            })?;
        }

        if let Ok(epsilon) = std::env::var("LOT_LEDGER_RECONCILE_EPSILON") {
            self.reconciliation.epsilon = epsilon.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LOT_LEDGER_RECONCILE_EPSILON: {}", e))
            })?;
        }

        Ok(())
    }
}
