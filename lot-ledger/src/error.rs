//! Error types for the lot ledger

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{LotId, LotStatus, SanityIssue, StockId};

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Domain failures carry the data a caller needs to render a message; every
/// variant maps to a stable [`ErrorCode`].
#[derive(Error, Debug)]
pub enum Error {
    /// Operation not permitted from the lot's current status
    #[error("Invalid status: cannot {operation} lot {lot} in status {status}")]
    InvalidStatus {
        /// Lot concerned
        lot: LotId,
        /// Its current status
        status: LotStatus,
        /// Operation attempted
        operation: &'static str,
    },

    /// Acting entity is not the authorized party
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Required parameters missing or invalid
    #[error("Malformed parameters: {0}")]
    MalformedParams(String),

    /// Referenced lot, position, entity, depot or biofuel does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Sanity checker returned blocking issues
    #[error("Sanity check failed with {} issue(s)", .0.len())]
    SanityCheckFailed(Vec<SanityIssue>),

    /// Extraction exceeds the remaining amount
    #[error("Insufficient stock in {position}: requested {requested}, remaining {remaining}")]
    InsufficientStock {
        /// Position concerned
        position: StockId,
        /// Requested amount
        requested: Decimal,
        /// Amount available
        remaining: Decimal,
    },

    /// STOCK outcome without a resolvable depot
    #[error("Missing depot: lot {0} cannot be stored without a resolvable depot")]
    MissingDepot(LotId),

    /// Recorded state disagrees with the ledger invariants
    #[error("Reconciliation drift: {0}")]
    ReconciliationDrift(String),

    /// Transient infrastructure failure (lock timeout, busy storage)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes exposed to the calling layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `INVALID_STATUS`
    InvalidStatus,
    /// `FORBIDDEN`
    Forbidden,
    /// `MALFORMED_PARAMS`
    MalformedParams,
    /// `NOT_FOUND`
    NotFound,
    /// `SANITY_CHECK_FAILED`
    SanityCheckFailed,
    /// `INSUFFICIENT_STOCK`
    InsufficientStock,
    /// `MISSING_DEPOT`
    MissingDepot,
    /// `RECONCILIATION_DRIFT`
    ReconciliationDrift,
    /// `UNAVAILABLE`
    Unavailable,
}

impl ErrorCode {
    /// Code string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidStatus => "INVALID_STATUS",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::MalformedParams => "MALFORMED_PARAMS",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::SanityCheckFailed => "SANITY_CHECK_FAILED",
            ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
            ErrorCode::MissingDepot => "MISSING_DEPOT",
            ErrorCode::ReconciliationDrift => "RECONCILIATION_DRIFT",
            ErrorCode::Unavailable => "UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Error {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidStatus { .. } => ErrorCode::InvalidStatus,
            Error::Forbidden(_) => ErrorCode::Forbidden,
            Error::MalformedParams(_) => ErrorCode::MalformedParams,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::SanityCheckFailed(_) => ErrorCode::SanityCheckFailed,
            Error::InsufficientStock { .. } => ErrorCode::InsufficientStock,
            Error::MissingDepot(_) => ErrorCode::MissingDepot,
            Error::ReconciliationDrift(_) => ErrorCode::ReconciliationDrift,
            Error::Unavailable(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorCode::Unavailable,
        }
    }

    /// Whether the caller layer may retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::TryAgain => Error::Unavailable(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
    }
}
