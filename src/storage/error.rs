//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Argument rejected before any I/O was attempted
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Entry position does not fall inside the written region of a block
    #[error("Position {position} outside of block range [{start}, {end})")]
    PositionOutOfBounds { position: u64, start: u64, end: u64 },

    /// Key already present (duplicate username on insert)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Key or record missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timestamp earlier than the highest one already stored
    #[error("Out of order timestamp: {timestamp} is earlier than stored maximum {highest}")]
    OutOfOrder { timestamp: i64, highest: i64 },

    /// Data corruption detected (bad header, impossible pointer, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// A coalesced block creation failed before this caller's entry was written
    #[error("Block creation failed: {0}")]
    CreationFailed(String),
}

impl StorageError {
    /// Rejected before touching disk
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidArgument(_) | StorageError::PositionOutOfBounds { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Out-of-order data or a damaged file; signals a bug upstream
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            StorageError::OutOfOrder { .. } | StorageError::Corruption(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StorageError::Lock(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
