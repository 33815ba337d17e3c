//! Error types for the index, the identifier functions, and the store boundary.

use std::io;

use thiserror::Error;

use crate::id::IdError;

/// Failure to compute a content identifier for one filesystem entry.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The entry did not have the length its stat snapshot promised.
    #[error("length mismatch: expected {expected} bytes, read {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// Errors raised at the [`Store`](crate::Store) boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item not found")]
    NotFound,

    #[error("item corrupted: expected {expected}, got {actual}")]
    Corrupted { expected: String, actual: String },

    #[error("store is read-only")]
    ReadOnly,

    #[error("operation not supported by this store")]
    Unsupported,

    #[error(transparent)]
    InvalidId(#[from] IdError),
}

/// Errors from tree index operations and metadata persistence.
#[derive(Debug, Error)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// A mid-refresh save failed; the refresh stopped early.
    #[error("checkpoint save failed: {source}")]
    Checkpoint {
        #[source]
        source: Box<CasError>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hash(#[from] HashError),
}

pub type Result<T, E = CasError> = std::result::Result<T, E>;
