//! Error types for the Kinto state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate key, version mismatch, or a write the current record
    /// state does not allow.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    Conflict,
    /// Transient: the backend could not be reached or a transaction failed.
    Unavailable,
    /// A stored record could not be encoded or decoded.
    Corrupt,
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::NotFound(_) => StoreErrorKind::NotFound,
            StoreError::Conflict(_) => StoreErrorKind::Conflict,
            StoreError::Serialize(_) | StoreError::Deserialize(_) => StoreErrorKind::Corrupt,
            StoreError::Open(_)
            | StoreError::Transaction(_)
            | StoreError::Table(_)
            | StoreError::Read(_)
            | StoreError::Write(_)
            | StoreError::Unavailable(_) => StoreErrorKind::Unavailable,
        }
    }
}
