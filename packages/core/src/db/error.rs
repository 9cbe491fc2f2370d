//! Store Error Types
//!
//! Errors raised by the storage collaborators (field store, record store,
//! transactional provider). The transaction runner only inspects
//! [`StoreError::is_contention`]; every other variant aborts the unit of work.

use thiserror::Error;

/// Storage operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Caller supplied a stale version (optimistic concurrency)
    ///
    /// Not retried: the caller read stale data and must re-read.
    #[error("Version conflict on record {id}: expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: i64, actual: i64 },

    /// Deadlock or serialization failure; safe to retry the whole unit of work
    #[error("Transaction contention: {0}")]
    Contention(String),

    /// Entity with the same key already exists
    #[error("{entity} already exists: {id}")]
    DuplicateKey { entity: &'static str, id: String },

    /// Backend unreachable or failing
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn record_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Record",
            id: id.into(),
        }
    }

    pub fn field_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Field",
            id: id.into(),
        }
    }

    pub fn version_conflict(id: impl Into<String>, expected: i64, actual: i64) -> Self {
        Self::VersionConflict {
            id: id.into(),
            expected,
            actual,
        }
    }

    pub fn contention(msg: impl Into<String>) -> Self {
        Self::Contention(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Whether the failure is transient contention worth retrying
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
