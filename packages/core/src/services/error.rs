//! Service Layer Error Types
//!
//! [`EngineError`] is what every public engine operation returns. Per-field
//! calculation errors never appear here: they are recovered inside the
//! orchestrator and reported on the outcome instead.

use crate::db::StoreError;
use crate::graph::GraphError;
use crate::models::ValidationError;
use std::time::Duration;
use thiserror::Error;

/// Engine operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Input rejected before anything was written
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Field dependencies cannot be ordered
    #[error("Dependency graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// Contention persisted through every retry
    #[error("Retry budget exhausted after {attempts} attempt(s): {last_error}")]
    RetryBudgetExhausted {
        attempts: u32,
        last_error: Box<EngineError>,
    },

    /// The unit of work did not finish before its deadline; nothing was committed
    #[error("Unit of work timed out after {0:?}")]
    Timeout(Duration),

    /// Calculation dispatch was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Record not found: {id}")]
    RecordNotFound { id: String },

    #[error("Field not found: {id}")]
    FieldNotFound { id: String },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Collaborator failure outside the store (evaluator crash, task panic)
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),
}

impl EngineError {
    pub fn record_not_found(id: impl Into<String>) -> Self {
        Self::RecordNotFound { id: id.into() }
    }

    pub fn field_not_found(id: impl Into<String>) -> Self {
        Self::FieldNotFound { id: id.into() }
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Whether the transaction runner should retry the unit of work
    pub fn is_contention(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_contention())
    }

    /// Whether this is a validation rejection, including cycle detection
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::Graph(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_classification() {
        assert!(EngineError::from(StoreError::contention("deadlock")).is_contention());
        assert!(!EngineError::from(StoreError::version_conflict("r", 1, 2)).is_contention());
        assert!(!EngineError::Timeout(Duration::from_secs(1)).is_contention());
    }

    #[test]
    fn test_exhausted_message_includes_last_error() {
        let err = EngineError::RetryBudgetExhausted {
            attempts: 4,
            last_error: Box::new(StoreError::contention("deadlock").into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempt(s)"));
        assert!(msg.contains("deadlock"));
    }
}
