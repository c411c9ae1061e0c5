//! Store Errors
//!
//! Error types for persistence operations.

use uuid::Uuid;

use crate::domain::Table;

/// Errors that can occur in a ledger store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Compare-and-swap precondition did not hold
    #[error("Concurrent modification of {table} {id}")]
    Conflict { table: Table, id: Uuid },

    /// Row not found (or not owned by the caller)
    #[error("{table} {id} not found")]
    NotFound { table: Table, id: Uuid },

    /// Backend unreachable or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Same idempotency key is still being processed
    #[error("Request with this idempotency key is still being processed")]
    IdempotencyInProgress,

    /// Idempotency key reused with a different request body
    #[error("Idempotency key was used with a different request")]
    IdempotencyMismatch,
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Transient backend failures (retrying may help)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::Unavailable(_) | StoreError::Database(_)
        )
    }
}
