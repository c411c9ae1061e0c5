//! Ledger Error Types
//!
//! Every failure the ledger core can report. Composite operations (two-phase
//! commit, sagas, reversals) wrap the underlying cause and keep it reachable
//! through `source()`.

use thiserror::Error;
use uuid::Uuid;

use super::record::{RecordKind, RecordStatus, Transition};
use crate::store::StoreError;

/// Errors raised by the ledger core
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Provisional insert of a record failed
    #[error("Failed to create {kind} record: {source}")]
    CreateFailed {
        kind: RecordKind,
        #[source]
        source: StoreError,
    },

    /// Confirming a provisional record failed
    #[error("Failed to confirm record {record_id}: {source}")]
    ConfirmFailed {
        record_id: Uuid,
        #[source]
        source: StoreError,
    },

    /// Removing a provisional record failed; the record may be orphaned
    #[error("Failed to cancel record {record_id}: {source}")]
    CancelFailed {
        record_id: Uuid,
        #[source]
        source: StoreError,
    },

    /// A saga step failed and every completed step was rolled back
    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<LedgerError>,
    },

    /// A saga step failed and at least one rollback also failed
    #[error("Step '{step}' failed ({cause}); {} rollback(s) failed: {}", .rollback_errors.len(), .rollback_errors.join("; "))]
    RollbackFailed {
        step: String,
        cause: String,
        rollback_errors: Vec<String>,
    },

    /// Lifecycle transition not allowed from the record's current state
    #[error("Cannot {action} record {record_id} in status {from}")]
    InvalidTransition {
        record_id: Uuid,
        from: RecordStatus,
        action: Transition,
    },

    /// Amount zero, negative, malformed or out of range
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Record (or supporting row) does not exist for this owner
    #[error("{record_type} {id} not found")]
    NotFound { record_type: String, id: Uuid },

    /// History entry could not be written
    #[error("Failed to append history for {record_id}: {source}")]
    AuditAppendFailed {
        record_id: Uuid,
        #[source]
        source: StoreError,
    },

    /// Not enough stock for a sale or restock reversal
    #[error("Insufficient stock for item {item_id}: available {available}, requested {requested}")]
    InsufficientStock {
        item_id: Uuid,
        available: i64,
        requested: i64,
    },

    /// Business rule violation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Optimistic concurrency check failed
    #[error("Concurrent modification of {table} {id}")]
    Conflict { table: String, id: Uuid },

    /// Idempotency key reused with a different request
    #[error("Idempotency key was used with a different request")]
    IdempotencyConflict,

    /// Request with this idempotency key is still running
    #[error("Request with this idempotency key is still being processed")]
    DuplicateInFlight,

    /// Store failure outside a composite operation
    #[error("Store error: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { table, id } => LedgerError::Conflict {
                table: table.to_string(),
                id,
            },
            StoreError::NotFound { table, id } => LedgerError::NotFound {
                record_type: table.to_string(),
                id,
            },
            StoreError::IdempotencyInProgress => LedgerError::DuplicateInFlight,
            StoreError::IdempotencyMismatch => LedgerError::IdempotencyConflict,
            other => LedgerError::Store(other),
        }
    }
}

impl LedgerError {
    pub fn not_found(record_type: impl Into<String>, id: Uuid) -> Self {
        Self::NotFound {
            record_type: record_type.into(),
            id,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_transition(record_id: Uuid, from: RecordStatus, action: Transition) -> Self {
        Self::InvalidTransition {
            record_id,
            from,
            action,
        }
    }

    /// Wrap a failure as the cause of a saga step
    pub fn step_failed(step: impl Into<String>, source: LedgerError) -> Self {
        Self::StepFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CreateFailed { .. } => "create_failed",
            Self::ConfirmFailed { .. } => "confirm_failed",
            Self::CancelFailed { .. } => "cancel_failed",
            Self::StepFailed { .. } => "step_failed",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::NotFound { .. } => "not_found",
            Self::AuditAppendFailed { .. } => "audit_append_failed",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::Validation(_) => "validation_error",
            Self::Conflict { .. } => "conflict",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::DuplicateInFlight => "duplicate_in_flight",
            Self::Store(_) => "store_error",
        }
    }

    /// The failed operation left no partial state behind, so the caller may
    /// retry it
    pub fn is_retry_safe(&self) -> bool {
        match self {
            Self::CreateFailed { .. }
            | Self::ConfirmFailed { .. }
            | Self::Conflict { .. }
            | Self::DuplicateInFlight
            | Self::Store(_) => true,
            Self::StepFailed { source, .. } => source.is_retry_safe(),
            _ => false,
        }
    }

    /// Partial state may remain; an operator has to look at it
    pub fn requires_manual_intervention(&self) -> bool {
        match self {
            Self::RollbackFailed { .. } | Self::CancelFailed { .. } => true,
            Self::StepFailed { source, .. } => source.requires_manual_intervention(),
            _ => false,
        }
    }

    /// Optimistic concurrency failure, possibly inside a step
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::StepFailed { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Check if this is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidTransition { .. }
            | Self::InvalidAmount(_)
            | Self::NotFound { .. }
            | Self::InsufficientStock { .. }
            | Self::Validation(_)
            | Self::IdempotencyConflict => true,
            Self::StepFailed { source, .. } => source.is_client_error(),
            _ => false,
        }
    }

    /// Innermost ledger error behind saga step wrappers
    pub fn root(&self) -> &LedgerError {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status code for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Self::StepFailed { source, .. } => source.http_status(),
            Self::InvalidAmount(_) | Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::InvalidTransition { .. }
            | Self::Conflict { .. }
            | Self::IdempotencyConflict
            | Self::DuplicateInFlight => 409,
            Self::InsufficientStock { .. } => 422,
            Self::Store(StoreError::Unavailable(_)) => 503,
            Self::CreateFailed { .. }
            | Self::ConfirmFailed { .. }
            | Self::CancelFailed { .. }
            | Self::RollbackFailed { .. }
            | Self::AuditAppendFailed { .. }
            | Self::Store(_) => 500,
        }
    }
}

impl From<super::amount::AmountError> for LedgerError {
    fn from(err: super::amount::AmountError) -> Self {
        LedgerError::InvalidAmount(err.to_string())
    }
}
