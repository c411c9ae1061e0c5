//! Ledger Store Adapter
//!
//! The persistence boundary. Every call is scoped by an [`OwnerId`], which
//! can only be taken from an [`OperationContext`](crate::domain::OperationContext),
//! so a caller cannot address another owner's rows.
//!
//! Mutations accept an optional precondition: a set of fields the stored row
//! must currently hold. A mismatch is a [`StoreError::Conflict`] and is never
//! retried here.

mod error;
mod memory;
mod postgres;

pub use error::StoreError;
pub use memory::{InMemoryLedgerStore, StoreOp};
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{NewHistoryEntry, RecordHistoryEntry};
use crate::domain::{OwnerId, RecordKind, Row, Table};
use crate::idempotency::IdempotencyRecord;
use crate::projection::{LedgerEntry, LedgerFilter, Pagination};

/// Persistence operations the ledger core relies on
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a row; `id` is taken from the row and `owner_id` is forced to `owner`
    async fn insert(&self, owner: OwnerId, table: Table, row: Row) -> Result<Row, StoreError>;

    async fn fetch(&self, owner: OwnerId, table: Table, id: Uuid)
        -> Result<Option<Row>, StoreError>;

    /// Merge `fields` into the row, if it still matches `precondition`
    async fn update(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
        fields: Row,
        precondition: Option<&Row>,
    ) -> Result<Row, StoreError>;

    /// Delete the row, if it still matches `precondition`
    async fn delete(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
        precondition: Option<&Row>,
    ) -> Result<(), StoreError>;

    /// Append to a record's history; the store assigns sequence and hash link
    async fn append_audit_entry(
        &self,
        owner: OwnerId,
        entry: NewHistoryEntry,
    ) -> Result<RecordHistoryEntry, StoreError>;

    /// Flag a confirmed single-table record reversed in one guarded write.
    /// Returns the row as it was before.
    async fn reverse_by_type(
        &self,
        owner: OwnerId,
        kind: RecordKind,
        id: Uuid,
        reason: &str,
    ) -> Result<Row, StoreError>;

    /// Non-provisional financial records, newest first
    async fn fetch_ledger_entries(
        &self,
        owner: OwnerId,
        filter: &LedgerFilter,
        page: Pagination,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// History of one record, ascending by sequence
    async fn fetch_history(
        &self,
        owner: OwnerId,
        record_id: Uuid,
    ) -> Result<Vec<RecordHistoryEntry>, StoreError>;

    /// Claim an idempotency key.
    /// `Ok(None)`: the caller should run the operation.
    /// `Ok(Some(record))`: already completed, replay `record.response`.
    async fn start_idempotent(
        &self,
        owner: OwnerId,
        key: Uuid,
        request_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn complete_idempotent(
        &self,
        owner: OwnerId,
        key: Uuid,
        response: Value,
    ) -> Result<(), StoreError>;

    async fn fail_idempotent(&self, owner: OwnerId, key: Uuid) -> Result<(), StoreError>;
}

/// Fetch a row and deserialize it, keeping the raw row for history snapshots
pub async fn load<T: serde::de::DeserializeOwned>(
    store: &dyn LedgerStore,
    owner: OwnerId,
    table: Table,
    id: Uuid,
    record_type: &str,
) -> Result<(T, Row), crate::domain::LedgerError> {
    let row = store
        .fetch(owner, table, id)
        .await?
        .ok_or_else(|| crate::domain::LedgerError::not_found(record_type, id))?;
    let value = crate::domain::record::from_row(row.clone()).map_err(StoreError::from)?;
    Ok((value, row))
}

/// Whether `row` holds every field of `precondition`
pub fn matches_precondition(row: &Row, precondition: &Row) -> bool {
    precondition
        .iter()
        .all(|(field, expected)| row.get(field).unwrap_or(&Value::Null) == expected)
}

/// Row id as stored in its `id` field
pub fn row_id(row: &Row) -> Option<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fields;

    #[test]
    fn test_matches_precondition() {
        let row = fields([
            ("quantity", Value::from(10)),
            ("status", Value::from("confirmed")),
        ]);

        assert!(matches_precondition(&row, &Row::new()));
        assert!(matches_precondition(&row, &fields([("quantity", Value::from(10))])));
        assert!(!matches_precondition(&row, &fields([("quantity", Value::from(9))])));
        assert!(!matches_precondition(&row, &fields([("settled", Value::from(false))])));
        assert!(matches_precondition(&row, &fields([("missing", Value::Null)])));
    }

    #[test]
    fn test_row_id() {
        let id = Uuid::new_v4();
        assert_eq!(row_id(&fields([("id", Value::from(id.to_string()))])), Some(id));
        assert_eq!(row_id(&Row::new()), None);
    }
}
