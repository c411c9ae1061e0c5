//! In-memory ledger store
//!
//! Rows are kept per owner behind one mutex that is never held across an
//! await. Failures can be injected per operation and table, so tests can make
//! any single store call fail.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{matches_precondition, row_id, LedgerStore, StoreError};
use crate::audit::{NewHistoryEntry, RecordHistoryEntry, GENESIS_HASH};
use crate::domain::{fields, FinancialRecord, OwnerId, RecordKind, RecordStatus, Row, Table};
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus, PROCESSING_TIMEOUT_MINUTES};
use crate::projection::{LedgerEntry, LedgerFilter, Pagination};

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Insert,
    Fetch,
    Update,
    Delete,
    AppendAudit,
    ReverseByType,
    FetchLedger,
    FetchHistory,
}

#[derive(Debug, Clone)]
struct Fault {
    op: StoreOp,
    table: Option<Table>,
    /// Matching calls to let through before failing
    skip: usize,
}

#[derive(Debug, Default)]
struct OwnerData {
    tables: HashMap<Table, BTreeMap<Uuid, Row>>,
    history: HashMap<Uuid, Vec<RecordHistoryEntry>>,
    idempotency: HashMap<Uuid, IdempotencyRecord>,
}

/// Ledger store backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    data: Mutex<HashMap<OwnerId, OwnerData>>,
    faults: Mutex<Vec<Fault>>,
    write_count: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next matching call fail. `table: None` matches any table.
    pub fn fail_next(&self, op: StoreOp, table: Option<Table>) {
        self.fail_nth(op, table, 0);
    }

    /// Let `skip` matching calls succeed, then fail the one after
    pub fn fail_nth(&self, op: StoreOp, table: Option<Table>, skip: usize) {
        lock(&self.faults).push(Fault { op, table, skip });
    }

    pub fn clear_failures(&self) {
        lock(&self.faults).clear();
    }

    /// Number of mutating calls (insert, update, delete, reverse) that reached
    /// the data
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Every row of one table for one owner
    pub fn rows(&self, owner: OwnerId, table: Table) -> Vec<Row> {
        lock(&self.data)
            .get(&owner)
            .and_then(|d| d.tables.get(&table))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_fault(&self, op: StoreOp, table: Option<Table>) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults);
        let position = faults.iter().position(|f| {
            f.op == op && (f.table.is_none() || table.is_none() || f.table == table)
        });

        if let Some(index) = position {
            if faults[index].skip > 0 {
                faults[index].skip -= 1;
                return Ok(());
            }
            faults.remove(index);
            let target = table.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
            tracing::debug!(op = ?op, table = %target, "Injected store failure");
            return Err(StoreError::Unavailable(format!(
                "injected failure: {:?} on {}",
                op, target
            )));
        }
        Ok(())
    }

    fn record_write(&self) {
        self.write_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert(&self, owner: OwnerId, table: Table, mut row: Row) -> Result<Row, StoreError> {
        self.check_fault(StoreOp::Insert, Some(table))?;

        let id = match row_id(&row) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                row.insert("id".into(), Value::from(id.to_string()));
                id
            }
        };
        row.insert("owner_id".into(), Value::from(owner.to_string()));

        let mut data = lock(&self.data);
        let rows = data
            .entry(owner)
            .or_default()
            .tables
            .entry(table)
            .or_default();
        if rows.contains_key(&id) {
            return Err(StoreError::Conflict { table, id });
        }
        rows.insert(id, row.clone());
        self.record_write();
        Ok(row)
    }

    async fn fetch(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
    ) -> Result<Option<Row>, StoreError> {
        self.check_fault(StoreOp::Fetch, Some(table))?;

        Ok(lock(&self.data)
            .get(&owner)
            .and_then(|d| d.tables.get(&table))
            .and_then(|rows| rows.get(&id))
            .cloned())
    }

    async fn update(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
        mut fields: Row,
        precondition: Option<&Row>,
    ) -> Result<Row, StoreError> {
        self.check_fault(StoreOp::Update, Some(table))?;

        fields.remove("id");
        fields.remove("owner_id");

        let mut data = lock(&self.data);
        let row = data
            .get_mut(&owner)
            .and_then(|d| d.tables.get_mut(&table))
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(StoreError::NotFound { table, id })?;

        if let Some(precondition) = precondition {
            if !matches_precondition(row, precondition) {
                return Err(StoreError::Conflict { table, id });
            }
        }

        row.extend(fields);
        self.record_write();
        Ok(row.clone())
    }

    async fn delete(
        &self,
        owner: OwnerId,
        table: Table,
        id: Uuid,
        precondition: Option<&Row>,
    ) -> Result<(), StoreError> {
        self.check_fault(StoreOp::Delete, Some(table))?;

        let mut data = lock(&self.data);
        let rows = data
            .get_mut(&owner)
            .and_then(|d| d.tables.get_mut(&table))
            .ok_or(StoreError::NotFound { table, id })?;
        let row = rows.get(&id).ok_or(StoreError::NotFound { table, id })?;

        if let Some(precondition) = precondition {
            if !matches_precondition(row, precondition) {
                return Err(StoreError::Conflict { table, id });
            }
        }

        rows.remove(&id);
        self.record_write();
        Ok(())
    }

    async fn append_audit_entry(
        &self,
        owner: OwnerId,
        entry: NewHistoryEntry,
    ) -> Result<RecordHistoryEntry, StoreError> {
        self.check_fault(StoreOp::AppendAudit, None)?;

        let mut data = lock(&self.data);
        let chain = data
            .entry(owner)
            .or_default()
            .history
            .entry(entry.record_id)
            .or_default();

        let previous_hash = chain
            .last()
            .map(|e| e.current_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let sealed =
            RecordHistoryEntry::seal(owner, entry, chain.len() as i64 + 1, previous_hash);
        chain.push(sealed.clone());
        Ok(sealed)
    }

    async fn reverse_by_type(
        &self,
        owner: OwnerId,
        kind: RecordKind,
        id: Uuid,
        reason: &str,
    ) -> Result<Row, StoreError> {
        let table = kind.table();
        self.check_fault(StoreOp::ReverseByType, Some(table))?;

        let mut data = lock(&self.data);
        let row = data
            .get_mut(&owner)
            .and_then(|d| d.tables.get_mut(&table))
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(StoreError::NotFound { table, id })?;

        let guard = fields([
            ("kind", Value::from(kind.as_str())),
            ("status", Value::from(RecordStatus::Confirmed.as_str())),
            ("provisional", Value::Bool(false)),
        ]);
        if !matches_precondition(row, &guard) {
            return Err(StoreError::Conflict { table, id });
        }

        let before = row.clone();
        row.extend(fields([
            ("status", Value::from(RecordStatus::Reversed.as_str())),
            ("reversal_reason", Value::from(reason)),
            ("reversed_at", Value::from(Utc::now().to_rfc3339())),
        ]));
        self.record_write();
        Ok(before)
    }

    async fn fetch_ledger_entries(
        &self,
        owner: OwnerId,
        filter: &LedgerFilter,
        page: Pagination,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.check_fault(StoreOp::FetchLedger, None)?;

        let rows: Vec<Row> = {
            let data = lock(&self.data);
            Table::financial()
                .iter()
                .filter_map(|table| data.get(&owner).and_then(|d| d.tables.get(table)))
                .flat_map(|rows| rows.values().cloned())
                .collect()
        };

        let mut records = rows
            .into_iter()
            .map(FinancialRecord::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        records.retain(|r| filter.matches(r));
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(page.apply(records.iter().map(LedgerEntry::from_record).collect()))
    }

    async fn fetch_history(
        &self,
        owner: OwnerId,
        record_id: Uuid,
    ) -> Result<Vec<RecordHistoryEntry>, StoreError> {
        self.check_fault(StoreOp::FetchHistory, None)?;

        Ok(lock(&self.data)
            .get(&owner)
            .and_then(|d| d.history.get(&record_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn start_idempotent(
        &self,
        owner: OwnerId,
        key: Uuid,
        request_hash: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut data = lock(&self.data);
        let keys = &mut data.entry(owner).or_default().idempotency;
        let now = Utc::now();

        if let Some(existing) = keys.get_mut(&key) {
            if existing.request_hash != request_hash {
                return Err(StoreError::IdempotencyMismatch);
            }
            match existing.status {
                IdempotencyStatus::Completed => return Ok(Some(existing.clone())),
                IdempotencyStatus::Processing
                    if (now - existing.processing_started_at).num_minutes()
                        < PROCESSING_TIMEOUT_MINUTES =>
                {
                    return Err(StoreError::IdempotencyInProgress);
                }
                // Failed, or processing for too long: take it over
                _ => {
                    existing.status = IdempotencyStatus::Processing;
                    existing.processing_started_at = now;
                    return Ok(None);
                }
            }
        }

        keys.insert(key, IdempotencyRecord::processing(key, request_hash));
        Ok(None)
    }

    async fn complete_idempotent(
        &self,
        owner: OwnerId,
        key: Uuid,
        response: Value,
    ) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        let record = data
            .get_mut(&owner)
            .and_then(|d| d.idempotency.get_mut(&key))
            .ok_or_else(|| StoreError::Unavailable(format!("idempotency key {} not found", key)))?;
        record.status = IdempotencyStatus::Completed;
        record.response = Some(response);
        Ok(())
    }

    async fn fail_idempotent(&self, owner: OwnerId, key: Uuid) -> Result<(), StoreError> {
        let mut data = lock(&self.data);
        if let Some(record) = data.get_mut(&owner).and_then(|d| d.idempotency.get_mut(&key)) {
            record.status = IdempotencyStatus::Failed;
        }
        Ok(())
    }
}
