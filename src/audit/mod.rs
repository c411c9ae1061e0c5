//! Ledger/Audit Service
//!
//! Append-only change history for every financial record, with a per-record
//! SHA-256 hash chain, plus the read side of the ledger (entries, summary,
//! capital/profit totals).
//!
//! History is appended only after the mutation it describes has succeeded.
//! A failed append is logged and never undoes that mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{LedgerError, OperationContext, OwnerId, Row};
use crate::projection::{CapitalProfitTotals, LedgerEntry, LedgerFilter, LedgerSummary, Pagination};
use crate::store::LedgerStore;

/// `previous_hash` of the first entry in every chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Default reversal reason when the caller gives none
pub const DEFAULT_REVERSAL_REASON: &str = "Reversed by owner";

// =========================================================================
// History entries
// =========================================================================

/// Kind of mutation a history entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Create,
    Update,
    Reverse,
    Delete,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Create => "create",
            HistoryAction::Update => "update",
            HistoryAction::Reverse => "reverse",
            HistoryAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(HistoryAction::Create),
            "update" => Some(HistoryAction::Update),
            "reverse" => Some(HistoryAction::Reverse),
            "delete" => Some(HistoryAction::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for a history entry about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub record_type: String,
    pub record_id: Uuid,
    pub action: HistoryAction,
    pub changes: Row,
    pub previous_values: Option<Row>,
    pub reason: Option<String>,
}

impl NewHistoryEntry {
    pub fn new(record_type: impl Into<String>, record_id: Uuid, action: HistoryAction) -> Self {
        Self {
            record_type: record_type.into(),
            record_id,
            action,
            changes: Row::new(),
            previous_values: None,
            reason: None,
        }
    }

    pub fn changes(mut self, changes: Row) -> Self {
        self.changes = changes;
        self
    }

    pub fn previous_values(mut self, previous: Row) -> Self {
        self.previous_values = Some(previous);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One immutable line of a record's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHistoryEntry {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub record_type: String,
    pub record_id: Uuid,
    /// 1-based position in the record's history
    pub sequence: i64,
    pub action: HistoryAction,
    pub changes: Row,
    pub previous_values: Option<Row>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub previous_hash: String,
    pub current_hash: String,
}

impl RecordHistoryEntry {
    /// Turn a new entry into the next link of a chain
    pub fn seal(owner: OwnerId, entry: NewHistoryEntry, sequence: i64, previous_hash: String) -> Self {
        let mut sealed = Self {
            id: Uuid::new_v4(),
            owner_id: owner.as_uuid(),
            record_type: entry.record_type,
            record_id: entry.record_id,
            sequence,
            action: entry.action,
            changes: entry.changes,
            previous_values: entry.previous_values,
            reason: entry.reason,
            created_at: Utc::now(),
            previous_hash,
            current_hash: String::new(),
        };
        sealed.current_hash = sealed.compute_hash();
        sealed
    }

    /// Hash over the entry's content and its predecessor's hash.
    /// `created_at` is left out: backends may truncate timestamp precision.
    pub fn compute_hash(&self) -> String {
        let hash_input = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.owner_id,
            self.record_type,
            self.record_id,
            self.sequence,
            self.action,
            serde_json::Value::Object(self.changes.clone()),
            self.previous_values
                .as_ref()
                .map(|v| serde_json::Value::Object(v.clone()).to_string())
                .unwrap_or_default(),
            self.reason.as_deref().unwrap_or_default(),
            self.previous_hash
        );
        sha256_hex(&hash_input)
    }
}

/// Result of hash chain verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerificationResult {
    pub is_valid: bool,
    pub entries_checked: u64,
    pub first_invalid_entry: Option<Uuid>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
}

impl ChainVerificationResult {
    fn valid(entries_checked: u64) -> Self {
        Self {
            is_valid: true,
            entries_checked,
            first_invalid_entry: None,
            expected_hash: None,
            actual_hash: None,
        }
    }

    fn broken(entries_checked: u64, id: Uuid, expected: String, actual: String) -> Self {
        Self {
            is_valid: false,
            entries_checked,
            first_invalid_entry: Some(id),
            expected_hash: Some(expected),
            actual_hash: Some(actual),
        }
    }
}

/// Walk a record's entries (ascending) and check sequence, linkage and hashes
pub fn verify_chain(entries: &[RecordHistoryEntry]) -> ChainVerificationResult {
    let mut previous_hash = GENESIS_HASH.to_string();

    for (index, entry) in entries.iter().enumerate() {
        let checked = index as u64 + 1;

        if entry.sequence != checked as i64 {
            return ChainVerificationResult::broken(
                checked,
                entry.id,
                checked.to_string(),
                entry.sequence.to_string(),
            );
        }

        if entry.previous_hash != previous_hash {
            return ChainVerificationResult::broken(
                checked,
                entry.id,
                previous_hash,
                entry.previous_hash.clone(),
            );
        }

        let calculated_hash = entry.compute_hash();
        if calculated_hash != entry.current_hash {
            return ChainVerificationResult::broken(
                checked,
                entry.id,
                calculated_hash,
                entry.current_hash.clone(),
            );
        }

        previous_hash = entry.current_hash.clone();
    }

    ChainVerificationResult::valid(entries.len() as u64)
}

/// Calculate SHA-256 hash and return as hex string
pub(crate) fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

// =========================================================================
// AuditService
// =========================================================================

/// Ledger/Audit Service
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn LedgerStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Append one history entry. Call only after the mutation succeeded.
    pub async fn append(
        &self,
        ctx: &OperationContext,
        entry: NewHistoryEntry,
    ) -> Result<Uuid, LedgerError> {
        let record_id = entry.record_id;
        let action = entry.action;

        let sealed = self
            .store
            .append_audit_entry(ctx.owner(), entry)
            .await
            .map_err(|source| LedgerError::AuditAppendFailed { record_id, source })?;

        tracing::debug!(
            history_id = %sealed.id,
            record_id = %record_id,
            action = %action,
            sequence = sealed.sequence,
            correlation_id = ?ctx.correlation_id,
            "History entry appended"
        );

        Ok(sealed.id)
    }

    /// Append after a successful mutation; failure is logged, not returned
    pub async fn append_best_effort(
        &self,
        ctx: &OperationContext,
        entry: NewHistoryEntry,
    ) -> Option<Uuid> {
        let record_id = entry.record_id;
        let action = entry.action;

        match self.append(ctx, entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(
                    record_id = %record_id,
                    action = %action,
                    owner_id = %ctx.owner(),
                    correlation_id = ?ctx.correlation_id,
                    error = %e,
                    "History append failed; mutation stands without its audit entry"
                );
                None
            }
        }
    }

    /// A record's history, oldest first
    pub async fn history(
        &self,
        ctx: &OperationContext,
        record_id: Uuid,
    ) -> Result<Vec<RecordHistoryEntry>, LedgerError> {
        Ok(self.store.fetch_history(ctx.owner(), record_id).await?)
    }

    /// Re-compute a record's hash chain
    pub async fn verify_history(
        &self,
        ctx: &OperationContext,
        record_id: Uuid,
    ) -> Result<ChainVerificationResult, LedgerError> {
        let entries = self.history(ctx, record_id).await?;
        let result = verify_chain(&entries);

        if !result.is_valid {
            tracing::error!(
                record_id = %record_id,
                first_invalid_entry = ?result.first_invalid_entry,
                "History hash chain is broken"
            );
        }

        Ok(result)
    }

    pub async fn list_entries(
        &self,
        ctx: &OperationContext,
        filter: &LedgerFilter,
        page: Pagination,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .store
            .fetch_ledger_entries(ctx.owner(), filter, page)
            .await?)
    }

    pub async fn summary(&self, ctx: &OperationContext) -> Result<LedgerSummary, LedgerError> {
        let entries = self
            .list_entries(ctx, &LedgerFilter::default(), Pagination::all())
            .await?;
        Ok(LedgerSummary::from_entries(&entries, Utc::now().date_naive()))
    }

    pub async fn capital_and_profit(
        &self,
        ctx: &OperationContext,
        filter: &LedgerFilter,
    ) -> Result<CapitalProfitTotals, LedgerError> {
        let entries = self.list_entries(ctx, filter, Pagination::all()).await?;
        Ok(CapitalProfitTotals::from_entries(&entries))
    }
}
