//! Two-Phase Commit Manager
//!
//! A financial record is first inserted provisional (pending, invisible to the
//! ledger) and then either confirmed or cancelled. [`PendingRecord`] owns the
//! provisional id; its settling methods consume it, so a record cannot be
//! confirmed after it was cancelled or confirmed twice.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditService, HistoryAction, NewHistoryEntry};
use crate::domain::{
    fields, invariants, FinancialRecord, LedgerError, OperationContext, RecordKind, RecordStatus,
    Row, Transition,
};
use crate::store::{LedgerStore, StoreError};

fn confirmed_fields() -> Row {
    fields([
        ("provisional", Value::Bool(false)),
        ("status", Value::from(RecordStatus::Confirmed.as_str())),
    ])
}

fn pending_guard() -> Row {
    fields([
        ("provisional", Value::Bool(true)),
        ("status", Value::from(RecordStatus::Pending.as_str())),
    ])
}

fn provisional_guard() -> Row {
    fields([("provisional", Value::Bool(true))])
}

/// Two-phase commit over the ledger store
#[derive(Clone)]
pub struct TwoPhaseCommit {
    store: Arc<dyn LedgerStore>,
    audit: AuditService,
}

impl TwoPhaseCommit {
    pub fn new(store: Arc<dyn LedgerStore>, audit: AuditService) -> Self {
        Self { store, audit }
    }

    // =========================================================================
    // Phase one
    // =========================================================================

    /// Validate and insert a record provisionally, returning its handle
    pub async fn begin(
        &self,
        ctx: &OperationContext,
        record: FinancialRecord,
    ) -> Result<PendingRecord, LedgerError> {
        let record = self.insert_provisional(ctx, record).await?;
        Ok(PendingRecord {
            commit: self.clone(),
            ctx: ctx.clone(),
            record,
            settled: false,
        })
    }

    /// Single provisional insert. Invariant violations are rejected before
    /// anything is written.
    pub async fn insert_provisional(
        &self,
        ctx: &OperationContext,
        mut record: FinancialRecord,
    ) -> Result<FinancialRecord, LedgerError> {
        invariants::validate_record(&record)?;

        let kind = record.kind();
        record.owner_id = ctx.owner_id();
        record.status = RecordStatus::Pending;
        record.provisional = true;

        let row = record
            .to_row()
            .map_err(|e| LedgerError::CreateFailed {
                kind,
                source: e.into(),
            })?;

        self.store
            .insert(ctx.owner(), kind.table(), row)
            .await
            .map_err(|source| {
                tracing::warn!(kind = %kind, error = %source, "Provisional insert failed");
                LedgerError::CreateFailed { kind, source }
            })?;

        tracing::debug!(
            record_id = %record.id,
            kind = %kind,
            amount = %record.amount,
            correlation_id = ?ctx.correlation_id,
            "Provisional record created"
        );

        Ok(record)
    }

    // =========================================================================
    // Phase two
    // =========================================================================

    /// Flip a pending provisional record to confirmed and write its `create`
    /// history entry
    pub async fn confirm_record(
        &self,
        ctx: &OperationContext,
        kind: RecordKind,
        record_id: Uuid,
    ) -> Result<FinancialRecord, LedgerError> {
        let row = self
            .store
            .update(
                ctx.owner(),
                kind.table(),
                record_id,
                confirmed_fields(),
                Some(&pending_guard()),
            )
            .await
            .map_err(|source| {
                tracing::warn!(record_id = %record_id, kind = %kind, error = %source, "Confirm failed");
                LedgerError::ConfirmFailed { record_id, source }
            })?;

        let record = FinancialRecord::from_row(row.clone())
            .map_err(|e| LedgerError::Store(e.into()))?;

        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(kind.as_str(), record_id, HistoryAction::Create).changes(row),
            )
            .await;

        tracing::info!(
            record_id = %record_id,
            kind = %kind,
            amount = %record.amount,
            "Record confirmed"
        );

        Ok(record)
    }

    /// Delete a record only while it is still provisional.
    /// A record that is already gone counts as cancelled.
    pub async fn cancel_record(
        &self,
        ctx: &OperationContext,
        kind: RecordKind,
        record_id: Uuid,
    ) -> Result<(), LedgerError> {
        match self
            .store
            .delete(ctx.owner(), kind.table(), record_id, Some(&provisional_guard()))
            .await
        {
            Ok(()) => {
                tracing::debug!(record_id = %record_id, kind = %kind, "Provisional record cancelled");
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!(record_id = %record_id, kind = %kind, "Cancel: record already gone");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                let from = self
                    .load(ctx, kind, record_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|r| r.status)
                    .unwrap_or(RecordStatus::Confirmed);
                Err(LedgerError::invalid_transition(
                    record_id,
                    from,
                    Transition::Cancel,
                ))
            }
            Err(source) => {
                tracing::error!(
                    record_id = %record_id,
                    kind = %kind,
                    owner_id = %ctx.owner(),
                    error = %source,
                    "Cancel failed: provisional record may be orphaned"
                );
                Err(LedgerError::CancelFailed { record_id, source })
            }
        }
    }

    /// Flag a stuck provisional record as failed. It leaves the provisional
    /// state so the ledger lists it (terminal, never counted in totals).
    pub async fn mark_failed(
        &self,
        ctx: &OperationContext,
        kind: RecordKind,
        record_id: Uuid,
    ) -> Result<(), LedgerError> {
        self.store
            .update(
                ctx.owner(),
                kind.table(),
                record_id,
                fields([
                    ("status", Value::from(RecordStatus::Failed.as_str())),
                    ("provisional", Value::Bool(false)),
                ]),
                Some(&pending_guard()),
            )
            .await?;

        tracing::warn!(record_id = %record_id, kind = %kind, "Provisional record marked failed");
        Ok(())
    }

    // =========================================================================
    // Composition
    // =========================================================================

    /// Begin and confirm in one call; any failure leaves nothing visible
    pub async fn create_confirmed(
        &self,
        ctx: &OperationContext,
        record: FinancialRecord,
    ) -> Result<FinancialRecord, LedgerError> {
        self.begin(ctx, record).await?.confirm_or_cancel().await
    }

    /// Insert provisionally, run `work` with the record id, then confirm on
    /// success or cancel on failure
    pub async fn run_scoped<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        record: FinancialRecord,
        work: F,
    ) -> Result<(FinancialRecord, T), LedgerError>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let pending = self.begin(ctx, record).await?;

        match work(pending.id()).await {
            Ok(value) => {
                let record = pending.confirm_or_cancel().await?;
                Ok((record, value))
            }
            Err(err) => {
                pending.cancel().await?;
                Err(err)
            }
        }
    }

    async fn load(
        &self,
        ctx: &OperationContext,
        kind: RecordKind,
        record_id: Uuid,
    ) -> Result<Option<FinancialRecord>, LedgerError> {
        match self.store.fetch(ctx.owner(), kind.table(), record_id).await? {
            Some(row) => Ok(Some(
                FinancialRecord::from_row(row).map_err(|e| LedgerError::Store(e.into()))?,
            )),
            None => Ok(None),
        }
    }
}

// =========================================================================
// PendingRecord
// =========================================================================

/// Handle to a provisional record.
///
/// Dropping an unsettled handle schedules a guarded cancel on the current
/// tokio runtime and logs a warning.
pub struct PendingRecord {
    commit: TwoPhaseCommit,
    ctx: OperationContext,
    record: FinancialRecord,
    settled: bool,
}

impl std::fmt::Debug for PendingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRecord")
            .field("record_id", &self.record.id)
            .field("kind", &self.record.kind())
            .field("settled", &self.settled)
            .finish()
    }
}

impl PendingRecord {
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn kind(&self) -> RecordKind {
        self.record.kind()
    }

    /// The record as inserted (pending, provisional)
    pub fn record(&self) -> &FinancialRecord {
        &self.record
    }

    /// Confirm the record. On failure the handle is dropped unsettled, which
    /// schedules a cancel; use [`confirm_or_cancel`](Self::confirm_or_cancel)
    /// to cancel inline.
    pub async fn confirm(mut self) -> Result<FinancialRecord, LedgerError> {
        let result = self
            .commit
            .confirm_record(&self.ctx, self.kind(), self.id())
            .await;
        self.settled = result.is_ok();
        result
    }

    /// Remove the provisional record
    pub async fn cancel(mut self) -> Result<(), LedgerError> {
        self.settled = true;
        self.commit
            .cancel_record(&self.ctx, self.kind(), self.id())
            .await
    }

    /// Confirm; if that fails, cancel before surfacing the confirm error.
    /// If the cancel fails too, the record is flagged failed and
    /// `CancelFailed` is returned.
    pub async fn confirm_or_cancel(mut self) -> Result<FinancialRecord, LedgerError> {
        self.settled = true;
        let (kind, id) = (self.kind(), self.id());

        let confirm_err = match self.commit.confirm_record(&self.ctx, kind, id).await {
            Ok(record) => return Ok(record),
            Err(e) => e,
        };

        match self.commit.cancel_record(&self.ctx, kind, id).await {
            Ok(()) => Err(confirm_err),
            Err(LedgerError::InvalidTransition { .. }) => {
                // The confirm reached the store even though it reported failure
                match self.commit.load(&self.ctx, kind, id).await {
                    Ok(Some(record))
                        if record.status == RecordStatus::Confirmed && !record.provisional =>
                    {
                        tracing::warn!(record_id = %id, "Confirm reported failure but record is confirmed");
                        Ok(record)
                    }
                    _ => Err(confirm_err),
                }
            }
            Err(cancel_err) => {
                if let Err(mark_err) = self.commit.mark_failed(&self.ctx, kind, id).await {
                    tracing::error!(
                        record_id = %id,
                        kind = %kind,
                        error = %mark_err,
                        "Could not flag stuck provisional record as failed"
                    );
                }
                tracing::error!(
                    record_id = %id,
                    kind = %kind,
                    confirm_error = %confirm_err,
                    cancel_error = %cancel_err,
                    "Record can be neither confirmed nor cancelled; manual intervention required"
                );
                Err(cancel_err)
            }
        }
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let (kind, id) = (self.kind(), self.id());
        tracing::warn!(record_id = %id, kind = %kind, "Pending record dropped unsettled; cancelling");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let commit = self.commit.clone();
                let ctx = self.ctx.clone();
                runtime.spawn(async move {
                    let _ = commit.cancel_record(&ctx, kind, id).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    record_id = %id,
                    kind = %kind,
                    "No runtime to cancel dropped pending record; it stays provisional"
                );
            }
        }
    }
}
