//! Reusable saga steps over the ledger store

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use super::SagaStep;
use crate::commit::TwoPhaseCommit;
use crate::domain::{FinancialRecord, LedgerError, OperationContext, RecordKind, Row, Table};
use crate::store::{LedgerStore, StoreError};

/// Insert a financial record provisionally; rollback cancels it
pub struct ProvisionalInsertStep {
    name: String,
    commit: TwoPhaseCommit,
    ctx: OperationContext,
    kind: RecordKind,
    id: Uuid,
    record: Option<FinancialRecord>,
}

impl ProvisionalInsertStep {
    pub fn new(
        name: impl Into<String>,
        commit: &TwoPhaseCommit,
        ctx: &OperationContext,
        record: FinancialRecord,
    ) -> Self {
        Self {
            name: name.into(),
            commit: commit.clone(),
            ctx: ctx.clone(),
            kind: record.kind(),
            id: record.id,
            record: Some(record),
        }
    }
}

#[async_trait]
impl SagaStep for ProvisionalInsertStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) -> Result<(), LedgerError> {
        let record = self
            .record
            .take()
            .ok_or_else(|| LedgerError::validation("provisional insert already executed"))?;
        self.commit.insert_provisional(&self.ctx, record).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LedgerError> {
        self.commit.cancel_record(&self.ctx, self.kind, self.id).await
    }
}

/// Insert a supporting row; rollback deletes it
pub struct InsertRowStep {
    name: String,
    store: Arc<dyn LedgerStore>,
    ctx: OperationContext,
    table: Table,
    id: Uuid,
    row: Row,
}

impl InsertRowStep {
    pub fn new(
        name: impl Into<String>,
        store: &Arc<dyn LedgerStore>,
        ctx: &OperationContext,
        table: Table,
        id: Uuid,
        row: Row,
    ) -> Self {
        Self {
            name: name.into(),
            store: store.clone(),
            ctx: ctx.clone(),
            table,
            id,
            row,
        }
    }
}

#[async_trait]
impl SagaStep for InsertRowStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) -> Result<(), LedgerError> {
        self.store
            .insert(self.ctx.owner(), self.table, self.row.clone())
            .await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LedgerError> {
        match self
            .store
            .delete(self.ctx.owner(), self.table, self.id, None)
            .await
        {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Optimistic update: write `desired` only while the row still holds
/// `expected`. Rollback writes `restore` (default: `expected`) only while the
/// row still holds `desired`.
pub struct CompareAndSwapStep {
    name: String,
    store: Arc<dyn LedgerStore>,
    ctx: OperationContext,
    table: Table,
    id: Uuid,
    expected: Row,
    desired: Row,
    restore: Option<Row>,
}

impl CompareAndSwapStep {
    pub fn new(
        name: impl Into<String>,
        store: &Arc<dyn LedgerStore>,
        ctx: &OperationContext,
        table: Table,
        id: Uuid,
        expected: Row,
        desired: Row,
    ) -> Self {
        Self {
            name: name.into(),
            store: store.clone(),
            ctx: ctx.clone(),
            table,
            id,
            expected,
            desired,
            restore: None,
        }
    }

    /// Fields to write on rollback when they differ from `expected`
    /// (e.g. clearing fields the forward write added)
    pub fn with_restore(mut self, restore: Row) -> Self {
        self.restore = Some(restore);
        self
    }
}

#[async_trait]
impl SagaStep for CompareAndSwapStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) -> Result<(), LedgerError> {
        self.store
            .update(
                self.ctx.owner(),
                self.table,
                self.id,
                self.desired.clone(),
                Some(&self.expected),
            )
            .await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LedgerError> {
        let restore = self.restore.clone().unwrap_or_else(|| self.expected.clone());
        self.store
            .update(
                self.ctx.owner(),
                self.table,
                self.id,
                restore,
                Some(&self.desired),
            )
            .await?;
        Ok(())
    }
}

/// Confirm a provisional record. Meant as the last step: once confirmed, the
/// record is only undone through a reversal.
pub struct ConfirmStep {
    name: String,
    commit: TwoPhaseCommit,
    ctx: OperationContext,
    kind: RecordKind,
    id: Uuid,
}

impl ConfirmStep {
    pub fn new(
        name: impl Into<String>,
        commit: &TwoPhaseCommit,
        ctx: &OperationContext,
        kind: RecordKind,
        id: Uuid,
    ) -> Self {
        Self {
            name: name.into(),
            commit: commit.clone(),
            ctx: ctx.clone(),
            kind,
            id,
        }
    }
}

#[async_trait]
impl SagaStep for ConfirmStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) -> Result<(), LedgerError> {
        self.commit.confirm_record(&self.ctx, self.kind, self.id).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), LedgerError> {
        tracing::warn!(
            step = %self.name,
            record_id = %self.id,
            "Confirmed record left in place during rollback"
        );
        Ok(())
    }
}
