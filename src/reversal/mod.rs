//! Reversal Engine
//!
//! Undoes a confirmed financial record without deleting its history. Single
//! table kinds are flipped in one guarded write; kinds that touched several
//! tables run a compensating saga so a partial reversal never sticks.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditService, HistoryAction, NewHistoryEntry, DEFAULT_REVERSAL_REASON};
use crate::domain::invariants::check_stock_change;
use crate::domain::{
    fields, FinancialRecord, InventoryItem, LedgerError, Money, OperationContext, RecordDetails,
    RecordKind, RecordStatus, Row, Table, Transition,
};
use crate::handlers::INVENTORY_ITEM;
use crate::saga::{CompareAndSwapStep, Saga};
use crate::store::{load, LedgerStore};

/// Precondition for flagging a row reversed
pub(crate) fn confirmed_guard() -> Row {
    fields([
        ("status", Value::from(RecordStatus::Confirmed.as_str())),
        ("provisional", Value::Bool(false)),
    ])
}

pub(crate) fn reversed_fields(reason: &str) -> Row {
    fields([
        ("status", Value::from(RecordStatus::Reversed.as_str())),
        ("reversal_reason", Value::from(reason)),
        ("reversed_at", Value::from(Utc::now().to_rfc3339())),
    ])
}

/// Rollback of `reversed_fields`
pub(crate) fn unreversed_fields() -> Row {
    fields([
        ("status", Value::from(RecordStatus::Confirmed.as_str())),
        ("reversal_reason", Value::Null),
        ("reversed_at", Value::Null),
    ])
}

fn quantity(q: i64) -> Row {
    fields([("quantity", Value::from(q))])
}

fn debt_balance(amount: Money, settled: bool) -> Row {
    fields([("amount", Value::from(amount)), ("settled", Value::Bool(settled))])
}

/// Balance precondition that also requires the debt to still be live
pub(crate) fn live_debt_balance(amount: Money, settled: bool) -> Row {
    let mut row = debt_balance(amount, settled);
    row.extend(confirmed_guard());
    row
}

/// Reversal Engine
#[derive(Clone)]
pub struct ReversalEngine {
    store: Arc<dyn LedgerStore>,
    audit: AuditService,
}

impl ReversalEngine {
    pub fn new(store: Arc<dyn LedgerStore>, audit: AuditService) -> Self {
        Self { store, audit }
    }

    /// Reverse a confirmed record. Anything else fails with
    /// `InvalidTransition` and changes nothing.
    pub async fn reverse(
        &self,
        ctx: &OperationContext,
        kind: RecordKind,
        record_id: Uuid,
        reason: Option<&str>,
    ) -> Result<FinancialRecord, LedgerError> {
        let (record, prior_row): (FinancialRecord, Row) = load(
            self.store.as_ref(),
            ctx.owner(),
            kind.table(),
            record_id,
            kind.as_str(),
        )
        .await?;

        // inventory_logs holds both sale and restock rows
        if record.kind() != kind {
            return Err(LedgerError::not_found(kind.as_str(), record_id));
        }

        let from = if record.provisional {
            RecordStatus::Pending
        } else {
            record.status
        };
        if record.provisional || from.apply(Transition::Reverse).is_none() {
            return Err(LedgerError::invalid_transition(
                record_id,
                from,
                Transition::Reverse,
            ));
        }

        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REVERSAL_REASON);

        tracing::info!(
            record_id = %record_id,
            kind = %kind,
            reason = %reason,
            correlation_id = ?ctx.correlation_id,
            "Reversing record"
        );

        if let Err(err) = self.dispatch(ctx, kind, &record, reason).await {
            return Err(self.explain_conflict(ctx, kind, record_id, err).await);
        }

        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(kind.as_str(), record_id, HistoryAction::Reverse)
                    .changes(reversed_fields(reason))
                    .previous_values(prior_row)
                    .reason(reason),
            )
            .await;

        let (reversed, _): (FinancialRecord, Row) = load(
            self.store.as_ref(),
            ctx.owner(),
            kind.table(),
            record_id,
            kind.as_str(),
        )
        .await?;

        tracing::info!(record_id = %record_id, kind = %kind, "Record reversed");
        Ok(reversed)
    }

    async fn dispatch(
        &self,
        ctx: &OperationContext,
        kind: RecordKind,
        record: &FinancialRecord,
        reason: &str,
    ) -> Result<(), LedgerError> {
        match &record.details {
            RecordDetails::Transfer | RecordDetails::Debt { .. } => {
                self.store
                    .reverse_by_type(ctx.owner(), kind, record.id, reason)
                    .await?;
            }
            RecordDetails::InventorySale {
                item_id,
                quantity_change,
                profit_record_id,
            } => {
                self.reverse_sale(ctx, record, *item_id, *quantity_change, *profit_record_id, reason)
                    .await?;
            }
            RecordDetails::InventoryAdd {
                item_id,
                quantity_change,
            } => {
                self.reverse_restock(ctx, record, *item_id, *quantity_change, reason)
                    .await?;
            }
            RecordDetails::DebtPayment { debt_id, .. } => {
                self.reverse_payment(ctx, record, *debt_id, reason).await?;
            }
        }
        Ok(())
    }

    /// A reversal that lost a race against another reversal of the same
    /// record reports the transition it attempted, not the store conflict
    async fn explain_conflict(
        &self,
        ctx: &OperationContext,
        kind: RecordKind,
        record_id: Uuid,
        err: LedgerError,
    ) -> LedgerError {
        if !err.is_conflict() {
            return err;
        }
        match load::<FinancialRecord>(
            self.store.as_ref(),
            ctx.owner(),
            kind.table(),
            record_id,
            kind.as_str(),
        )
        .await
        {
            Ok((current, _)) if current.status != RecordStatus::Confirmed => {
                LedgerError::invalid_transition(record_id, current.status, Transition::Reverse)
            }
            _ => err,
        }
    }

    /// Restore stock, flag the sale log, flag the profit record
    async fn reverse_sale(
        &self,
        ctx: &OperationContext,
        record: &FinancialRecord,
        item_id: Uuid,
        quantity_change: i64,
        profit_record_id: Option<Uuid>,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let (item, _): (InventoryItem, Row) = load(
            self.store.as_ref(),
            ctx.owner(),
            Table::InventoryItems,
            item_id,
            INVENTORY_ITEM,
        )
        .await?;
        let restored = check_stock_change(item.quantity, quantity_change.saturating_abs())?;

        let mut saga = Saga::new("reverse_inventory_sale")
            .step(CompareAndSwapStep::new(
                "restore_stock",
                &self.store,
                ctx,
                Table::InventoryItems,
                item_id,
                quantity(item.quantity),
                quantity(restored),
            ))
            .step(
                CompareAndSwapStep::new(
                    "flag_sale_log",
                    &self.store,
                    ctx,
                    Table::InventoryLogs,
                    record.id,
                    confirmed_guard(),
                    reversed_fields(reason),
                )
                .with_restore(unreversed_fields()),
            );

        if let Some(profit_id) = profit_record_id {
            saga = saga.step(
                CompareAndSwapStep::new(
                    "flag_profit",
                    &self.store,
                    ctx,
                    Table::Profits,
                    profit_id,
                    fields([("status", Value::from(RecordStatus::Confirmed.as_str()))]),
                    reversed_fields(reason),
                )
                .with_restore(unreversed_fields()),
            );
        }

        saga.run().await.into_result()?;

        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(INVENTORY_ITEM, item_id, HistoryAction::Update)
                    .changes(fields([
                        ("quantity", Value::from(restored)),
                        ("quantity_change", Value::from(quantity_change.saturating_abs())),
                        ("source_record_id", Value::from(record.id.to_string())),
                    ]))
                    .previous_values(quantity(item.quantity))
                    .reason(reason),
            )
            .await;
        Ok(())
    }

    /// Take the restocked units back out, flag the log
    async fn reverse_restock(
        &self,
        ctx: &OperationContext,
        record: &FinancialRecord,
        item_id: Uuid,
        quantity_change: i64,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let (item, _): (InventoryItem, Row) = load(
            self.store.as_ref(),
            ctx.owner(),
            Table::InventoryItems,
            item_id,
            INVENTORY_ITEM,
        )
        .await?;

        if item.quantity < quantity_change {
            return Err(LedgerError::InsufficientStock {
                item_id,
                available: item.quantity,
                requested: quantity_change,
            });
        }
        let remaining = check_stock_change(item.quantity, quantity_change.saturating_neg())?;

        Saga::new("reverse_inventory_add")
            .step(CompareAndSwapStep::new(
                "remove_stock",
                &self.store,
                ctx,
                Table::InventoryItems,
                item_id,
                quantity(item.quantity),
                quantity(remaining),
            ))
            .step(
                CompareAndSwapStep::new(
                    "flag_restock_log",
                    &self.store,
                    ctx,
                    Table::InventoryLogs,
                    record.id,
                    confirmed_guard(),
                    reversed_fields(reason),
                )
                .with_restore(unreversed_fields()),
            )
            .run()
            .await
            .into_result()?;

        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(INVENTORY_ITEM, item_id, HistoryAction::Update)
                    .changes(fields([
                        ("quantity", Value::from(remaining)),
                        ("quantity_change", Value::from(quantity_change.saturating_neg())),
                        ("source_record_id", Value::from(record.id.to_string())),
                    ]))
                    .previous_values(quantity(item.quantity))
                    .reason(reason),
            )
            .await;
        Ok(())
    }

    /// Add the payment back to the debt's outstanding balance, flag the payment
    async fn reverse_payment(
        &self,
        ctx: &OperationContext,
        record: &FinancialRecord,
        debt_id: Uuid,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let (debt, _): (FinancialRecord, Row) = load(
            self.store.as_ref(),
            ctx.owner(),
            Table::Debts,
            debt_id,
            "debt",
        )
        .await?;

        let RecordDetails::Debt { settled, .. } = debt.details else {
            return Err(LedgerError::not_found("debt", debt_id));
        };
        // A reversed debt is terminal; its payments stay as they are
        if debt.provisional || debt.status != RecordStatus::Confirmed {
            return Err(LedgerError::invalid_transition(
                debt_id,
                debt.status,
                Transition::Reverse,
            ));
        }
        let outstanding = debt.outstanding().unwrap_or_else(Money::zero);
        let restored = outstanding.checked_add(record.amount)?;

        let expected = live_debt_balance(debt.amount, settled);
        let desired = debt_balance(restored, false);

        Saga::new("reverse_debt_payment")
            .step(CompareAndSwapStep::new(
                "restore_debt",
                &self.store,
                ctx,
                Table::Debts,
                debt_id,
                expected.clone(),
                desired.clone(),
            ))
            .step(
                CompareAndSwapStep::new(
                    "flag_payment",
                    &self.store,
                    ctx,
                    Table::DebtPayments,
                    record.id,
                    confirmed_guard(),
                    reversed_fields(reason),
                )
                .with_restore(unreversed_fields()),
            )
            .run()
            .await
            .into_result()?;

        let mut changes = desired;
        changes.insert("payment_reversed".into(), Value::from(record.amount));
        changes.insert("remaining_balance".into(), Value::from(restored));
        changes.insert("payment_id".into(), Value::from(record.id.to_string()));

        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(RecordKind::Debt.as_str(), debt_id, HistoryAction::Update)
                    .changes(changes)
                    .previous_values(expected)
                    .reason(reason),
            )
            .await;
        Ok(())
    }
}
