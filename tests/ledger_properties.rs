//! Ledger Integration Tests
//!
//! End-to-end properties of the engine over the in-memory store: atomic
//! creation, all-or-nothing sagas, reversals, debt payments and optimistic
//! concurrency on stock.

use biz_ledger::audit::HistoryAction;
use biz_ledger::domain::{RecordDetails, Table};
use biz_ledger::handlers::{PayDebtCommand, RestockInventoryCommand, SellInventoryCommand};
use biz_ledger::projection::{LedgerFilter, Pagination};
use biz_ledger::store::StoreOp;
use biz_ledger::{LedgerError, RecordKind, RecordStatus};
use rust_decimal_macros::dec;
use serde_json::Value;

mod common;

// =========================================================================
// Two-phase commit
// =========================================================================

#[tokio::test]
async fn test_failed_confirm_leaves_nothing_visible() {
    let t = common::ledger();
    t.memory.fail_next(StoreOp::Update, Some(Table::Transfers));

    let err = t
        .engine
        .transfers
        .record(
            &t.ctx,
            biz_ledger::handlers::RecordTransferCommand::new(
                biz_ledger::domain::SubType::Income,
                "120",
            ),
        )
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "confirm_failed");
    assert!(err.is_retry_safe());
    assert!(t.rows(Table::Transfers).is_empty());

    let entries = t
        .engine
        .audit
        .list_entries(&t.ctx, &LedgerFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_failed_confirm_and_cancel_flags_record_failed() {
    let t = common::ledger();
    t.memory.fail_next(StoreOp::Update, Some(Table::Transfers));
    t.memory.fail_next(StoreOp::Delete, Some(Table::Transfers));

    let err = t
        .engine
        .transfers
        .record(
            &t.ctx,
            biz_ledger::handlers::RecordTransferCommand::new(
                biz_ledger::domain::SubType::Expense,
                "80",
            ),
        )
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "cancel_failed");
    assert!(err.requires_manual_intervention());

    // Left behind as a terminal failed entry: listed, never counted
    let rows = t.rows(Table::Transfers);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "failed");
    assert_eq!(rows[0]["provisional"], false);

    let summary = t.engine.audit.summary(&t.ctx).await.unwrap();
    assert_eq!(summary.total_entries, 1);
    assert_eq!(summary.active_entries, 0);
    assert_eq!(summary.reversed_or_deleted_entries, 1);

    let totals = t
        .engine
        .audit
        .capital_and_profit(&t.ctx, &LedgerFilter::default())
        .await
        .unwrap();
    assert_eq!(totals.capital_out, dec!(0));
}

#[tokio::test]
async fn test_dropped_pending_record_is_cancelled() {
    let t = common::ledger();
    let record = biz_ledger::FinancialRecord::new(
        t.ctx.owner_id(),
        biz_ledger::domain::SubType::Expense,
        biz_ledger::Money::new(dec!(9.99)).unwrap(),
        RecordDetails::Transfer,
    );

    let pending = t.engine.commit.begin(&t.ctx, record).await.unwrap();
    assert_eq!(t.rows(Table::Transfers).len(), 1);
    drop(pending);

    for _ in 0..10 {
        if t.rows(Table::Transfers).is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(t.rows(Table::Transfers).is_empty());
}

#[tokio::test]
async fn test_confirm_writes_single_create_entry() {
    let t = common::ledger();
    let record = t.expense("45.00").await;

    let history = t.history(record.id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Create);
    assert_eq!(history[0].sequence, 1);
    assert!(history[0].previous_values.is_none());
}

// =========================================================================
// Sagas
// =========================================================================

/// Pens: 10 in stock with a margin of 2 per unit; selling 3 leaves 7, one
/// sale log of -3 and a profit record of 6
#[tokio::test]
async fn test_pens_sale_writes_log_and_profit() {
    let t = common::ledger();
    let pens = t.pens().await;

    let sale = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(3))
        .await
        .unwrap();

    assert_eq!(t.quantity(pens.id).await, 7);

    let logs = t.rows(Table::InventoryLogs);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["id"], sale.sale.id.to_string());
    assert_eq!(logs[0]["quantity_change"], -3);
    assert_eq!(logs[0]["status"], "confirmed");

    let profits = t.rows(Table::Profits);
    assert_eq!(profits.len(), 1);
    assert_eq!(profits[0]["amount"], "6.0000");
    assert_eq!(profits[0]["sale_log_id"], sale.sale.id.to_string());
}

#[tokio::test]
async fn test_sale_capital_and_profit_add_up_to_cash_received() {
    let t = common::ledger();
    let pens = t.pens().await;
    let unit_price = pens.unit_price().unwrap();

    t.engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(3))
        .await
        .unwrap();

    let totals = t
        .engine
        .audit
        .capital_and_profit(&t.ctx, &LedgerFilter::default())
        .await
        .unwrap();
    let cash_received = unit_price.times(3).unwrap().value();

    assert_eq!(totals.capital_in, dec!(4.5));
    assert_eq!(totals.profit, dec!(6));
    assert_eq!(totals.capital_in + totals.profit, cash_received);
}

/// Pens: 10 in stock, the profit insert fails, the sale leaves no trace
#[tokio::test]
async fn test_pens_sale_rolls_back_when_profit_insert_fails() {
    let t = common::ledger();
    let pens = t.pens().await;
    t.memory.fail_next(StoreOp::Insert, Some(Table::Profits));

    let err = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(3))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "step_failed");
    assert!(err.is_retry_safe());
    assert_eq!(t.quantity(pens.id).await, 10);
    assert!(t.rows(Table::InventoryLogs).is_empty());
    assert!(t.rows(Table::Profits).is_empty());

    // Only the item's own create entry
    assert_eq!(t.history(pens.id).await.len(), 1);
}

#[tokio::test]
async fn test_rollback_failure_is_reported() {
    let t = common::ledger();
    let pens = t.pens().await;
    // Profit insert fails, then restoring the stock fails too
    t.memory.fail_next(StoreOp::Insert, Some(Table::Profits));
    t.memory.fail_nth(StoreOp::Update, Some(Table::InventoryItems), 1);

    let err = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(3))
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "rollback_failed");
    assert!(err.requires_manual_intervention());
    // The provisional sale log was still cancelled
    assert!(t.rows(Table::InventoryLogs).is_empty());
    assert_eq!(t.quantity(pens.id).await, 7);
}

#[tokio::test]
async fn test_concurrent_sales_from_same_snapshot() {
    let t = common::ledger();
    let pens = t.pens().await;
    let snapshot = t.engine.inventory.get_item(&t.ctx, pens.id).await.unwrap();

    let (first, second) = tokio::join!(
        t.engine
            .inventory
            .sell_against(&t.ctx, &snapshot, SellInventoryCommand::new(3)),
        t.engine
            .inventory
            .sell_against(&t.ctx, &snapshot, SellInventoryCommand::new(3)),
    );

    let results = [first, second];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);

    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(loser.is_conflict());

    assert_eq!(t.quantity(pens.id).await, 7);
    assert_eq!(t.rows(Table::InventoryLogs).len(), 1);
    assert_eq!(t.rows(Table::Profits).len(), 1);
}

#[tokio::test]
async fn test_stock_never_goes_negative() {
    let t = common::ledger();
    let pens = t.pens().await;

    t.engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(10))
        .await
        .unwrap();

    let err = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(1))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientStock { available: 0, .. }));
    assert_eq!(t.quantity(pens.id).await, 0);
}

// =========================================================================
// Reversals
// =========================================================================

#[tokio::test]
async fn test_reversal_writes_exactly_one_entry() {
    let t = common::ledger();
    let record = t.expense("300").await;

    let reversed = t
        .engine
        .reversal
        .reverse(&t.ctx, RecordKind::Transfer, record.id, Some("Duplicate entry"))
        .await
        .unwrap();
    assert_eq!(reversed.status, RecordStatus::Reversed);

    let history = t.history(record.id).await;
    assert_eq!(history.len(), 2);
    let reverse = &history[1];
    assert_eq!(reverse.action, HistoryAction::Reverse);
    assert_eq!(reverse.reason.as_deref(), Some("Duplicate entry"));
    let previous = reverse.previous_values.as_ref().unwrap();
    assert_eq!(previous["status"], "confirmed");
    assert_eq!(previous["amount"], "300.0000");

    // A second attempt is rejected and adds nothing
    let err = t
        .engine
        .reversal
        .reverse(&t.ctx, RecordKind::Transfer, record.id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidTransition {
            from: RecordStatus::Reversed,
            ..
        }
    ));
    assert_eq!(t.history(record.id).await.len(), 2);

    let verification = t.engine.audit.verify_history(&t.ctx, record.id).await.unwrap();
    assert!(verification.is_valid);
}

#[tokio::test]
async fn test_reversal_uses_default_reason() {
    let t = common::ledger();
    let debt = t.debt_owed_to_me("75").await;

    t.engine
        .reversal
        .reverse(&t.ctx, RecordKind::Debt, debt.id, Some("   "))
        .await
        .unwrap();

    let history = t.history(debt.id).await;
    assert_eq!(history[1].reason.as_deref(), Some("Reversed by owner"));
}

#[tokio::test]
async fn test_reversal_of_unknown_or_mismatched_record() {
    let t = common::ledger();
    let pens = t.pens().await;
    let sale = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(1))
        .await
        .unwrap();

    let err = t
        .engine
        .reversal
        .reverse(&t.ctx, RecordKind::Transfer, uuid::Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "not_found");

    // A sale log is not a restock log
    let err = t
        .engine
        .reversal
        .reverse(&t.ctx, RecordKind::InventoryAdd, sale.sale.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "not_found");
}

#[tokio::test]
async fn test_sale_reversal_restores_everything() {
    let t = common::ledger();
    let pens = t.pens().await;
    let sale = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(4))
        .await
        .unwrap();
    assert_eq!(t.quantity(pens.id).await, 6);

    t.engine
        .reversal
        .reverse(&t.ctx, RecordKind::InventorySale, sale.sale.id, None)
        .await
        .unwrap();

    assert_eq!(t.quantity(pens.id).await, 10);
    let logs = t.rows(Table::InventoryLogs);
    assert_eq!(logs[0]["status"], "reversed");
    let profits = t.rows(Table::Profits);
    assert_eq!(profits[0]["status"], "reversed");

    let totals = t
        .engine
        .audit
        .capital_and_profit(&t.ctx, &LedgerFilter::default())
        .await
        .unwrap();
    assert_eq!(totals.capital_in, dec!(0));
    assert_eq!(totals.profit, dec!(0));
}

#[tokio::test]
async fn test_failed_sale_reversal_changes_nothing() {
    let t = common::ledger();
    let pens = t.pens().await;
    let sale = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(4))
        .await
        .unwrap();
    t.memory.fail_next(StoreOp::Update, Some(Table::Profits));

    let err = t
        .engine
        .reversal
        .reverse(&t.ctx, RecordKind::InventorySale, sale.sale.id, None)
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "step_failed");
    assert_eq!(t.quantity(pens.id).await, 6);
    let logs = t.rows(Table::InventoryLogs);
    assert_eq!(logs[0]["status"], "confirmed");
    assert_eq!(logs[0]["reversal_reason"], Value::Null);
    assert_eq!(t.history(sale.sale.id).await.len(), 1);
}

#[tokio::test]
async fn test_restock_reversal_needs_the_stock() {
    let t = common::ledger();
    let pens = t.pens().await;
    let restock = t
        .engine
        .inventory
        .restock(&t.ctx, pens.id, RestockInventoryCommand::new(5).with_cost("6.00"))
        .await
        .unwrap();
    assert_eq!(restock.quantity, 15);

    t.engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(12))
        .await
        .unwrap();

    let err = t
        .engine
        .reversal
        .reverse(&t.ctx, RecordKind::InventoryAdd, restock.restock.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "insufficient_stock");
    assert_eq!(t.quantity(pens.id).await, 3);

    t.engine
        .inventory
        .restock(&t.ctx, pens.id, RestockInventoryCommand::new(2))
        .await
        .unwrap();
    t.engine
        .reversal
        .reverse(&t.ctx, RecordKind::InventoryAdd, restock.restock.id, None)
        .await
        .unwrap();
    assert_eq!(t.quantity(pens.id).await, 0);
}

// =========================================================================
// Debts
// =========================================================================

/// 500 owed, paid as 200 then 300
#[tokio::test]
async fn test_debt_paid_in_two_installments() {
    let t = common::ledger();
    let debt = t.debt_owed_to_me("500").await;

    let first = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("200"))
        .await
        .unwrap();
    assert_eq!(first.remaining_balance.value(), dec!(300));
    assert!(!first.settled);

    let second = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("300"))
        .await
        .unwrap();
    assert!(second.settled);
    assert!(second.remaining_balance.is_zero());

    let debts = t.rows(Table::Debts);
    assert_eq!(debts[0]["settled"], true);

    let history = t.history(debt.id).await;
    let updates: Vec<_> = history
        .iter()
        .filter(|h| h.action == HistoryAction::Update)
        .collect();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].changes["payment_amount"], "200.0000");
    assert_eq!(updates[0].changes["remaining_balance"], "300.0000");
    assert_eq!(updates[1].changes["payment_amount"], "300.0000");
    assert_eq!(updates[1].changes["remaining_balance"], "0.0000");
    assert_eq!(updates[1].changes["settled"], true);

    // Nothing left to pay
    let err = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "invalid_amount");
}

#[tokio::test]
async fn test_partial_payment_conserves_balance() {
    let t = common::ledger();
    let debt = t.debt_owed_to_me("100").await;

    let result = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("30.25"))
        .await
        .unwrap();

    match result.payment.details {
        RecordDetails::DebtPayment {
            debt_amount_before,
            debt_amount_after,
            settled_debt,
            ..
        } => {
            assert_eq!(debt_amount_before.value(), dec!(100));
            assert_eq!(debt_amount_after.value(), dec!(69.75));
            assert_eq!(
                debt_amount_before.value() - result.payment.amount.value(),
                debt_amount_after.value()
            );
            assert!(!settled_debt);
        }
        other => panic!("unexpected details {:?}", other),
    }
    assert_eq!(t.rows(Table::Debts)[0]["amount"], "69.7500");
}

#[tokio::test]
async fn test_payment_reversals_restore_debt() {
    let t = common::ledger();
    let debt = t.debt_owed_to_me("500").await;
    let first = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("200"))
        .await
        .unwrap();
    let second = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("300"))
        .await
        .unwrap();

    t.engine
        .reversal
        .reverse(&t.ctx, RecordKind::DebtPayment, second.payment.id, None)
        .await
        .unwrap();
    let row = &t.rows(Table::Debts)[0];
    assert_eq!(row["settled"], false);
    assert_eq!(row["amount"], "300.0000");

    t.engine
        .reversal
        .reverse(&t.ctx, RecordKind::DebtPayment, first.payment.id, None)
        .await
        .unwrap();
    assert_eq!(t.rows(Table::Debts)[0]["amount"], "500.0000");

    let payments = t.rows(Table::DebtPayments);
    assert!(payments.iter().all(|p| p["status"] == "reversed"));
}

#[tokio::test]
async fn test_payment_reversal_leaves_reversed_debt_alone() {
    let t = common::ledger();
    let debt = t.debt_owed_to_me("500").await;
    let paid = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("200"))
        .await
        .unwrap();
    t.engine
        .reversal
        .reverse(&t.ctx, RecordKind::Debt, debt.id, None)
        .await
        .unwrap();
    let history_before = t.history(debt.id).await.len();

    let err = t
        .engine
        .reversal
        .reverse(&t.ctx, RecordKind::DebtPayment, paid.payment.id, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LedgerError::InvalidTransition {
            from: RecordStatus::Reversed,
            ..
        }
    ));
    let row = &t.rows(Table::Debts)[0];
    assert_eq!(row["status"], "reversed");
    assert_eq!(row["amount"], "300.0000");
    assert_eq!(t.history(debt.id).await.len(), history_before);
    assert_eq!(t.rows(Table::DebtPayments)[0]["status"], "confirmed");

    // Nor can a new payment land on it
    let err = t
        .engine
        .debt_payments
        .pay(&t.ctx, debt.id, PayDebtCommand::new("50"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "validation_error");
    assert_eq!(t.rows(Table::Debts)[0]["amount"], "300.0000");
}

#[tokio::test]
async fn test_concurrent_reversals_have_one_winner() {
    let t = common::ledger();
    let record = t.expense("64").await;

    let (first, second) = tokio::join!(
        t.engine
            .reversal
            .reverse(&t.ctx, RecordKind::Transfer, record.id, None),
        t.engine
            .reversal
            .reverse(&t.ctx, RecordKind::Transfer, record.id, None),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(
        loser,
        LedgerError::InvalidTransition {
            from: RecordStatus::Reversed,
            ..
        }
    ));
    assert_eq!(t.history(record.id).await.len(), 2);
}

#[tokio::test]
async fn test_concurrent_sale_reversals_have_one_winner() {
    let t = common::ledger();
    let pens = t.pens().await;
    let sale = t
        .engine
        .inventory
        .sell(&t.ctx, pens.id, SellInventoryCommand::new(3))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        t.engine
            .reversal
            .reverse(&t.ctx, RecordKind::InventorySale, sale.sale.id, None),
        t.engine
            .reversal
            .reverse(&t.ctx, RecordKind::InventorySale, sale.sale.id, None),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, LedgerError::InvalidTransition { .. }));
    assert_eq!(t.quantity(pens.id).await, 10);
}

// =========================================================================
// Ledger view
// =========================================================================

#[tokio::test]
async fn test_ledger_lists_newest_first_and_summarises() {
    let t = common::ledger();
    let older = t.expense("10").await;
    let newer = t.expense("20").await;
    t.engine
        .reversal
        .reverse(&t.ctx, RecordKind::Transfer, older.id, None)
        .await
        .unwrap();

    let entries = t
        .engine
        .audit
        .list_entries(&t.ctx, &LedgerFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, newer.id);

    let summary = t.engine.audit.summary(&t.ctx).await.unwrap();
    assert_eq!(summary.total_entries, 2);
    assert_eq!(summary.active_entries, 1);
    assert_eq!(summary.reversed_or_deleted_entries, 1);
    assert_eq!(summary.today_entries, 2);

    let reversed_only = t
        .engine
        .audit
        .list_entries(
            &t.ctx,
            &LedgerFilter::default().with_status(RecordStatus::Reversed),
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(reversed_only.len(), 1);
    assert_eq!(reversed_only[0].id, older.id);
}

#[tokio::test]
async fn test_owners_are_isolated() {
    let t = common::ledger();
    let other = biz_ledger::OperationContext::for_owner(uuid::Uuid::new_v4());
    let record = t.expense("15").await;

    let err = t
        .engine
        .reversal
        .reverse(&other, RecordKind::Transfer, record.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "not_found");

    let entries = t
        .engine
        .audit
        .list_entries(&other, &LedgerFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert!(entries.is_empty());
}
