//! Debt Payment Handler
//!
//! A payment is its own financial record plus a change to the debt it pays.
//! A full payment marks the debt settled and leaves its amount alone; a partial
//! payment lowers the amount to what is still outstanding.

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditService, HistoryAction, NewHistoryEntry};
use crate::commit::TwoPhaseCommit;
use crate::domain::{
    fields, invariants, Amount, EntityType, FinancialRecord, LedgerError, OperationContext,
    RecordDetails, RecordKind, RecordStatus, RelatedEntity, Row, SubType, Table,
};
use crate::reversal::live_debt_balance;
use crate::saga::{CompareAndSwapStep, ConfirmStep, ProvisionalInsertStep, Saga};
use crate::store::{load, LedgerStore};

use super::{DebtPaymentResult, PayDebtCommand};

/// Payment direction for a debt's direction
fn payment_sub_type(debt_sub_type: SubType) -> Option<SubType> {
    match debt_sub_type {
        SubType::OwedToMe => Some(SubType::PaymentReceived),
        SubType::OwedByMe => Some(SubType::PaymentMade),
        _ => None,
    }
}

/// Handler for paying down debts
#[derive(Clone)]
pub struct DebtPaymentHandler {
    store: Arc<dyn LedgerStore>,
    commit: TwoPhaseCommit,
    audit: AuditService,
}

impl DebtPaymentHandler {
    pub fn new(store: Arc<dyn LedgerStore>, commit: TwoPhaseCommit, audit: AuditService) -> Self {
        Self {
            store,
            commit,
            audit,
        }
    }

    pub async fn pay(
        &self,
        ctx: &OperationContext,
        debt_id: Uuid,
        command: PayDebtCommand,
    ) -> Result<DebtPaymentResult, LedgerError> {
        let payment: Amount = command.amount.parse()?;

        let (debt, _): (FinancialRecord, Row) = load(
            self.store.as_ref(),
            ctx.owner(),
            Table::Debts,
            debt_id,
            RecordKind::Debt.as_str(),
        )
        .await?;

        if debt.provisional || debt.status != RecordStatus::Confirmed {
            return Err(LedgerError::validation(format!(
                "debt {} is {} and cannot take payments",
                debt_id, debt.status
            )));
        }
        let (Some(outstanding), Some(sub_type)) =
            (debt.outstanding(), payment_sub_type(debt.sub_type))
        else {
            return Err(LedgerError::not_found(RecordKind::Debt.as_str(), debt_id));
        };

        invariants::check_payment(payment.value(), outstanding)?;

        let remaining = outstanding.checked_sub(payment.to_money())?;
        let settles = remaining.is_zero();

        let mut record = FinancialRecord::new(
            ctx.owner_id(),
            sub_type,
            payment.to_money(),
            RecordDetails::DebtPayment {
                debt_id,
                debt_amount_before: outstanding,
                debt_amount_after: remaining,
                settled_debt: settles,
            },
        )
        .with_related(RelatedEntity::new(
            EntityType::Debt,
            Some(debt_id),
            debt.related.as_ref().and_then(|r| r.name.clone()),
        ));
        record.note = command.note;
        invariants::validate_record(&record)?;

        // Only lands while the debt is unchanged and still confirmed
        let expected = live_debt_balance(debt.amount, false);
        let desired = if settles {
            fields([("settled", Value::Bool(true))])
        } else {
            fields([("amount", Value::from(remaining))])
        };
        let payment_id = record.id;

        tracing::info!(
            debt_id = %debt_id,
            payment = %payment,
            remaining = %remaining,
            settles,
            correlation_id = ?ctx.correlation_id,
            "Paying debt"
        );

        Saga::new("debt_payment")
            .step(ProvisionalInsertStep::new(
                "insert_payment",
                &self.commit,
                ctx,
                record.clone(),
            ))
            .step(CompareAndSwapStep::new(
                "update_debt",
                &self.store,
                ctx,
                Table::Debts,
                debt_id,
                expected.clone(),
                desired.clone(),
            ))
            .step(ConfirmStep::new(
                "confirm_payment",
                &self.commit,
                ctx,
                RecordKind::DebtPayment,
                payment_id,
            ))
            .run()
            .await
            .into_result()?;

        let mut changes = desired;
        changes.insert("payment_amount".into(), Value::from(payment.to_money()));
        changes.insert("remaining_balance".into(), Value::from(remaining));
        changes.insert("payment_id".into(), Value::from(payment_id.to_string()));

        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(RecordKind::Debt.as_str(), debt_id, HistoryAction::Update)
                    .changes(changes)
                    .previous_values(expected),
            )
            .await;

        record.owner_id = ctx.owner_id();
        record.status = RecordStatus::Confirmed;
        record.provisional = false;

        Ok(DebtPaymentResult {
            payment: record,
            debt_id,
            remaining_balance: remaining,
            settled: settles,
        })
    }
}
