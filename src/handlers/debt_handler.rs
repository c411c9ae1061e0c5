//! Debt Handler

use crate::commit::TwoPhaseCommit;
use crate::domain::{
    Amount, EntityType, FinancialRecord, LedgerError, OperationContext, RecordDetails,
    RelatedEntity,
};

use super::RecordDebtCommand;

/// Handler for money owed to or by a contact
#[derive(Clone)]
pub struct DebtHandler {
    commit: TwoPhaseCommit,
}

impl DebtHandler {
    pub fn new(commit: TwoPhaseCommit) -> Self {
        Self { commit }
    }

    pub async fn record(
        &self,
        ctx: &OperationContext,
        command: RecordDebtCommand,
    ) -> Result<FinancialRecord, LedgerError> {
        let amount = command.amount.parse::<Amount>()?.to_money();

        let contact_name = command.contact_name.trim();
        if contact_name.is_empty() {
            return Err(LedgerError::validation("debt contact name is required"));
        }

        let mut record = FinancialRecord::new(
            ctx.owner_id(),
            command.sub_type,
            amount,
            RecordDetails::Debt {
                original_amount: amount,
                settled: false,
            },
        )
        .with_related(RelatedEntity::new(
            EntityType::Contact,
            command.contact_id,
            Some(contact_name.to_string()),
        ));
        record.note = command.note;

        self.commit.create_confirmed(ctx, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditService;
    use crate::domain::{RecordStatus, SubType};
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use std::sync::Arc;
    use uuid::Uuid;

    fn handler() -> DebtHandler {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        DebtHandler::new(TwoPhaseCommit::new(store.clone(), AuditService::new(store)))
    }

    #[tokio::test]
    async fn test_record_debt_keeps_original_amount() {
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let debt = handler()
            .record(&ctx, RecordDebtCommand::new(SubType::OwedToMe, "500", "Alice"))
            .await
            .unwrap();

        assert_eq!(debt.status, RecordStatus::Confirmed);
        match debt.details {
            RecordDetails::Debt {
                original_amount,
                settled,
            } => {
                assert_eq!(original_amount, debt.amount);
                assert!(!settled);
            }
            other => panic!("unexpected details {:?}", other),
        }
        assert_eq!(debt.related.unwrap().name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_blank_contact_rejected() {
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let err = handler()
            .record(&ctx, RecordDebtCommand::new(SubType::OwedByMe, "20", "  "))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "validation_error");
    }
}
