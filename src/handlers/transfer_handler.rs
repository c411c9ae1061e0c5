//! Transfer Handler
//!
//! Records plain income and expense entries.

use crate::commit::TwoPhaseCommit;
use crate::domain::{Amount, FinancialRecord, LedgerError, OperationContext, RecordDetails};

use super::RecordTransferCommand;

/// Handler for income/expense records
#[derive(Clone)]
pub struct TransferHandler {
    commit: TwoPhaseCommit,
}

impl TransferHandler {
    pub fn new(commit: TwoPhaseCommit) -> Self {
        Self { commit }
    }

    /// Validate, insert provisionally and confirm
    pub async fn record(
        &self,
        ctx: &OperationContext,
        command: RecordTransferCommand,
    ) -> Result<FinancialRecord, LedgerError> {
        let amount: Amount = command.amount.parse()?;

        let mut record = FinancialRecord::new(
            ctx.owner_id(),
            command.sub_type,
            amount.to_money(),
            RecordDetails::Transfer,
        );
        record.note = command.note;
        record.related = command.related;

        self.commit.create_confirmed(ctx, record).await
    }
}
