//! Ledger Engine
//!
//! Wires the services and handlers over one store. This is the entry point an
//! embedding service holds on to.

use std::sync::Arc;

use crate::audit::AuditService;
use crate::commit::TwoPhaseCommit;
use crate::handlers::{DebtHandler, DebtPaymentHandler, InventoryHandler, TransferHandler};
use crate::idempotency::IdempotencyGuard;
use crate::reversal::ReversalEngine;
use crate::store::LedgerStore;

/// Services and handlers sharing one ledger store
#[derive(Clone)]
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    pub commit: TwoPhaseCommit,
    pub audit: AuditService,
    pub reversal: ReversalEngine,
    pub idempotency: IdempotencyGuard,
    pub transfers: TransferHandler,
    pub debts: DebtHandler,
    pub inventory: InventoryHandler,
    pub debt_payments: DebtPaymentHandler,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        let audit = AuditService::new(store.clone());
        let commit = TwoPhaseCommit::new(store.clone(), audit.clone());

        Self {
            reversal: ReversalEngine::new(store.clone(), audit.clone()),
            idempotency: IdempotencyGuard::new(store.clone()),
            transfers: TransferHandler::new(commit.clone()),
            debts: DebtHandler::new(commit.clone()),
            inventory: InventoryHandler::new(store.clone(), commit.clone(), audit.clone()),
            debt_payments: DebtPaymentHandler::new(store.clone(), commit.clone(), audit.clone()),
            commit,
            audit,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }
}
