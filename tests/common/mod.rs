//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use biz_ledger::audit::RecordHistoryEntry;
use biz_ledger::domain::{FinancialRecord, InventoryItem, Row, SubType, Table};
use biz_ledger::handlers::{CreateInventoryItemCommand, RecordDebtCommand, RecordTransferCommand};
use biz_ledger::{InMemoryLedgerStore, LedgerEngine, LedgerStore, OperationContext};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

/// An engine over a fresh in-memory store, with a handle on the store for
/// fault injection and inspection
pub struct TestLedger {
    pub memory: Arc<InMemoryLedgerStore>,
    pub engine: LedgerEngine,
    pub ctx: OperationContext,
}

/// Pool against DATABASE_URL with the migrations already applied. Every
/// test uses a fresh owner, so nothing needs truncating.
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    assert!(
        biz_ledger::db::check_schema(&pool).await.unwrap(),
        "run migrations/0001_init.sql before the database tests"
    );
    pool
}

pub fn ledger() -> TestLedger {
    let memory = Arc::new(InMemoryLedgerStore::new());
    let store: Arc<dyn LedgerStore> = memory.clone();
    TestLedger {
        memory,
        engine: LedgerEngine::new(store),
        ctx: OperationContext::for_owner(Uuid::new_v4()).with_correlation_id(Uuid::new_v4()),
    }
}

impl TestLedger {
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.memory.rows(self.ctx.owner(), table)
    }

    pub async fn history(&self, record_id: Uuid) -> Vec<RecordHistoryEntry> {
        self.engine.audit.history(&self.ctx, record_id).await.unwrap()
    }

    pub async fn expense(&self, amount: &str) -> FinancialRecord {
        self.engine
            .transfers
            .record(&self.ctx, RecordTransferCommand::new(SubType::Expense, amount))
            .await
            .unwrap()
    }

    pub async fn debt_owed_to_me(&self, amount: &str) -> FinancialRecord {
        self.engine
            .debts
            .record(
                &self.ctx,
                RecordDebtCommand::new(SubType::OwedToMe, amount, "Alice"),
            )
            .await
            .unwrap()
    }

    /// 10 pens costing 1.50 each, sold with a margin of 2 per unit
    pub async fn pens(&self) -> InventoryItem {
        self.engine
            .inventory
            .create_item(
                &self.ctx,
                CreateInventoryItemCommand::new("Pens", 10, "1.50", "2"),
            )
            .await
            .unwrap()
    }

    pub async fn quantity(&self, item_id: Uuid) -> i64 {
        self.engine
            .inventory
            .get_item(&self.ctx, item_id)
            .await
            .unwrap()
            .quantity
    }
}
