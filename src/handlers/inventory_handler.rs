//! Inventory Handler
//!
//! Stock items plus the two compound operations on them. A sale touches the
//! item, the sale log and the profit table; a restock touches the item and the
//! restock log. Both run as sagas, and the stock write is a compare-and-swap
//! on the quantity read beforehand.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditService, HistoryAction, NewHistoryEntry};
use crate::commit::TwoPhaseCommit;
use crate::domain::record::to_row;
use crate::domain::{
    fields, invariants, EntityType, FinancialRecord, InventoryItem, LedgerError, Money,
    OperationContext, ProfitRecord, RecordDetails, RecordKind, RecordStatus, RelatedEntity, Row,
    SubType, Table,
};
use crate::saga::{CompareAndSwapStep, ConfirmStep, InsertRowStep, ProvisionalInsertStep, Saga};
use crate::store::{load, LedgerStore, StoreError};

use super::{
    CreateInventoryItemCommand, RestockInventoryCommand, RestockResult, SaleResult,
    SellInventoryCommand,
};

/// History record type of inventory items
pub const INVENTORY_ITEM: &str = "inventory_item";

const MAX_ITEM_NAME_LENGTH: usize = 200;

fn quantity(q: i64) -> Row {
    fields([("quantity", Value::from(q))])
}

fn item_entity(item: &InventoryItem) -> RelatedEntity {
    RelatedEntity::new(
        EntityType::InventoryItem,
        Some(item.id),
        Some(item.name.clone()),
    )
}

/// Handler for stock items, sales and restocks
#[derive(Clone)]
pub struct InventoryHandler {
    store: Arc<dyn LedgerStore>,
    commit: TwoPhaseCommit,
    audit: AuditService,
}

impl InventoryHandler {
    pub fn new(store: Arc<dyn LedgerStore>, commit: TwoPhaseCommit, audit: AuditService) -> Self {
        Self {
            store,
            commit,
            audit,
        }
    }

    /// Register a new stock item
    pub async fn create_item(
        &self,
        ctx: &OperationContext,
        command: CreateInventoryItemCommand,
    ) -> Result<InventoryItem, LedgerError> {
        let name = command.name.trim();
        if name.is_empty() || name.chars().count() > MAX_ITEM_NAME_LENGTH {
            return Err(LedgerError::validation(format!(
                "item name must be 1 to {} characters",
                MAX_ITEM_NAME_LENGTH
            )));
        }
        let quantity = invariants::check_stock_change(0, command.quantity)?;

        let item = InventoryItem {
            id: Uuid::new_v4(),
            owner_id: ctx.owner_id(),
            name: name.to_string(),
            quantity,
            unit_cost: command.unit_cost.parse()?,
            profit_per_unit: command.profit_per_unit.parse()?,
            created_at: Utc::now(),
        };
        item.unit_price()?;

        let row = to_row(&item).map_err(StoreError::from)?;
        self.store
            .insert(ctx.owner(), Table::InventoryItems, row.clone())
            .await?;

        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(INVENTORY_ITEM, item.id, HistoryAction::Create).changes(row),
            )
            .await;

        tracing::info!(item_id = %item.id, name = %item.name, quantity = item.quantity, "Inventory item created");
        Ok(item)
    }

    pub async fn get_item(
        &self,
        ctx: &OperationContext,
        item_id: Uuid,
    ) -> Result<InventoryItem, LedgerError> {
        let (item, _): (InventoryItem, Row) = load(
            self.store.as_ref(),
            ctx.owner(),
            Table::InventoryItems,
            item_id,
            INVENTORY_ITEM,
        )
        .await?;
        Ok(item)
    }

    /// Sell against the item as it is now
    pub async fn sell(
        &self,
        ctx: &OperationContext,
        item_id: Uuid,
        command: SellInventoryCommand,
    ) -> Result<SaleResult, LedgerError> {
        let item = self.get_item(ctx, item_id).await?;
        self.sell_against(ctx, &item, command).await
    }

    /// Sell against a previously read item. The stock write only lands if the
    /// quantity is still the one in `snapshot`; otherwise the sale fails as a
    /// conflict and nothing is written.
    pub async fn sell_against(
        &self,
        ctx: &OperationContext,
        snapshot: &InventoryItem,
        command: SellInventoryCommand,
    ) -> Result<SaleResult, LedgerError> {
        let sold = command.quantity;
        if sold <= 0 {
            return Err(LedgerError::validation("quantity sold must be positive"));
        }
        if snapshot.quantity < sold {
            return Err(LedgerError::InsufficientStock {
                item_id: snapshot.id,
                available: snapshot.quantity,
                requested: sold,
            });
        }

        let remaining = invariants::check_stock_change(snapshot.quantity, -sold)?;
        // Capital and profit stay apart; the buyer paid their sum
        let amount = snapshot.unit_cost.times(sold)?;
        let profit = snapshot.profit_per_unit.times(sold)?;
        let profit_id = Uuid::new_v4();

        let mut sale = FinancialRecord::new(
            ctx.owner_id(),
            SubType::Sale,
            amount,
            RecordDetails::InventorySale {
                item_id: snapshot.id,
                quantity_change: -sold,
                profit_record_id: Some(profit_id),
            },
        )
        .with_profit(profit)
        .with_related(item_entity(snapshot));
        sale.note = command.note;
        invariants::validate_record(&sale)?;

        let profit_record = ProfitRecord {
            id: profit_id,
            owner_id: ctx.owner_id(),
            sale_log_id: sale.id,
            item_id: snapshot.id,
            amount: profit,
            status: RecordStatus::Confirmed,
            created_at: Utc::now(),
        };
        let profit_row = to_row(&profit_record).map_err(StoreError::from)?;
        let sale_id = sale.id;

        tracing::info!(
            item_id = %snapshot.id,
            quantity = sold,
            amount = %amount,
            correlation_id = ?ctx.correlation_id,
            "Selling inventory"
        );

        Saga::new("inventory_sale")
            .step(CompareAndSwapStep::new(
                "decrement_stock",
                &self.store,
                ctx,
                Table::InventoryItems,
                snapshot.id,
                quantity(snapshot.quantity),
                quantity(remaining),
            ))
            .step(ProvisionalInsertStep::new(
                "insert_sale_log",
                &self.commit,
                ctx,
                sale.clone(),
            ))
            .step(InsertRowStep::new(
                "insert_profit",
                &self.store,
                ctx,
                Table::Profits,
                profit_id,
                profit_row,
            ))
            .step(ConfirmStep::new(
                "confirm_sale_log",
                &self.commit,
                ctx,
                RecordKind::InventorySale,
                sale_id,
            ))
            .run()
            .await
            .into_result()?;

        self.record_stock_change(ctx, snapshot, remaining, sale_id).await;

        sale.owner_id = ctx.owner_id();
        sale.status = RecordStatus::Confirmed;
        sale.provisional = false;

        Ok(SaleResult {
            sale,
            profit: profit_record,
            remaining_quantity: remaining,
        })
    }

    /// Add stock bought at `cost` (default: quantity times the unit cost)
    pub async fn restock(
        &self,
        ctx: &OperationContext,
        item_id: Uuid,
        command: RestockInventoryCommand,
    ) -> Result<RestockResult, LedgerError> {
        let added = command.quantity;
        if added <= 0 {
            return Err(LedgerError::validation("quantity added must be positive"));
        }

        let item = self.get_item(ctx, item_id).await?;
        let total = invariants::check_stock_change(item.quantity, added)?;
        let cost = match command.cost.as_deref() {
            Some(cost) => cost.parse::<Money>()?,
            None => item.unit_cost.times(added)?,
        };

        let mut restock = FinancialRecord::new(
            ctx.owner_id(),
            SubType::Restock,
            cost,
            RecordDetails::InventoryAdd {
                item_id,
                quantity_change: added,
            },
        )
        .with_related(item_entity(&item));
        restock.note = command.note;
        invariants::validate_record(&restock)?;

        let restock_id = restock.id;

        Saga::new("inventory_add")
            .step(CompareAndSwapStep::new(
                "increment_stock",
                &self.store,
                ctx,
                Table::InventoryItems,
                item_id,
                quantity(item.quantity),
                quantity(total),
            ))
            .step(ProvisionalInsertStep::new(
                "insert_restock_log",
                &self.commit,
                ctx,
                restock.clone(),
            ))
            .step(ConfirmStep::new(
                "confirm_restock_log",
                &self.commit,
                ctx,
                RecordKind::InventoryAdd,
                restock_id,
            ))
            .run()
            .await
            .into_result()?;

        self.record_stock_change(ctx, &item, total, restock_id).await;

        restock.owner_id = ctx.owner_id();
        restock.status = RecordStatus::Confirmed;
        restock.provisional = false;

        Ok(RestockResult {
            restock,
            quantity: total,
        })
    }

    async fn record_stock_change(
        &self,
        ctx: &OperationContext,
        before: &InventoryItem,
        after: i64,
        source_record_id: Uuid,
    ) {
        self.audit
            .append_best_effort(
                ctx,
                NewHistoryEntry::new(INVENTORY_ITEM, before.id, HistoryAction::Update)
                    .changes(fields([
                        ("quantity", Value::from(after)),
                        ("quantity_change", Value::from(after - before.quantity)),
                        ("source_record_id", Value::from(source_record_id.to_string())),
                    ]))
                    .previous_values(quantity(before.quantity)),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::invariants::MAX_QUANTITY;
    use crate::store::{InMemoryLedgerStore, StoreOp};
    use rust_decimal_macros::dec;

    fn handler() -> (Arc<InMemoryLedgerStore>, InventoryHandler) {
        let memory = Arc::new(InMemoryLedgerStore::new());
        let store: Arc<dyn LedgerStore> = memory.clone();
        let audit = AuditService::new(store.clone());
        let commit = TwoPhaseCommit::new(store.clone(), audit.clone());
        (memory, InventoryHandler::new(store, commit, audit))
    }

    async fn pens(handler: &InventoryHandler, ctx: &OperationContext) -> InventoryItem {
        handler
            .create_item(ctx, CreateInventoryItemCommand::new("Pens", 10, "2.00", "0.50"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sale_updates_stock_log_and_profit() {
        let (memory, handler) = handler();
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let item = pens(&handler, &ctx).await;

        let result = handler
            .sell(&ctx, item.id, SellInventoryCommand::new(3))
            .await
            .unwrap();

        assert_eq!(result.remaining_quantity, 7);
        // 3 x 2.00 capital back, 3 x 0.50 margin on top
        assert_eq!(result.sale.amount.value(), dec!(6));
        assert_eq!(result.sale.profit.unwrap().value(), dec!(1.5));
        assert_eq!(result.profit.amount.value(), dec!(1.5));
        assert_eq!(handler.get_item(&ctx, item.id).await.unwrap().quantity, 7);

        let logs = memory.rows(ctx.owner(), Table::InventoryLogs);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["status"], "confirmed");
        assert_eq!(logs[0]["provisional"], false);
        assert_eq!(memory.rows(ctx.owner(), Table::Profits).len(), 1);
    }

    #[tokio::test]
    async fn test_oversell_rejected_without_writes() {
        let (memory, handler) = handler();
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let item = pens(&handler, &ctx).await;
        let writes = memory.write_count();

        let err = handler
            .sell(&ctx, item.id, SellInventoryCommand::new(11))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "insufficient_stock");
        assert_eq!(memory.write_count(), writes);
    }

    #[tokio::test]
    async fn test_failed_confirm_rolls_sale_back() {
        let (memory, handler) = handler();
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let item = pens(&handler, &ctx).await;
        // item CAS succeeds, confirm of the sale log fails
        memory.fail_next(StoreOp::Update, Some(Table::InventoryLogs));

        let err = handler
            .sell(&ctx, item.id, SellInventoryCommand::new(4))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "step_failed");
        assert_eq!(handler.get_item(&ctx, item.id).await.unwrap().quantity, 10);
        assert!(memory.rows(ctx.owner(), Table::InventoryLogs).is_empty());
        assert!(memory.rows(ctx.owner(), Table::Profits).is_empty());
    }

    #[tokio::test]
    async fn test_restock_defaults_cost_to_unit_cost() {
        let (memory, handler) = handler();
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let item = pens(&handler, &ctx).await;

        let result = handler
            .restock(&ctx, item.id, RestockInventoryCommand::new(5))
            .await
            .unwrap();

        assert_eq!(result.quantity, 15);
        assert_eq!(result.restock.amount.value(), dec!(10));
        assert_eq!(memory.rows(ctx.owner(), Table::InventoryLogs).len(), 1);
    }

    #[tokio::test]
    async fn test_create_item_bounds_quantity() {
        let (memory, handler) = handler();
        let ctx = OperationContext::for_owner(Uuid::new_v4());

        for quantity in [-1, MAX_QUANTITY + 1, i64::MAX] {
            let err = handler
                .create_item(&ctx, CreateInventoryItemCommand::new("Ink", quantity, "1.00", "0"))
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), "validation_error");
        }
        assert!(memory.rows(ctx.owner(), Table::InventoryItems).is_empty());
    }

    #[tokio::test]
    async fn test_restock_past_max_quantity_rejected_without_writes() {
        let (memory, handler) = handler();
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let item = handler
            .create_item(&ctx, CreateInventoryItemCommand::new("Ink", MAX_QUANTITY, "1.00", "0"))
            .await
            .unwrap();
        let writes = memory.write_count();

        for added in [1, i64::MAX] {
            let err = handler
                .restock(&ctx, item.id, RestockInventoryCommand::new(added))
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), "validation_error");
        }
        assert_eq!(memory.write_count(), writes);
        assert_eq!(handler.get_item(&ctx, item.id).await.unwrap().quantity, MAX_QUANTITY);
    }

    #[tokio::test]
    async fn test_sale_amount_overflow_rejected_without_writes() {
        let (memory, handler) = handler();
        let ctx = OperationContext::for_owner(Uuid::new_v4());
        let item = handler
            .create_item(
                &ctx,
                CreateInventoryItemCommand::new("Gold", MAX_QUANTITY, "1000000000000", "0"),
            )
            .await
            .unwrap();
        let writes = memory.write_count();

        let err = handler
            .sell(&ctx, item.id, SellInventoryCommand::new(MAX_QUANTITY))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "invalid_amount");
        assert_eq!(memory.write_count(), writes);
        assert_eq!(handler.get_item(&ctx, item.id).await.unwrap().quantity, MAX_QUANTITY);
    }
}
