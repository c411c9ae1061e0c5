//! API Routes
//!
//! HTTP endpoint definitions.

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{verify_chain, ChainVerificationResult, RecordHistoryEntry};
use crate::domain::{FinancialRecord, InventoryItem, OperationContext, RecordKind, RecordStatus};
use crate::engine::LedgerEngine;
use crate::error::AppError;
use crate::handlers::{
    CreateInventoryItemCommand, DebtPaymentResult, PayDebtCommand, RecordDebtCommand,
    RecordTransferCommand, RestockInventoryCommand, RestockResult, ReverseRecordCommand,
    SaleResult, SellInventoryCommand,
};
use crate::projection::{
    CapitalProfitTotals, LedgerEntry, LedgerFilter, LedgerSummary, Pagination, DEFAULT_PAGE_SIZE,
};

/// Header carrying a client-chosen idempotency key (UUID)
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

// =========================================================================
// State
// =========================================================================

/// Shared state of every route
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LedgerEngine>,
    pub default_page_size: i64,
}

impl AppState {
    pub fn new(engine: LedgerEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_default_page_size(mut self, size: i64) -> Self {
        self.default_page_size = size;
        self
    }
}

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    #[serde(default)]
    pub record_type: Option<RecordKind>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl LedgerQuery {
    fn filter(&self) -> LedgerFilter {
        LedgerFilter {
            record_type: self.record_type,
            status: self.status,
            from: self.from,
            to: self.to,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerEntriesResponse {
    pub entries: Vec<LedgerEntry>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub record_id: Uuid,
    pub entries: Vec<RecordHistoryEntry>,
    pub chain: ChainVerificationResult,
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/transfers", post(record_transfer))
        .route("/debts", post(record_debt))
        .route("/debts/:debt_id/payments", post(pay_debt))
        .route("/inventory/items", post(create_inventory_item))
        .route("/inventory/items/:item_id", get(get_inventory_item))
        .route("/inventory/items/:item_id/sales", post(sell_inventory))
        .route("/inventory/items/:item_id/restock", post(restock_inventory))
        .route("/records/:kind/:record_id/reverse", post(reverse_record))
        .route("/records/:record_id/history", get(record_history))
        .route("/ledger/entries", get(ledger_entries))
        .route("/ledger/summary", get(ledger_summary))
        .route("/ledger/totals", get(ledger_totals))
}

/// Optional `Idempotency-Key` header
fn idempotency_key(headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(Some)
            .ok_or_else(|| AppError::InvalidHeader(IDEMPOTENCY_KEY_HEADER.to_string())),
    }
}

// =========================================================================
// Writes
// =========================================================================

async fn record_transfer(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    headers: HeaderMap,
    Json(command): Json<RecordTransferCommand>,
) -> Result<(StatusCode, Json<FinancialRecord>), AppError> {
    let key = idempotency_key(&headers)?;
    let engine = &state.engine;

    let record = engine
        .idempotency
        .run(&ctx, key, &("transfer", &command), || {
            engine.transfers.record(&ctx, command.clone())
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn record_debt(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    headers: HeaderMap,
    Json(command): Json<RecordDebtCommand>,
) -> Result<(StatusCode, Json<FinancialRecord>), AppError> {
    let key = idempotency_key(&headers)?;
    let engine = &state.engine;

    let record = engine
        .idempotency
        .run(&ctx, key, &("debt", &command), || {
            engine.debts.record(&ctx, command.clone())
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn pay_debt(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Path(debt_id): Path<Uuid>,
    headers: HeaderMap,
    Json(command): Json<PayDebtCommand>,
) -> Result<(StatusCode, Json<DebtPaymentResult>), AppError> {
    let key = idempotency_key(&headers)?;
    let engine = &state.engine;

    let result = engine
        .idempotency
        .run(&ctx, key, &("debt_payment", debt_id, &command), || {
            engine.debt_payments.pay(&ctx, debt_id, command.clone())
        })
        .await?;

    Ok((StatusCode::CREATED, Json(result)))
}

async fn create_inventory_item(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    headers: HeaderMap,
    Json(command): Json<CreateInventoryItemCommand>,
) -> Result<(StatusCode, Json<InventoryItem>), AppError> {
    let key = idempotency_key(&headers)?;
    let engine = &state.engine;

    let item = engine
        .idempotency
        .run(&ctx, key, &("inventory_item", &command), || {
            engine.inventory.create_item(&ctx, command.clone())
        })
        .await?;

    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_inventory_item(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Path(item_id): Path<Uuid>,
) -> Result<Json<InventoryItem>, AppError> {
    Ok(Json(state.engine.inventory.get_item(&ctx, item_id).await?))
}

async fn sell_inventory(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Path(item_id): Path<Uuid>,
    headers: HeaderMap,
    Json(command): Json<SellInventoryCommand>,
) -> Result<(StatusCode, Json<SaleResult>), AppError> {
    let key = idempotency_key(&headers)?;
    let engine = &state.engine;

    let result = engine
        .idempotency
        .run(&ctx, key, &("inventory_sale", item_id, &command), || {
            engine.inventory.sell(&ctx, item_id, command.clone())
        })
        .await?;

    Ok((StatusCode::CREATED, Json(result)))
}

async fn restock_inventory(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Path(item_id): Path<Uuid>,
    headers: HeaderMap,
    Json(command): Json<RestockInventoryCommand>,
) -> Result<(StatusCode, Json<RestockResult>), AppError> {
    let key = idempotency_key(&headers)?;
    let engine = &state.engine;

    let result = engine
        .idempotency
        .run(&ctx, key, &("inventory_add", item_id, &command), || {
            engine.inventory.restock(&ctx, item_id, command.clone())
        })
        .await?;

    Ok((StatusCode::CREATED, Json(result)))
}

async fn reverse_record(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Path((kind, record_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    command: Option<Json<ReverseRecordCommand>>,
) -> Result<Json<FinancialRecord>, AppError> {
    let kind = RecordKind::parse(&kind)
        .ok_or_else(|| AppError::InvalidRequest(format!("unknown record kind '{}'", kind)))?;
    let command = command.map(|Json(c)| c).unwrap_or_default();
    let key = idempotency_key(&headers)?;
    let engine = &state.engine;

    let record = engine
        .idempotency
        .run(&ctx, key, &("reverse", kind, record_id, &command), || {
            engine
                .reversal
                .reverse(&ctx, kind, record_id, command.reason.as_deref())
        })
        .await?;

    Ok(Json(record))
}

// =========================================================================
// Reads
// =========================================================================

async fn record_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<HistoryResponse>, AppError> {
    let entries = state.engine.audit.history(&ctx, record_id).await?;
    let chain = verify_chain(&entries);

    Ok(Json(HistoryResponse {
        record_id,
        entries,
        chain,
    }))
}

async fn ledger_entries(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<LedgerEntriesResponse>, AppError> {
    let page = Pagination::new(query.limit, query.offset, state.default_page_size);
    let entries = state
        .engine
        .audit
        .list_entries(&ctx, &query.filter(), page)
        .await?;

    Ok(Json(LedgerEntriesResponse {
        entries,
        limit: page.limit,
        offset: page.offset,
    }))
}

async fn ledger_summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
) -> Result<Json<LedgerSummary>, AppError> {
    Ok(Json(state.engine.audit.summary(&ctx).await?))
}

async fn ledger_totals(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<CapitalProfitTotals>, AppError> {
    Ok(Json(
        state
            .engine
            .audit
            .capital_and_profit(&ctx, &query.filter())
            .await?,
    ))
}
