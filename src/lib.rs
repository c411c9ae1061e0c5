//! biz_ledger Library
//!
//! Atomic transaction and ledger engine for a small-business bookkeeping
//! backend. Re-exports modules for integration testing and embedding.

pub mod api;
pub mod audit;
pub mod commit;
pub mod domain;
pub mod engine;
pub mod handlers;
pub mod idempotency;
pub mod projection;
pub mod reversal;
pub mod saga;
pub mod store;

pub mod config;
pub mod db;
mod error;

pub use config::Config;
pub use engine::LedgerEngine;
pub use error::{AppError, AppResult};
pub use domain::{
    Amount, AmountError, FinancialRecord, LedgerError, Money, OperationContext, RecordKind,
    RecordStatus,
};
pub use store::{InMemoryLedgerStore, LedgerStore, PgLedgerStore, StoreError};
