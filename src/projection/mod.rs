//! Projection module
//!
//! Read model over the financial records. Ledger entries are derived from the
//! records on every read and never stored on their own.

mod ledger;

pub use ledger::{
    CapitalProfitTotals, LedgerEntry, LedgerFilter, LedgerSummary, Pagination, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
