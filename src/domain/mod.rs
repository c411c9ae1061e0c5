//! Domain module
//!
//! Core domain types and business rules. Nothing here performs I/O.

pub mod amount;
pub mod context;
pub mod error;
pub mod invariants;
pub mod record;

pub use amount::{Amount, AmountError, Money};
pub use context::{OperationContext, OwnerId};
pub use error::LedgerError;
pub use record::{
    fields, EntityType, FinancialRecord, InventoryItem, ProfitRecord, RecordDetails, RecordKind,
    RecordStatus, RelatedEntity, Row, SubType, Table, Transition, TransitionOutcome,
};
