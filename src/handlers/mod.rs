//! Command Handlers module
//!
//! Business operations composed from the two-phase commit, the saga executor
//! and the audit service.

mod commands;
mod debt_handler;
mod debt_payment_handler;
mod inventory_handler;
mod transfer_handler;

pub use commands::*;
pub use debt_handler::DebtHandler;
pub use debt_payment_handler::DebtPaymentHandler;
pub use inventory_handler::{InventoryHandler, INVENTORY_ITEM};
pub use transfer_handler::TransferHandler;
