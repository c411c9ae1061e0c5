//! Command definitions
//!
//! Commands carry caller input for one business operation. Money arrives as
//! strings for precise decimal parsing; ids taken from the URL path are passed
//! to the handler separately.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{FinancialRecord, Money, ProfitRecord, RelatedEntity, SubType};

// =========================================================================
// Transfers and debts
// =========================================================================

/// Record money coming in or going out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordTransferCommand {
    /// income or expense
    pub sub_type: SubType,
    pub amount: String,
    #[serde(default)]
    pub note: Option<String>,
    /// Optional counterparty (contact or account)
    #[serde(default)]
    pub related: Option<RelatedEntity>,
}

impl RecordTransferCommand {
    pub fn new(sub_type: SubType, amount: impl Into<String>) -> Self {
        Self {
            sub_type,
            amount: amount.into(),
            note: None,
            related: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_related(mut self, related: RelatedEntity) -> Self {
        self.related = Some(related);
        self
    }
}

/// Record money owed to or by a contact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDebtCommand {
    /// owed_to_me or owed_by_me
    pub sub_type: SubType,
    pub amount: String,
    #[serde(default)]
    pub contact_id: Option<Uuid>,
    pub contact_name: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl RecordDebtCommand {
    pub fn new(sub_type: SubType, amount: impl Into<String>, contact_name: impl Into<String>) -> Self {
        Self {
            sub_type,
            amount: amount.into(),
            contact_id: None,
            contact_name: contact_name.into(),
            note: None,
        }
    }

    pub fn with_contact_id(mut self, contact_id: Uuid) -> Self {
        self.contact_id = Some(contact_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Pay part or all of a debt's outstanding balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayDebtCommand {
    pub amount: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl PayDebtCommand {
    pub fn new(amount: impl Into<String>) -> Self {
        Self {
            amount: amount.into(),
            note: None,
        }
    }
}

// =========================================================================
// Inventory
// =========================================================================

/// Register a stock item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInventoryItemCommand {
    pub name: String,
    #[serde(default)]
    pub quantity: i64,
    /// Purchase cost of one unit
    pub unit_cost: String,
    /// Margin on top of `unit_cost`; a unit sells for the sum of both
    #[serde(default = "zero_string")]
    pub profit_per_unit: String,
}

fn zero_string() -> String {
    "0".to_string()
}

impl CreateInventoryItemCommand {
    pub fn new(
        name: impl Into<String>,
        quantity: i64,
        unit_cost: impl Into<String>,
        profit_per_unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            quantity,
            unit_cost: unit_cost.into(),
            profit_per_unit: profit_per_unit.into(),
        }
    }
}

/// Sell units of an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellInventoryCommand {
    pub quantity: i64,
    #[serde(default)]
    pub note: Option<String>,
}

impl SellInventoryCommand {
    pub fn new(quantity: i64) -> Self {
        Self {
            quantity,
            note: None,
        }
    }
}

/// Add units of an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestockInventoryCommand {
    pub quantity: i64,
    /// Total purchase cost; defaults to quantity times the unit cost
    #[serde(default)]
    pub cost: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl RestockInventoryCommand {
    pub fn new(quantity: i64) -> Self {
        Self {
            quantity,
            cost: None,
            note: None,
        }
    }

    pub fn with_cost(mut self, cost: impl Into<String>) -> Self {
        self.cost = Some(cost.into());
        self
    }
}

// =========================================================================
// Reversal
// =========================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReverseRecordCommand {
    #[serde(default)]
    pub reason: Option<String>,
}

// =========================================================================
// Results
// =========================================================================

/// Result of a successful sale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleResult {
    pub sale: FinancialRecord,
    pub profit: ProfitRecord,
    pub remaining_quantity: i64,
}

/// Result of a successful restock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestockResult {
    pub restock: FinancialRecord,
    pub quantity: i64,
}

/// Result of a successful debt payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebtPaymentResult {
    pub payment: FinancialRecord,
    pub debt_id: Uuid,
    pub remaining_balance: Money,
    pub settled: bool,
}
