//! Financial records
//!
//! The record family (transfers, debts, inventory movements, debt payments),
//! the supporting inventory rows, and the record lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::amount::{AmountError, Money};

/// A persisted row as it crosses the store boundary: field name -> JSON value
pub type Row = serde_json::Map<String, Value>;

/// Build a row from literal field/value pairs
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Serialize a value into a row
pub fn to_row<T: Serialize>(value: &T) -> Result<Row, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Deserialize a row into a typed value
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(row))
}

// =========================================================================
// Tables
// =========================================================================

/// Persistence tables behind the store boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Transfers,
    Debts,
    InventoryItems,
    InventoryLogs,
    Profits,
    DebtPayments,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Transfers => "transfers",
            Table::Debts => "debts",
            Table::InventoryItems => "inventory_items",
            Table::InventoryLogs => "inventory_logs",
            Table::Profits => "profits",
            Table::DebtPayments => "debt_payments",
        }
    }

    /// Tables holding Financial Records (the ledger projection sources)
    pub fn financial() -> [Table; 4] {
        [
            Table::Transfers,
            Table::Debts,
            Table::InventoryLogs,
            Table::DebtPayments,
        ]
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =========================================================================
// Record kinds and classification
// =========================================================================

/// Kind of financial record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Transfer,
    Debt,
    InventorySale,
    InventoryAdd,
    DebtPayment,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Transfer => "transfer",
            RecordKind::Debt => "debt",
            RecordKind::InventorySale => "inventory_sale",
            RecordKind::InventoryAdd => "inventory_add",
            RecordKind::DebtPayment => "debt_payment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(RecordKind::Transfer),
            "debt" => Some(RecordKind::Debt),
            "inventory_sale" => Some(RecordKind::InventorySale),
            "inventory_add" => Some(RecordKind::InventoryAdd),
            "debt_payment" => Some(RecordKind::DebtPayment),
            _ => None,
        }
    }

    /// Table the record's own row lives in
    pub fn table(&self) -> Table {
        match self {
            RecordKind::Transfer => Table::Transfers,
            RecordKind::Debt => Table::Debts,
            RecordKind::InventorySale | RecordKind::InventoryAdd => Table::InventoryLogs,
            RecordKind::DebtPayment => Table::DebtPayments,
        }
    }

    /// Whether reversing this kind touches more than one table
    pub fn is_compound(&self) -> bool {
        match self {
            RecordKind::Transfer | RecordKind::Debt => false,
            RecordKind::InventorySale | RecordKind::InventoryAdd | RecordKind::DebtPayment => {
                true
            }
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record sub type (direction of the money movement)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubType {
    Income,
    Expense,
    OwedToMe,
    OwedByMe,
    Sale,
    Restock,
    PaymentReceived,
    PaymentMade,
}

impl SubType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubType::Income => "income",
            SubType::Expense => "expense",
            SubType::OwedToMe => "owed_to_me",
            SubType::OwedByMe => "owed_by_me",
            SubType::Sale => "sale",
            SubType::Restock => "restock",
            SubType::PaymentReceived => "payment_received",
            SubType::PaymentMade => "payment_made",
        }
    }

    /// Effect on capital: +1 money in, -1 money out, 0 no cash movement
    /// (a debt is a receivable/payable, not a cash flow)
    pub fn capital_direction(&self) -> i8 {
        match self {
            SubType::Income | SubType::Sale | SubType::PaymentReceived => 1,
            SubType::Expense | SubType::Restock | SubType::PaymentMade => -1,
            SubType::OwedToMe | SubType::OwedByMe => 0,
        }
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of the entity a record relates to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Contact,
    Account,
    InventoryItem,
    Debt,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Contact => "contact",
            EntityType::Account => "account",
            EntityType::InventoryItem => "inventory_item",
            EntityType::Debt => "debt",
        }
    }
}

/// The entity (counterparty, item, debt) a record is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub entity_type: EntityType,
    #[serde(default)]
    pub name: Option<String>,
}

impl RelatedEntity {
    pub fn new(entity_type: EntityType, id: Option<Uuid>, name: Option<String>) -> Self {
        Self {
            id,
            entity_type,
            name,
        }
    }
}

// =========================================================================
// Lifecycle
// =========================================================================

/// Record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Confirmed,
    Failed,
    Reversed,
}

/// Lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Confirm,
    Cancel,
    Fail,
    Reverse,
}

/// Result of applying a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Becomes(RecordStatus),
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::Failed => "failed",
            RecordStatus::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "confirmed" => Some(RecordStatus::Confirmed),
            "failed" => Some(RecordStatus::Failed),
            "reversed" => Some(RecordStatus::Reversed),
            _ => None,
        }
    }

    /// Reversed and failed records never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Reversed | RecordStatus::Failed)
    }

    /// ```text
    /// pending --confirm--> confirmed --reverse--> reversed
    /// pending --cancel-->  (deleted)
    /// pending --fail-->    failed
    /// ```
    /// Returns `None` for any other combination.
    pub fn apply(self, transition: Transition) -> Option<TransitionOutcome> {
        match (self, transition) {
            (RecordStatus::Pending, Transition::Confirm) => {
                Some(TransitionOutcome::Becomes(RecordStatus::Confirmed))
            }
            (RecordStatus::Pending, Transition::Cancel) => Some(TransitionOutcome::Deleted),
            (RecordStatus::Pending, Transition::Fail) => {
                Some(TransitionOutcome::Becomes(RecordStatus::Failed))
            }
            (RecordStatus::Confirmed, Transition::Reverse) => {
                Some(TransitionOutcome::Becomes(RecordStatus::Reversed))
            }
            _ => None,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::Confirm => "confirm",
            Transition::Cancel => "cancel",
            Transition::Fail => "fail",
            Transition::Reverse => "reverse",
        };
        f.write_str(s)
    }
}

// =========================================================================
// Financial Record
// =========================================================================

/// Kind-specific data, one variant per record kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordDetails {
    Transfer,
    Debt {
        original_amount: Money,
        settled: bool,
    },
    InventorySale {
        item_id: Uuid,
        quantity_change: i64,
        #[serde(default)]
        profit_record_id: Option<Uuid>,
    },
    InventoryAdd {
        item_id: Uuid,
        quantity_change: i64,
    },
    DebtPayment {
        debt_id: Uuid,
        debt_amount_before: Money,
        debt_amount_after: Money,
        settled_debt: bool,
    },
}

impl RecordDetails {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordDetails::Transfer => RecordKind::Transfer,
            RecordDetails::Debt { .. } => RecordKind::Debt,
            RecordDetails::InventorySale { .. } => RecordKind::InventorySale,
            RecordDetails::InventoryAdd { .. } => RecordKind::InventoryAdd,
            RecordDetails::DebtPayment { .. } => RecordKind::DebtPayment,
        }
    }
}

/// A money movement owned by one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub sub_type: SubType,
    pub amount: Money,
    #[serde(default)]
    pub profit: Option<Money>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub related: Option<RelatedEntity>,
    pub status: RecordStatus,
    pub provisional: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub details: RecordDetails,
}

impl FinancialRecord {
    /// Start a new record; it is pending and provisional until confirmed
    pub fn new(owner_id: Uuid, sub_type: SubType, amount: Money, details: RecordDetails) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            sub_type,
            amount,
            profit: None,
            note: None,
            related: None,
            status: RecordStatus::Pending,
            provisional: true,
            created_at: Utc::now(),
            details,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_profit(mut self, profit: Money) -> Self {
        self.profit = Some(profit);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_related(mut self, related: RelatedEntity) -> Self {
        self.related = Some(related);
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.details.kind()
    }

    pub fn to_row(&self) -> Result<Row, serde_json::Error> {
        to_row(self)
    }

    pub fn from_row(row: Row) -> Result<Self, serde_json::Error> {
        from_row(row)
    }

    /// Outstanding balance of a debt (zero once settled)
    pub fn outstanding(&self) -> Option<Money> {
        match self.details {
            RecordDetails::Debt { settled, .. } => {
                Some(if settled { Money::zero() } else { self.amount })
            }
            _ => None,
        }
    }
}

// =========================================================================
// Supporting rows
// =========================================================================

/// Stock item sold and restocked through inventory records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub quantity: i64,
    /// Capital tied up in one unit
    pub unit_cost: Money,
    /// Margin earned on top of `unit_cost` per unit sold
    pub profit_per_unit: Money,
    pub created_at: DateTime<Utc>,
}

impl InventoryItem {
    /// Cash received for one unit
    pub fn unit_price(&self) -> Result<Money, AmountError> {
        self.unit_cost.checked_add(self.profit_per_unit)
    }
}

/// Profit realised by one sale, tracked apart from the sale amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub sale_log_id: Uuid,
    pub item_id: Uuid,
    pub amount: Money,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn money(v: i64) -> Money {
        Money::new(Decimal::from(v)).unwrap()
    }

    #[test]
    fn test_state_machine() {
        use RecordStatus::*;
        use TransitionOutcome::*;

        assert_eq!(Pending.apply(Transition::Confirm), Some(Becomes(Confirmed)));
        assert_eq!(Pending.apply(Transition::Cancel), Some(Deleted));
        assert_eq!(Pending.apply(Transition::Fail), Some(Becomes(Failed)));
        assert_eq!(Confirmed.apply(Transition::Reverse), Some(Becomes(Reversed)));

        assert_eq!(Pending.apply(Transition::Reverse), None);
        assert_eq!(Confirmed.apply(Transition::Cancel), None);
        assert_eq!(Reversed.apply(Transition::Reverse), None);
        assert_eq!(Failed.apply(Transition::Reverse), None);
        assert_eq!(Failed.apply(Transition::Confirm), None);

        assert!(Reversed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Confirmed.is_terminal());
    }

    #[test]
    fn test_record_row_shape() {
        let owner = Uuid::new_v4();
        let item = Uuid::new_v4();
        let record = FinancialRecord::new(
            owner,
            SubType::Sale,
            money(15),
            RecordDetails::InventorySale {
                item_id: item,
                quantity_change: -3,
                profit_record_id: None,
            },
        )
        .with_profit(money(6));

        let row = record.to_row().unwrap();
        assert_eq!(row["kind"], "inventory_sale");
        assert_eq!(row["quantity_change"], -3);
        assert_eq!(row["status"], "pending");
        assert_eq!(row["provisional"], true);
        assert_eq!(row["amount"], "15.0000");

        let back = FinancialRecord::from_row(row).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.kind(), RecordKind::InventorySale);
    }

    #[test]
    fn test_row_with_extra_fields_still_parses() {
        let record = FinancialRecord::new(
            Uuid::new_v4(),
            SubType::Income,
            money(10),
            RecordDetails::Transfer,
        );
        let mut row = record.to_row().unwrap();
        row.insert("reversal_reason".into(), Value::from("mistake"));

        let back = FinancialRecord::from_row(row).unwrap();
        assert_eq!(back.kind(), RecordKind::Transfer);
    }

    #[test]
    fn test_debt_outstanding() {
        let mut debt = FinancialRecord::new(
            Uuid::new_v4(),
            SubType::OwedToMe,
            money(300),
            RecordDetails::Debt {
                original_amount: money(500),
                settled: false,
            },
        );
        assert_eq!(debt.outstanding(), Some(money(300)));

        debt.details = RecordDetails::Debt {
            original_amount: money(500),
            settled: true,
        };
        assert_eq!(debt.outstanding(), Some(Money::zero()));
    }

    #[test]
    fn test_kind_tables() {
        assert_eq!(RecordKind::InventorySale.table(), Table::InventoryLogs);
        assert_eq!(RecordKind::InventoryAdd.table(), Table::InventoryLogs);
        assert!(RecordKind::InventorySale.is_compound());
        assert!(!RecordKind::Transfer.is_compound());
        assert_eq!(RecordKind::parse("debt_payment"), Some(RecordKind::DebtPayment));
        assert_eq!(RecordKind::parse("profit"), None);
    }

    #[test]
    fn test_fields_helper() {
        let row = fields([("status", Value::from("confirmed")), ("quantity", Value::from(7))]);
        assert_eq!(row.len(), 2);
        assert_eq!(row["quantity"], 7);
    }
}
