//! Money types
//!
//! Domain primitives for monetary values with business rule validation.
//! All values are validated at construction time, ensuring invalid values
//! cannot exist in the system.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum allowed value (1 trillion)
fn max_amount() -> Decimal {
    Decimal::new(1_000_000_000_000, 0)
}

/// Maximum decimal places (4)
pub const MAX_SCALE: u32 = 4;

/// Errors that can occur when creating an Amount or Money value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount must be positive (got {0})")]
    NotPositive(Decimal),

    #[error("Amount must not be negative (got {0})")]
    Negative(Decimal),

    #[error("Amount has too many decimal places (max {MAX_SCALE}, got {0})")]
    TooManyDecimals(u32),

    #[error("Amount exceeds maximum allowed value (1000000000000)")]
    Overflow,

    #[error("Invalid amount format: {0}")]
    ParseError(String),
}

fn check_bounds(value: Decimal) -> Result<(), AmountError> {
    if value.scale() > MAX_SCALE {
        return Err(AmountError::TooManyDecimals(value.scale()));
    }
    if value > max_amount() {
        return Err(AmountError::Overflow);
    }
    Ok(())
}

/// Amount represents a strictly positive monetary value supplied by a caller
/// (a payment, a sale price).
///
/// # Invariants
/// - Value is always positive (> 0)
/// - Maximum 4 decimal places
/// - Maximum value is 1 trillion
///
/// # Example
/// ```
/// use rust_decimal::Decimal;
/// use biz_ledger::domain::Amount;
///
/// let amount = Amount::new(Decimal::new(100, 0)).unwrap();
/// assert_eq!(amount.value(), Decimal::new(100, 0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(Decimal);

impl Amount {
    /// Create a new Amount with validation.
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value <= Decimal::ZERO {
            return Err(AmountError::NotPositive(value));
        }
        check_bounds(value)?;
        Ok(Self(value))
    }

    /// Create an Amount from an integer (no decimal places).
    pub fn from_integer(value: i64) -> Result<Self, AmountError> {
        Self::new(Decimal::from(value))
    }

    /// Get the underlying Decimal value.
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Widen into a (non-negative) Money value.
    pub fn to_money(self) -> Money {
        Money(self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decimal = Decimal::from_str(s.trim())
            .map_err(|e| AmountError::ParseError(e.to_string()))?;
        Amount::new(decimal)
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Amount::from_str(&value)
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        format!("{:.4}", amount.0)
    }
}

/// Money is a stored monetary figure: a record's `amount` or `profit`.
/// Unlike Amount, Money can be zero.
///
/// Serialised with a fixed scale so the stored text of a value never changes
/// between reads; optimistic-concurrency preconditions compare it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(Decimal);

impl Money {
    /// Create a new Money value (zero or positive)
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value < Decimal::ZERO {
            return Err(AmountError::Negative(value));
        }
        check_bounds(value)?;
        Ok(Self(value.normalize().round_dp(MAX_SCALE)))
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Add two money values
    pub fn checked_add(&self, other: Money) -> Result<Money, AmountError> {
        Money::new(self.0 + other.0)
    }

    /// Subtract, failing if the result would be negative
    pub fn checked_sub(&self, other: Money) -> Result<Money, AmountError> {
        Money::new(self.0 - other.0)
    }

    /// Multiply by a whole quantity (units sold, units restocked)
    pub fn times(&self, quantity: i64) -> Result<Money, AmountError> {
        let product = self
            .0
            .checked_mul(Decimal::from(quantity))
            .ok_or(AmountError::Overflow)?;
        Money::new(product)
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

impl FromStr for Money {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decimal = Decimal::from_str(s.trim())
            .map_err(|e| AmountError::ParseError(e.to_string()))?;
        Money::new(decimal)
    }
}

impl TryFrom<String> for Money {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Money::from_str(&value)
    }
}

impl From<Money> for String {
    fn from(money: Money) -> Self {
        format!("{:.4}", money.0)
    }
}

impl From<Amount> for Money {
    fn from(amount: Amount) -> Self {
        amount.to_money()
    }
}

/// Same text as the serde form, for building row fields and preconditions
impl From<Money> for serde_json::Value {
    fn from(money: Money) -> Self {
        serde_json::Value::String(money.into())
    }
}
