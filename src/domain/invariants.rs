//! Financial invariant checks
//!
//! Pure functions run before any write is attempted. A record that fails one
//! of these never reaches the store.

use rust_decimal::Decimal;

use super::amount::Money;
use super::error::LedgerError;
use super::record::{EntityType, FinancialRecord, RecordDetails, RecordKind, SubType};

/// Maximum length of a free-text note
pub const MAX_NOTE_LENGTH: usize = 500;

/// Largest stock level an item may hold
pub const MAX_QUANTITY: i64 = 1_000_000_000;

/// Stock after applying `change` to `current`; must stay within
/// `0..=MAX_QUANTITY`
pub fn check_stock_change(current: i64, change: i64) -> Result<i64, LedgerError> {
    match current.checked_add(change) {
        Some(next) if (0..=MAX_QUANTITY).contains(&next) => Ok(next),
        _ => Err(LedgerError::validation(format!(
            "stock of {} changed by {} leaves the range 0..={}",
            current, change, MAX_QUANTITY
        ))),
    }
}

/// Amounts are stored as `Money`, so negativity is unrepresentable; zero is
/// only meaningful for a fully settled debt.
pub fn check_amount(kind: RecordKind, amount: Money) -> Result<(), LedgerError> {
    if amount.is_zero() && kind != RecordKind::Debt {
        return Err(LedgerError::InvalidAmount(format!(
            "{} amount must be greater than zero",
            kind
        )));
    }
    Ok(())
}

/// Profit is tracked next to the amount, never inside it, and only inventory
/// sales carry any. A sale's amount is the capital it returns; the cash
/// received is amount plus profit.
pub fn check_profit(kind: RecordKind, profit: Option<Money>) -> Result<(), LedgerError> {
    if profit.is_some() && kind != RecordKind::InventorySale {
        return Err(LedgerError::validation(format!(
            "{} records do not carry profit",
            kind
        )));
    }
    Ok(())
}

/// Sub types allowed for each record kind
pub fn allowed_sub_types(kind: RecordKind) -> &'static [SubType] {
    match kind {
        RecordKind::Transfer => &[SubType::Income, SubType::Expense],
        RecordKind::Debt => &[SubType::OwedToMe, SubType::OwedByMe],
        RecordKind::InventorySale => &[SubType::Sale],
        RecordKind::InventoryAdd => &[SubType::Restock],
        RecordKind::DebtPayment => &[SubType::PaymentReceived, SubType::PaymentMade],
    }
}

pub fn check_sub_type(kind: RecordKind, sub_type: SubType) -> Result<(), LedgerError> {
    if allowed_sub_types(kind).contains(&sub_type) {
        Ok(())
    } else {
        Err(LedgerError::validation(format!(
            "sub type {} is not valid for {} records",
            sub_type, kind
        )))
    }
}

/// Entity types a record kind may relate to, and whether the relation is
/// mandatory
pub fn allowed_entity_types(kind: RecordKind) -> (&'static [EntityType], bool) {
    match kind {
        RecordKind::Transfer => (&[EntityType::Contact, EntityType::Account], false),
        RecordKind::Debt => (&[EntityType::Contact], true),
        RecordKind::InventorySale | RecordKind::InventoryAdd => {
            (&[EntityType::InventoryItem], true)
        }
        RecordKind::DebtPayment => (&[EntityType::Debt], true),
    }
}

pub fn check_related_entity(
    kind: RecordKind,
    related: Option<(EntityType, Option<uuid::Uuid>)>,
) -> Result<(), LedgerError> {
    let (allowed, required) = allowed_entity_types(kind);
    match related {
        None if required => Err(LedgerError::validation(format!(
            "{} records require a related {}",
            kind,
            allowed
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(" or ")
        ))),
        None => Ok(()),
        Some((entity_type, _)) if !allowed.contains(&entity_type) => {
            Err(LedgerError::validation(format!(
                "{} records cannot relate to a {}",
                kind,
                entity_type.as_str()
            )))
        }
        // Items and debts are rows in this ledger; they must be referenced by id
        Some((EntityType::InventoryItem | EntityType::Debt, None)) => Err(
            LedgerError::validation(format!("{} reference requires an id", kind)),
        ),
        Some(_) => Ok(()),
    }
}

pub fn check_note(note: Option<&str>) -> Result<(), LedgerError> {
    match note {
        Some(note) if note.chars().count() > MAX_NOTE_LENGTH => Err(LedgerError::validation(
            format!("note exceeds {} characters", MAX_NOTE_LENGTH),
        )),
        _ => Ok(()),
    }
}

/// A payment must be positive and no larger than what is still owed
pub fn check_payment(payment: Decimal, outstanding: Money) -> Result<(), LedgerError> {
    if payment <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!(
            "payment must be greater than zero (got {})",
            payment
        )));
    }
    if payment > outstanding.value() {
        return Err(LedgerError::InvalidAmount(format!(
            "payment {} exceeds outstanding amount {}",
            payment, outstanding
        )));
    }
    Ok(())
}

/// Kind-specific shape of the details
fn check_details(record: &FinancialRecord) -> Result<(), LedgerError> {
    match &record.details {
        RecordDetails::Transfer => Ok(()),
        RecordDetails::Debt {
            original_amount,
            settled,
        } => {
            if record.amount > *original_amount {
                return Err(LedgerError::InvalidAmount(format!(
                    "debt amount {} exceeds original amount {}",
                    record.amount, original_amount
                )));
            }
            if !settled && record.amount.is_zero() {
                return Err(LedgerError::InvalidAmount(
                    "open debt must have an amount greater than zero".into(),
                ));
            }
            Ok(())
        }
        RecordDetails::InventorySale {
            quantity_change, ..
        } if *quantity_change >= 0 => Err(LedgerError::validation(
            "sale must decrease quantity",
        )),
        RecordDetails::InventoryAdd {
            quantity_change, ..
        } if *quantity_change <= 0 => Err(LedgerError::validation(
            "restock must increase quantity",
        )),
        RecordDetails::InventorySale { .. } | RecordDetails::InventoryAdd { .. } => Ok(()),
        RecordDetails::DebtPayment {
            debt_amount_before,
            debt_amount_after,
            ..
        } => {
            let paid = debt_amount_before
                .checked_sub(*debt_amount_after)
                .map_err(|e| LedgerError::InvalidAmount(e.to_string()))?;
            if paid != record.amount {
                return Err(LedgerError::InvalidAmount(format!(
                    "payment {} does not match debt change {} -> {}",
                    record.amount, debt_amount_before, debt_amount_after
                )));
            }
            Ok(())
        }
    }
}

/// Run every check against a record about to be written
pub fn validate_record(record: &FinancialRecord) -> Result<(), LedgerError> {
    let kind = record.kind();
    check_amount(kind, record.amount)?;
    check_profit(kind, record.profit)?;
    check_sub_type(kind, record.sub_type)?;
    check_related_entity(
        kind,
        record.related.as_ref().map(|r| (r.entity_type, r.id)),
    )?;
    check_note(record.note.as_deref())?;
    check_details(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::RelatedEntity;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn money(v: Decimal) -> Money {
        Money::new(v).unwrap()
    }

    fn sale(amount: Decimal, profit: Decimal) -> FinancialRecord {
        let item = Uuid::new_v4();
        FinancialRecord::new(
            Uuid::new_v4(),
            SubType::Sale,
            money(amount),
            RecordDetails::InventorySale {
                item_id: item,
                quantity_change: -3,
                profit_record_id: None,
            },
        )
        .with_profit(money(profit))
        .with_related(RelatedEntity::new(
            EntityType::InventoryItem,
            Some(item),
            Some("Pens".into()),
        ))
    }

    #[test]
    fn test_valid_sale() {
        assert!(validate_record(&sale(dec!(15), dec!(6))).is_ok());
    }

    #[test]
    fn test_profit_may_exceed_capital_part() {
        // 3 units at cost 1.50 sold with a 2.00 margin each
        assert!(validate_record(&sale(dec!(4.5), dec!(6))).is_ok());
    }

    #[test]
    fn test_profit_only_on_sales() {
        let err = check_profit(RecordKind::Transfer, Some(money(dec!(1)))).unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
        assert!(check_profit(RecordKind::Transfer, None).is_ok());
    }

    #[test]
    fn test_stock_change_bounds() {
        assert_eq!(check_stock_change(10, -3).unwrap(), 7);
        assert_eq!(check_stock_change(0, MAX_QUANTITY).unwrap(), MAX_QUANTITY);
        assert!(check_stock_change(MAX_QUANTITY, 1).is_err());
        assert!(check_stock_change(2, -3).is_err());
        assert!(check_stock_change(i64::MAX, 1).is_err());
        assert!(check_stock_change(i64::MIN, -1).is_err());
    }

    #[test]
    fn test_zero_amount_rejected() {
        assert!(check_amount(RecordKind::Transfer, Money::zero()).is_err());
        assert!(check_amount(RecordKind::Transfer, money(dec!(0.0001))).is_ok());
    }

    #[test]
    fn test_sub_type_compatibility() {
        assert!(check_sub_type(RecordKind::Transfer, SubType::Income).is_ok());
        assert!(check_sub_type(RecordKind::Transfer, SubType::Sale).is_err());
        assert!(check_sub_type(RecordKind::Debt, SubType::OwedByMe).is_ok());
        assert!(check_sub_type(RecordKind::DebtPayment, SubType::Income).is_err());
    }

    #[test]
    fn test_related_entity_compatibility() {
        assert!(check_related_entity(RecordKind::Transfer, None).is_ok());
        assert!(check_related_entity(RecordKind::Debt, None).is_err());
        assert!(
            check_related_entity(RecordKind::Debt, Some((EntityType::Contact, None))).is_ok()
        );
        assert!(check_related_entity(
            RecordKind::Debt,
            Some((EntityType::InventoryItem, Some(Uuid::new_v4())))
        )
        .is_err());
        assert!(
            check_related_entity(RecordKind::InventorySale, Some((EntityType::InventoryItem, None)))
                .is_err()
        );
    }

    #[test]
    fn test_note_length() {
        assert!(check_note(None).is_ok());
        assert!(check_note(Some(&"x".repeat(500))).is_ok());
        assert!(check_note(Some(&"x".repeat(501))).is_err());
    }

    #[test]
    fn test_payment_bounds() {
        let outstanding = money(dec!(500));
        assert!(check_payment(dec!(200), outstanding).is_ok());
        assert!(check_payment(dec!(500), outstanding).is_ok());

        let err = check_payment(dec!(0), outstanding).unwrap_err();
        assert_eq!(err.error_code(), "invalid_amount");
        let err = check_payment(dec!(-5), outstanding).unwrap_err();
        assert_eq!(err.error_code(), "invalid_amount");
        let err = check_payment(dec!(500.0001), outstanding).unwrap_err();
        assert_eq!(err.error_code(), "invalid_amount");
    }

    #[test]
    fn test_sale_must_decrease_quantity() {
        let mut record = sale(dec!(15), dec!(6));
        if let RecordDetails::InventorySale {
            quantity_change, ..
        } = &mut record.details
        {
            *quantity_change = 3;
        }
        assert!(validate_record(&record).is_err());
    }
}
