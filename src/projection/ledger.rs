//! Ledger entries
//!
//! One entry per non-provisional financial record, re-derived whenever the
//! record's status changes.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    EntityType, FinancialRecord, Money, RecordDetails, RecordKind, RecordStatus, SubType,
};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Read-optimized view of one financial record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub record_type: RecordKind,
    pub sub_type: SubType,
    pub amount: Money,
    pub profit: Option<Money>,
    pub related_entity_id: Option<Uuid>,
    pub related_entity_type: Option<EntityType>,
    pub related_entity_name: Option<String>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_record(record: &FinancialRecord) -> Self {
        let related = record.related.as_ref();
        // Inventory and payment rows always point at their parent even when
        // the caller sent no related entity
        let fallback_id = match &record.details {
            RecordDetails::InventorySale { item_id, .. }
            | RecordDetails::InventoryAdd { item_id, .. } => Some(*item_id),
            RecordDetails::DebtPayment { debt_id, .. } => Some(*debt_id),
            RecordDetails::Transfer | RecordDetails::Debt { .. } => None,
        };

        Self {
            id: record.id,
            record_type: record.kind(),
            sub_type: record.sub_type,
            amount: record.amount,
            profit: record.profit,
            related_entity_id: related.and_then(|r| r.id).or(fallback_id),
            related_entity_type: related.map(|r| r.entity_type),
            related_entity_name: related.and_then(|r| r.name.clone()),
            status: record.status,
            created_at: record.created_at,
        }
    }
}

/// Filters for listing ledger entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub record_type: Option<RecordKind>,
    pub status: Option<RecordStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl LedgerFilter {
    pub fn with_record_type(mut self, record_type: RecordKind) -> Self {
        self.record_type = Some(record_type);
        self
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Inclusive date range
    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Provisional records are never part of the ledger
    pub fn matches(&self, record: &FinancialRecord) -> bool {
        !record.provisional
            && self.record_type.map_or(true, |k| k == record.kind())
            && self.status.map_or(true, |s| s == record.status)
            && self.from.map_or(true, |from| record.created_at >= from)
            && self.to.map_or(true, |to| record.created_at <= to)
    }
}

/// Page of results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Pagination {
    /// Clamp caller-supplied paging to `1..=MAX_PAGE_SIZE`
    pub fn new(limit: Option<i64>, offset: Option<i64>, default_limit: i64) -> Self {
        Self {
            limit: limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0).max(0),
        }
    }

    /// Everything, for internal aggregates
    pub fn all() -> Self {
        Self {
            limit: i64::MAX,
            offset: 0,
        }
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(usize::try_from(self.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(self.limit).unwrap_or(usize::MAX))
            .collect()
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

/// Aggregate counts over the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_entries: u64,
    pub active_entries: u64,
    pub reversed_or_deleted_entries: u64,
    pub today_entries: u64,
}

impl LedgerSummary {
    pub fn from_entries(entries: &[LedgerEntry], today: NaiveDate) -> Self {
        entries.iter().fold(Self::default(), |mut summary, entry| {
            summary.total_entries += 1;
            match entry.status {
                RecordStatus::Confirmed => summary.active_entries += 1,
                RecordStatus::Reversed | RecordStatus::Failed => {
                    summary.reversed_or_deleted_entries += 1
                }
                RecordStatus::Pending => {}
            }
            if entry.created_at.date_naive() == today {
                summary.today_entries += 1;
            }
            summary
        })
    }
}

/// Capital and profit, reported separately. Only confirmed entries count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapitalProfitTotals {
    pub capital_in: Decimal,
    pub capital_out: Decimal,
    pub net_capital: Decimal,
    pub profit: Decimal,
}

impl CapitalProfitTotals {
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let mut totals = entries
            .iter()
            .filter(|e| e.status == RecordStatus::Confirmed)
            .fold(Self::default(), |mut totals, entry| {
                match entry.sub_type.capital_direction() {
                    1 => totals.capital_in += entry.amount.value(),
                    -1 => totals.capital_out += entry.amount.value(),
                    _ => {}
                }
                if let Some(profit) = entry.profit {
                    totals.profit += profit.value();
                }
                totals
            });
        totals.net_capital = totals.capital_in - totals.capital_out;
        totals
    }
}
