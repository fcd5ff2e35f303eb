//! Daily ledger built from local rows only

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::models::{
    Client, DayKey, LineItem, PreparationStatus, RecordId, Transaction, TransactionKind,
    WALK_IN_NAME,
};
use crate::services::DayRecords;

/// One sale of the day with everything needed to display it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub transaction: Transaction,
    pub client_name: String,
    pub items: Vec<LineItem>,
    /// Σ quantity × unit price
    pub total: f64,
}

impl LedgerEntry {
    pub fn id(&self) -> &RecordId {
        &self.transaction.id
    }

    pub const fn is_reversed(&self) -> bool {
        self.transaction.reversed
    }
}

/// Projection of one day's sales
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyLedger {
    pub day: DayKey,
    pub entries: Vec<LedgerEntry>,
    /// Sum of every non-reversed entry
    pub total: f64,
}

impl DailyLedger {
    pub fn empty(day: DayKey) -> Self {
        Self {
            day,
            entries: Vec::new(),
            total: 0.0,
        }
    }

    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| {
                !entry.is_reversed()
                    && entry.transaction.preparation_status == PreparationStatus::Pending
            })
            .count()
    }
}

/// Build the ledger of `day` from `records`. Rows of other days or kinds are ignored.
pub fn build_daily_ledger(day: DayKey, records: DayRecords) -> DailyLedger {
    let clients: HashMap<&RecordId, &Client> = records
        .clients
        .iter()
        .map(|client| (&client.id, client))
        .collect();

    let mut items_by_tx: HashMap<RecordId, Vec<LineItem>> = HashMap::new();
    for item in records.line_items {
        items_by_tx
            .entry(item.transaction_id.clone())
            .or_default()
            .push(item);
    }

    let mut entries: Vec<LedgerEntry> = records
        .transactions
        .into_iter()
        .filter(|tx| tx.date_key == day && tx.kind == TransactionKind::Sale)
        .map(|transaction| {
            let mut items = items_by_tx.remove(&transaction.id).unwrap_or_default();
            items.sort_by(|a, b| {
                a.stamps
                    .created_at
                    .cmp(&b.stamps.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let client_name = transaction
                .client_id
                .as_ref()
                .and_then(|id| clients.get(id))
                .filter(|client| client.active)
                .map_or_else(|| WALK_IN_NAME.to_string(), |client| client.name.clone());
            let total = items.iter().map(LineItem::total).sum();
            LedgerEntry {
                transaction,
                client_name,
                items,
                total,
            }
        })
        .collect();
    entries.sort_by(compare_entries);

    let total = entries
        .iter()
        .filter(|entry| !entry.is_reversed())
        .map(|entry| entry.total)
        .sum();
    DailyLedger {
        day,
        entries,
        total,
    }
}

/// Reversed last; open orders PENDING before READY; then oldest first, then id.
fn compare_entries(a: &LedgerEntry, b: &LedgerEntry) -> Ordering {
    let (left, right) = (&a.transaction, &b.transaction);
    left.reversed
        .cmp(&right.reversed)
        .then_with(|| {
            if left.reversed {
                Ordering::Equal
            } else {
                status_rank(left.preparation_status).cmp(&status_rank(right.preparation_status))
            }
        })
        .then_with(|| left.stamps.created_at.cmp(&right.stamps.created_at))
        .then_with(|| left.id.cmp(&right.id))
}

const fn status_rank(status: PreparationStatus) -> u8 {
    match status {
        PreparationStatus::Pending => 0,
        PreparationStatus::Ready => 1,
    }
}
