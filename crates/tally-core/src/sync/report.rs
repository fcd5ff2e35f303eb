//! Outcome summaries of push and pull cycles

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{DayKey, LineItem, RecordId, Table, Transaction};
use crate::remote::row_id;
use crate::services::LocalStore;
use crate::Result;

/// Upload outcome of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePushReport {
    pub table: Table,
    /// Dirty records sent
    pub attempted: usize,
    /// Records confirmed and stamped synced
    pub synced: usize,
    /// Records replaced by (or folded into) a server-canonical row
    pub reconciled: usize,
    /// Records where the server kept a newer version, applied locally
    pub superseded: usize,
    /// First failure; the table stays dirty
    pub error: Option<String>,
}

impl TablePushReport {
    pub const fn new(table: Table) -> Self {
        Self {
            table,
            attempted: 0,
            synced: 0,
            reconciled: 0,
            superseded: 0,
            error: None,
        }
    }
}

/// Upload outcome of one push cycle, tables in dependency order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub tables: Vec<TablePushReport>,
    /// Days whose ledger changed through reconciliation or superseded rows
    pub scope: AffectedScope,
}

impl PushReport {
    pub fn attempted(&self) -> usize {
        self.tables.iter().map(|table| table.attempted).sum()
    }

    pub fn synced(&self) -> usize {
        self.tables.iter().map(|table| table.synced).sum()
    }

    pub fn reconciled(&self) -> usize {
        self.tables.iter().map(|table| table.reconciled).sum()
    }

    /// Tables that failed, with their error
    pub fn failures(&self) -> impl Iterator<Item = (Table, &str)> {
        self.tables
            .iter()
            .filter_map(|table| table.error.as_deref().map(|error| (table.table, error)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

impl fmt::Display for PushReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {} of {} records ({} reconciled)",
            self.synced(),
            self.attempted(),
            self.reconciled()
        )?;
        let failed: Vec<_> = self.failures().map(|(table, _)| table.name()).collect();
        if !failed.is_empty() {
            write!(f, "; failed: {}", failed.join(", "))?;
        }
        Ok(())
    }
}

/// Part of the ledger touched by inbound changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedScope {
    pub days: BTreeSet<DayKey>,
    /// Any client changed; display names of every day may be stale
    pub clients_changed: bool,
}

impl AffectedScope {
    pub fn day(day: DayKey) -> Self {
        Self {
            days: BTreeSet::from([day]),
            clients_changed: false,
        }
    }

    pub fn clients() -> Self {
        Self {
            days: BTreeSet::new(),
            clients_changed: true,
        }
    }

    pub fn touches(&self, day: DayKey) -> bool {
        self.clients_changed || self.days.contains(&day)
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty() && !self.clients_changed
    }

    pub fn merge(&mut self, other: &Self) {
        self.days.extend(other.days.iter().copied());
        self.clients_changed |= other.clients_changed;
    }

    /// Scope of a remote row of `table`. Line items resolve their day through
    /// the local parent transaction, so call this while the rows still exist.
    pub async fn of_row(store: &LocalStore, table: Table, row: &Value) -> Result<Self> {
        let mut scope = Self::default();
        match table {
            Table::Clients => scope.clients_changed = true,
            Table::Products | Table::Employees => {}
            Table::Transactions => {
                let day = match row.get("date_key").and_then(Value::as_str) {
                    Some(day) => day.parse().ok(),
                    None => match row_id(row) {
                        Some(id) => store.get::<Transaction>(&id).await?.map(|tx| tx.date_key),
                        None => None,
                    },
                };
                scope.days.extend(day);
            }
            Table::LineItems => {
                let parent = match row.get("transaction_id").and_then(Value::as_str) {
                    Some(parent) => Some(RecordId::from(parent)),
                    None => match row_id(row) {
                        Some(id) => store.get::<LineItem>(&id).await?.map(|item| item.transaction_id),
                        None => None,
                    },
                };
                if let Some(parent) = parent {
                    if let Some(tx) = store.get::<Transaction>(&parent).await? {
                        scope.days.insert(tx.date_key);
                    }
                }
            }
        }
        Ok(scope)
    }

    /// Scope of the row `id` as currently stored. Taken before an inbound
    /// change is applied, so a transaction moving to another day also
    /// refreshes the day it leaves.
    pub async fn of_local(store: &LocalStore, table: Table, id: &RecordId) -> Result<Self> {
        let parent = match table {
            Table::Transactions => Some(id.clone()),
            Table::LineItems => store
                .get::<LineItem>(id)
                .await?
                .map(|item| item.transaction_id),
            Table::Clients | Table::Products | Table::Employees => None,
        };
        let mut scope = Self::default();
        if let Some(parent) = parent {
            if let Some(tx) = store.get::<Transaction>(&parent).await? {
                scope.days.insert(tx.date_key);
            }
        }
        Ok(scope)
    }
}

/// Catch-up outcome of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub table: Table,
    pub fetched: usize,
    pub applied: usize,
    pub unchanged: usize,
    /// Incoming rows older than the local row (logged as conflicts)
    pub rejected: usize,
    /// Rows that could not be decoded
    pub skipped: usize,
    pub pages: usize,
    pub watermark_before: DateTime<Utc>,
    pub watermark_after: DateTime<Utc>,
    pub scope: AffectedScope,
}

impl PullReport {
    pub fn new(table: Table, watermark: DateTime<Utc>) -> Self {
        Self {
            table,
            fetched: 0,
            applied: 0,
            unchanged: 0,
            rejected: 0,
            skipped: 0,
            pages: 0,
            watermark_before: watermark,
            watermark_after: watermark,
            scope: AffectedScope::default(),
        }
    }
}

/// Outcome of pulling every table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullAllReport {
    pub tables: Vec<PullReport>,
    pub failures: Vec<(Table, String)>,
}

impl PullAllReport {
    pub fn applied(&self) -> usize {
        self.tables.iter().map(|table| table.applied).sum()
    }

    pub fn fetched(&self) -> usize {
        self.tables.iter().map(|table| table.fetched).sum()
    }

    /// Union of every table's affected scope
    pub fn scope(&self) -> AffectedScope {
        let mut scope = AffectedScope::default();
        for table in &self.tables {
            scope.merge(&table.scope);
        }
        scope
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for PullAllReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pulled {} rows, applied {}",
            self.fetched(),
            self.applied()
        )?;
        if !self.failures.is_empty() {
            let failed: Vec<_> = self.failures.iter().map(|(table, _)| table.name()).collect();
            write!(f, "; failed: {}", failed.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionKind;
    use crate::util::now;
    use serde_json::json;

    #[test]
    fn client_changes_touch_every_day() {
        let day: DayKey = "2024-03-01".parse().unwrap();
        let mut scope = AffectedScope::default();
        assert!(scope.is_empty());
        assert!(!scope.touches(day));

        scope.merge(&AffectedScope {
            days: BTreeSet::new(),
            clients_changed: true,
        });
        assert!(scope.touches(day));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_scope_reads_the_stored_day() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let stored_day: DayKey = "2024-03-01".parse().unwrap();
        let tx = Transaction::new(stored_day, TransactionKind::Sale, None, now());
        store.insert_order(&tx, &[]).await.unwrap();

        let moved = json!({"id": tx.id.as_str(), "date_key": "2024-03-02"});
        let mut scope = AffectedScope::of_local(&store, Table::Transactions, &tx.id)
            .await
            .unwrap();
        scope.merge(&AffectedScope::of_row(&store, Table::Transactions, &moved).await.unwrap());

        assert!(scope.touches(stored_day));
        assert!(scope.touches("2024-03-02".parse().unwrap()));
        let unknown = AffectedScope::of_local(&store, Table::LineItems, &"missing".into())
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn push_report_lists_failed_tables() {
        let mut products = TablePushReport::new(Table::Products);
        products.attempted = 2;
        products.error = Some("503".into());
        let mut clients = TablePushReport::new(Table::Clients);
        clients.attempted = 1;
        clients.synced = 1;
        let report = PushReport {
            tables: vec![clients, products],
            scope: AffectedScope::default(),
        };

        assert!(!report.is_success());
        assert_eq!(report.to_string(), "pushed 1 of 3 records (0 reconciled); failed: products");
    }
}
