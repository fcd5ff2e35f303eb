//! Shared local store used by the sync engine, the ledger service and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::{
    remap_references, ApplyOutcome, ConflictRepository, Database, LocalRecord, RecordRepository,
    SettingsRepository, WatermarkRepository,
};
use crate::models::{
    Client, ClientKind, DayKey, Employee, IdMap, LineItem, NamedRecord, Product, RecordId,
    SyncConflict, Table, Transaction, TransactionKind, WALK_IN_NAME,
};
use crate::util::{normalize_name, synced_stamp};
use crate::{Error, Result};

/// Rows needed to project one day of the ledger, read under a single lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayRecords {
    pub transactions: Vec<Transaction>,
    pub line_items: Vec<LineItem>,
    pub clients: Vec<Client>,
}

/// Effect of folding a server-canonical row into the local store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Child rows re-pointed at the surviving id
    pub remapped_children: usize,
    /// Local rows removed as duplicates
    pub purged: usize,
}

/// Thread-safe handle to the local `SQLite` store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let path = db_path.clone();
        let db = tokio::task::spawn_blocking(move || Database::open(&path))
            .await
            .map_err(|error| crate::Error::Database(error.to_string()))??;
        tracing::debug!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing file, `None` when in memory.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub async fn get<R: LocalRecord>(&self, id: &RecordId) -> Result<Option<R>> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).get(id)
    }

    pub async fn put<R: LocalRecord>(&self, record: &R) -> Result<()> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).upsert(record)
    }

    /// Upsert many records in one SQL transaction.
    pub async fn put_many<R: LocalRecord>(&self, records: &[R]) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        {
            let repo = RecordRepository::<R>::new(&tx);
            for record in records {
                repo.upsert(record)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn delete<R: LocalRecord>(&self, id: &RecordId) -> Result<bool> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).delete(id)
    }

    pub async fn count<R: LocalRecord>(&self) -> Result<usize> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).count()
    }

    pub async fn list_all<R: LocalRecord>(&self) -> Result<Vec<R>> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).list_all()
    }

    pub async fn list_dirty<R: LocalRecord>(&self) -> Result<Vec<R>> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).list_dirty()
    }

    /// Number of dirty rows per table, in dependency order.
    pub async fn dirty_counts(&self) -> Result<Vec<(Table, usize)>> {
        let db = self.db.lock().await;
        let conn = db.connection();
        Ok(vec![
            (
                Table::Clients,
                RecordRepository::<Client>::new(conn).count_dirty()?,
            ),
            (
                Table::Products,
                RecordRepository::<Product>::new(conn).count_dirty()?,
            ),
            (
                Table::Employees,
                RecordRepository::<Employee>::new(conn).count_dirty()?,
            ),
            (
                Table::Transactions,
                RecordRepository::<Transaction>::new(conn).count_dirty()?,
            ),
            (
                Table::LineItems,
                RecordRepository::<LineItem>::new(conn).count_dirty()?,
            ),
        ])
    }

    /// Stamp `last_synced_at` on uploaded rows whose `updated_at` is unchanged.
    pub async fn mark_synced<R: LocalRecord>(
        &self,
        pushed: &[(RecordId, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).mark_synced(pushed, now)
    }

    /// Apply a remote row under last-write-wins.
    pub async fn apply_remote<R: LocalRecord>(
        &self,
        record: R,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).apply_remote(record, now)
    }

    pub async fn transactions_for_day(
        &self,
        day: DayKey,
        kind: TransactionKind,
    ) -> Result<Vec<Transaction>> {
        let db = self.db.lock().await;
        RecordRepository::<Transaction>::new(db.connection())
            .for_day(&day.to_string(), kind.as_str())
    }

    pub async fn line_items_for_transactions(&self, ids: &[RecordId]) -> Result<Vec<LineItem>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::<LineItem>::new(db.connection());
        let mut items = Vec::new();
        for id in ids {
            items.extend(repo.for_transaction(id)?);
        }
        Ok(items)
    }

    /// Everything the daily ledger of `day` is built from.
    pub async fn day_records(&self, day: DayKey, kind: TransactionKind) -> Result<DayRecords> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let transactions =
            RecordRepository::<Transaction>::new(conn).for_day(&day.to_string(), kind.as_str())?;
        let items = RecordRepository::<LineItem>::new(conn);
        let mut line_items = Vec::new();
        for tx in &transactions {
            line_items.extend(items.for_transaction(&tx.id)?);
        }
        let clients = RecordRepository::<Client>::new(conn).list_all()?;
        Ok(DayRecords {
            transactions,
            line_items,
            clients,
        })
    }

    pub async fn find_by_name_key<R: LocalRecord + NamedRecord>(
        &self,
        name_key: &str,
    ) -> Result<Vec<R>> {
        let db = self.db.lock().await;
        RecordRepository::<R>::new(db.connection()).find_by_name_key(name_key)
    }

    /// Upsert `record` unless another active row already uses its name.
    ///
    /// The name check and the write share one lock, so of two concurrent
    /// writers claiming the same name only the first succeeds.
    pub async fn put_unique_name<R: LocalRecord + NamedRecord>(&self, record: &R) -> Result<()> {
        let db = self.db.lock().await;
        let repo = RecordRepository::<R>::new(db.connection());
        if record.is_active() {
            let taken = repo
                .find_by_name_key(&record.name_key())?
                .iter()
                .any(|existing| existing.is_active() && existing.id() != record.id());
            if taken {
                return Err(Error::DuplicateName {
                    table: R::TABLE.name(),
                    name: record.name().to_string(),
                });
            }
        }
        repo.upsert(record)
    }

    /// Write a transaction and its line items atomically.
    pub async fn insert_order(&self, transaction: &Transaction, items: &[LineItem]) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        RecordRepository::<Transaction>::new(&tx).upsert(transaction)?;
        {
            let repo = RecordRepository::<LineItem>::new(&tx);
            for item in items {
                repo.upsert(item)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The walk-in client, created at `now` when no such client exists yet.
    /// Returns whether it was created.
    pub async fn ensure_walk_in(&self, now: DateTime<Utc>) -> Result<(Client, bool)> {
        let db = self.db.lock().await;
        let repo = RecordRepository::<Client>::new(db.connection());
        let key = normalize_name(WALK_IN_NAME);
        let mut candidates: Vec<Client> = repo
            .list_all()?
            .into_iter()
            .filter(|client| client.kind == ClientKind::WalkIn || client.name_key() == key)
            .collect();
        candidates.sort_by_key(|client| !client.active);
        if let Some(existing) = candidates.into_iter().next() {
            return Ok((existing, false));
        }

        let client = Client::walk_in(now);
        repo.upsert(&client)?;
        Ok((client, true))
    }

    pub async fn watermark(&self, table: Table) -> Result<DateTime<Utc>> {
        let db = self.db.lock().await;
        WatermarkRepository::new(db.connection()).get(table)
    }

    /// Persist a newer watermark; older values are ignored.
    pub async fn advance_watermark(&self, table: Table, value: DateTime<Utc>) -> Result<bool> {
        let db = self.db.lock().await;
        WatermarkRepository::new(db.connection()).advance(table, value)
    }

    /// List recently logged sync conflicts.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        ConflictRepository::new(db.connection()).list(limit)
    }

    /// Id translations for records that kept their local id.
    pub async fn load_id_map(&self) -> Result<IdMap> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let mut ids = IdMap::default();
        for client in RecordRepository::<Client>::new(conn).list_with_remote_id()? {
            if let Some(remote) = client.remote_id {
                ids.insert(Table::Clients, client.id, remote);
            }
        }
        for product in RecordRepository::<Product>::new(conn).list_with_remote_id()? {
            if let Some(remote) = product.remote_id {
                ids.insert(Table::Products, product.id, remote);
            }
        }
        Ok(ids)
    }

    pub async fn setting(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        SettingsRepository::new(db.connection()).get(key)
    }

    pub async fn set_setting(&self, key: &str, value: Option<&str>) -> Result<()> {
        let db = self.db.lock().await;
        let repo = SettingsRepository::new(db.connection());
        match value {
            Some(value) => repo.set(key, value),
            None => repo.remove(key),
        }
    }

    /// Replace the local row `local_id` with the server-canonical row.
    ///
    /// Children referencing the local id, or any other local row with the
    /// same name key, are re-pointed at the canonical id first.
    pub async fn adopt_canonical<R: LocalRecord + NamedRecord>(
        &self,
        local_id: &RecordId,
        mut canonical: R,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let mut outcome = ReconcileOutcome::default();
        {
            let repo = RecordRepository::<R>::new(&tx);
            let canonical_id = canonical.id().clone();
            let mut stale = repo.find_by_name_key(&canonical.name_key())?;
            if let Some(local) = repo.get(local_id)? {
                if !stale.iter().any(|row| row.id() == local.id()) {
                    stale.push(local);
                }
            }

            for row in stale.iter().filter(|row| *row.id() != canonical_id) {
                outcome.remapped_children +=
                    remap_references(&tx, R::TABLE, row.id(), &canonical_id, now)?;
                if repo.delete(row.id())? {
                    outcome.purged += 1;
                }
            }

            canonical.set_remote_id(None);
            let stamps = canonical.stamps_mut();
            stamps.last_synced_at = Some(synced_stamp(now, stamps.updated_at));
            repo.upsert(&canonical)?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Keep `local_id` as the primary key and remember the canonical id.
    pub async fn retain_local<R: LocalRecord + NamedRecord>(
        &self,
        local_id: &RecordId,
        mut canonical: R,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let mut outcome = ReconcileOutcome::default();
        {
            let repo = RecordRepository::<R>::new(&tx);
            let canonical_id = canonical.id().clone();
            let duplicates = repo.find_by_name_key(&canonical.name_key())?;
            for row in duplicates
                .iter()
                .filter(|row| row.id() != local_id && *row.id() != canonical_id)
            {
                outcome.remapped_children +=
                    remap_references(&tx, R::TABLE, row.id(), local_id, now)?;
                if repo.delete(row.id())? {
                    outcome.purged += 1;
                }
            }
            // A pulled copy stored under the canonical id folds into the local row
            if canonical_id != *local_id {
                outcome.remapped_children +=
                    remap_references(&tx, R::TABLE, &canonical_id, local_id, now)?;
                if repo.delete(&canonical_id)? {
                    outcome.purged += 1;
                }
            }

            canonical.set_remote_id((canonical_id != *local_id).then_some(canonical_id));
            canonical.set_id(local_id.clone());
            let stamps = canonical.stamps_mut();
            stamps.last_synced_at = Some(synced_stamp(now, stamps.updated_at));
            repo.upsert(&canonical)?;
        }
        tx.commit()?;
        Ok(outcome)
    }
}
