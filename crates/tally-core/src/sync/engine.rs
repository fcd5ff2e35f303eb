//! Push of dirty records and watermark-based pull, under last-write-wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::identity::{IdentityReconciler, IdentityStrategy};
use super::report::{AffectedScope, PullAllReport, PullReport, PushReport, TablePushReport};
use crate::db::{ApplyOutcome, LocalRecord, LAST_PULL_AT, LAST_PUSH_AT, LAST_SYNC_ERROR};
use crate::models::{
    Client, Employee, IdMap, LineItem, NamedRecord, Product, RecordId, Table, Transaction,
};
use crate::projection::ViewCache;
use crate::remote::{RemoteQuery, RemoteStore};
use crate::services::LocalStore;
use crate::util::{iso_timestamp, now};
use crate::{Error, Result};

pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const DEFAULT_PUSH_BATCH_SIZE: usize = 500;

/// Tunables of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Rows per pull page; a shorter page ends the sweep
    pub page_size: usize,
    /// Records per upsert call
    pub push_batch_size: usize,
    pub identity_strategy: IdentityStrategy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            identity_strategy: IdentityStrategy::default(),
        }
    }
}

/// Outcome of first-run restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Set when the store was empty and a full pull was attempted
    pub restored: Option<PullAllReport>,
    pub walk_in_seeded: bool,
}

struct EngineInner {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    reconciler: IdentityReconciler,
    options: EngineOptions,
    view: Option<ViewCache>,
    push_lock: Mutex<()>,
}

/// Keeps the local store and the remote store converging. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, options: EngineOptions) -> Self {
        Self::build(store, remote, options, None)
    }

    /// Engine that refreshes `view` after cycles touching the selected day.
    pub fn with_view(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        options: EngineOptions,
        view: ViewCache,
    ) -> Self {
        Self::build(store, remote, options, Some(view))
    }

    fn build(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        options: EngineOptions,
        view: Option<ViewCache>,
    ) -> Self {
        let options = EngineOptions {
            page_size: options.page_size.max(1),
            push_batch_size: options.push_batch_size.max(1),
            ..options
        };
        Self {
            inner: Arc::new(EngineInner {
                reconciler: IdentityReconciler::new(store.clone(), options.identity_strategy),
                store,
                remote,
                options,
                view,
                push_lock: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn options(&self) -> EngineOptions {
        self.inner.options
    }

    pub fn view(&self) -> Option<&ViewCache> {
        self.inner.view.as_ref()
    }

    /// Upload every dirty record, parents before children.
    ///
    /// A failing table stays dirty and does not stop the others. Concurrent
    /// callers wait for the running push to finish first.
    pub async fn push(&self) -> PushReport {
        let _push = self.inner.push_lock.lock().await;
        let mut report = PushReport::default();

        let clients = self.push_named::<Client>(&mut report.scope).await;
        report.tables.push(clients);
        let products = self.push_named::<Product>(&mut report.scope).await;
        report.tables.push(products);
        let employees = self.push_plain::<Employee>(&mut report.scope).await;
        report.tables.push(employees);
        let transactions = self.push_plain::<Transaction>(&mut report.scope).await;
        report.tables.push(transactions);
        let line_items = self.push_plain::<LineItem>(&mut report.scope).await;
        report.tables.push(line_items);

        if report.attempted() > 0 {
            tracing::info!("Push finished: {report}");
        }
        let error = report
            .failures()
            .next()
            .map(|(table, error)| format!("push {table}: {error}"));
        self.record_cycle(LAST_PUSH_AT, error).await;
        self.refresh_view(&report.scope).await;
        report
    }

    /// Push in the background. The outcome is logged; dropping the handle is fine.
    pub fn spawn_push(&self) -> JoinHandle<PushReport> {
        let engine = self.clone();
        tokio::spawn(async move {
            let report = engine.push().await;
            if report.is_success() {
                tracing::debug!("Background push finished: {report}");
            } else {
                tracing::warn!("Background push incomplete: {report}; retrying next cycle");
            }
            report
        })
    }

    /// Send the changed fields of one previously uploaded record instead of
    /// the whole row.
    ///
    /// `patch` is stamped with the record's `updated_at` and only lands on an
    /// older remote row. Returns `false` when it did not land (never uploaded,
    /// gone remotely, or the server holds a newer version); the record then
    /// stays dirty for the next push.
    pub async fn patch<R: LocalRecord>(&self, id: &RecordId, patch: Value) -> Result<bool> {
        let Value::Object(mut fields) = patch else {
            return Err(Error::InvalidInput(format!(
                "patch of {} {id} must be an object",
                R::TABLE
            )));
        };
        let _push = self.inner.push_lock.lock().await;
        let store = &self.inner.store;
        let Some(record) = store.get::<R>(id).await? else {
            return Ok(false);
        };
        if !record.is_dirty() {
            return Ok(true);
        }
        if record.stamps().last_synced_at.is_none() {
            return Ok(false);
        }

        let updated_at = record.stamps().updated_at;
        fields.insert("updated_at".into(), serde_json::to_value(updated_at)?);
        let remote_id = store.load_id_map().await?.remote_id(R::TABLE, id);
        let patched = self
            .inner
            .remote
            .update_by_id(R::TABLE, &remote_id, Value::Object(fields))
            .await?;
        if patched.is_none() {
            tracing::debug!("Patch of {} {id} did not apply; leaving it to the next push", R::TABLE);
            return Ok(false);
        }
        store.mark_synced::<R>(&[(id.clone(), updated_at)], now()).await?;
        tracing::debug!("Patched {} {id}", R::TABLE);
        Ok(true)
    }

    async fn push_named<R: LocalRecord + NamedRecord>(
        &self,
        scope: &mut AffectedScope,
    ) -> TablePushReport {
        let mut report = TablePushReport::new(R::TABLE);
        if let Err(error) = self.try_push_named::<R>(&mut report, scope).await {
            tracing::warn!("Push of {} failed: {error}", R::TABLE);
            report.error = Some(error.to_string());
        }
        report
    }

    async fn try_push_named<R: LocalRecord + NamedRecord>(
        &self,
        report: &mut TablePushReport,
        scope: &mut AffectedScope,
    ) -> Result<()> {
        let dirty = self.inner.store.list_dirty::<R>().await?;
        for chunk in dirty.chunks(self.inner.options.push_batch_size) {
            let ids = self.inner.store.load_id_map().await?;
            let returned = self.upload(chunk, &ids).await?;
            report.attempted += chunk.len();

            let confirmed_at = now();
            let mut confirmed = Vec::new();
            for pushed in chunk {
                match IdentityReconciler::match_returned(pushed, &returned) {
                    Some(stored) if stored.id() == pushed.id() => {
                        self.settle(pushed, stored, &ids, confirmed_at, &mut confirmed, report, scope)
                            .await?;
                    }
                    Some(canonical) => {
                        self.inner
                            .reconciler
                            .reconcile(pushed.id(), canonical.clone(), confirmed_at)
                            .await?;
                        report.reconciled += 1;
                        if R::TABLE == Table::Clients {
                            scope.clients_changed = true;
                        }
                    }
                    None => tracing::warn!(
                        "{} {} missing from upload response; it stays dirty",
                        R::TABLE,
                        pushed.id()
                    ),
                }
            }
            report.synced += self.inner.store.mark_synced::<R>(&confirmed, confirmed_at).await?;
        }
        Ok(())
    }

    async fn push_plain<R: LocalRecord>(&self, scope: &mut AffectedScope) -> TablePushReport {
        let mut report = TablePushReport::new(R::TABLE);
        if let Err(error) = self.try_push_plain::<R>(&mut report, scope).await {
            tracing::warn!("Push of {} failed: {error}", R::TABLE);
            report.error = Some(error.to_string());
        }
        report
    }

    async fn try_push_plain<R: LocalRecord>(
        &self,
        report: &mut TablePushReport,
        scope: &mut AffectedScope,
    ) -> Result<()> {
        let dirty = self.inner.store.list_dirty::<R>().await?;
        for chunk in dirty.chunks(self.inner.options.push_batch_size) {
            let ids = self.inner.store.load_id_map().await?;
            let returned = self.upload(chunk, &ids).await?;
            report.attempted += chunk.len();

            let confirmed_at = now();
            let mut confirmed = Vec::new();
            for pushed in chunk {
                match returned.iter().find(|row| row.id() == pushed.id()) {
                    Some(stored) => {
                        self.settle(pushed, stored, &ids, confirmed_at, &mut confirmed, report, scope)
                            .await?;
                    }
                    None => tracing::warn!(
                        "{} {} missing from upload response; it stays dirty",
                        R::TABLE,
                        pushed.id()
                    ),
                }
            }
            report.synced += self.inner.store.mark_synced::<R>(&confirmed, confirmed_at).await?;
        }
        Ok(())
    }

    async fn upload<R: LocalRecord>(&self, chunk: &[R], ids: &IdMap) -> Result<Vec<R>> {
        let rows = chunk
            .iter()
            .map(|record| record.to_remote(ids))
            .collect::<Result<Vec<_>>>()?;
        let stored = self.inner.remote.upsert(R::TABLE, rows).await?;
        Ok(stored
            .into_iter()
            .filter_map(|row| match R::from_remote(row, ids) {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!("Ignoring undecodable {} row in upload response: {error}", R::TABLE);
                    None
                }
            })
            .collect())
    }

    /// The server stored `stored` for `pushed`: confirm it, or take the
    /// newer version the server kept.
    #[allow(clippy::too_many_arguments)]
    async fn settle<R: LocalRecord>(
        &self,
        pushed: &R,
        stored: &R,
        ids: &IdMap,
        now: DateTime<Utc>,
        confirmed: &mut Vec<(RecordId, DateTime<Utc>)>,
        report: &mut TablePushReport,
        scope: &mut AffectedScope,
    ) -> Result<()> {
        let pushed_at = pushed.stamps().updated_at;
        if stored.stamps().updated_at == pushed_at {
            confirmed.push((pushed.id().clone(), pushed_at));
            return Ok(());
        }

        tracing::debug!(
            "Server kept a different version of {} {}; applying it",
            R::TABLE,
            pushed.id()
        );
        let row = stored.to_remote(ids)?;
        let before = AffectedScope::of_local(&self.inner.store, R::TABLE, pushed.id()).await?;
        if self.inner.store.apply_remote(stored.clone(), now).await? == ApplyOutcome::Applied {
            report.superseded += 1;
            scope.merge(&before);
            scope.merge(&AffectedScope::of_row(&self.inner.store, R::TABLE, &row).await?);
        }
        Ok(())
    }

    /// Bring `table` up to date with rows changed since its watermark.
    ///
    /// The watermark is persisted only after the whole sweep succeeded.
    pub async fn pull(&self, table: Table) -> Result<PullReport> {
        let report = match table {
            Table::Clients => self.pull_table::<Client>().await?,
            Table::Products => self.pull_table::<Product>().await?,
            Table::Employees => self.pull_table::<Employee>().await?,
            Table::Transactions => self.pull_table::<Transaction>().await?,
            Table::LineItems => self.pull_table::<LineItem>().await?,
        };
        if report.fetched > 0 {
            tracing::info!(
                "Pulled {}: {} fetched, {} applied, {} unchanged, {} rejected",
                table,
                report.fetched,
                report.applied,
                report.unchanged,
                report.rejected
            );
        }
        Ok(report)
    }

    async fn pull_table<R: LocalRecord>(&self) -> Result<PullReport> {
        let store = &self.inner.store;
        let page_size = self.inner.options.page_size;
        let watermark = store.watermark(R::TABLE).await?;
        let since = iso_timestamp(watermark);
        let ids = store.load_id_map().await?;
        let mut report = PullReport::new(R::TABLE, watermark);
        let mut newest = watermark;

        loop {
            let query = RemoteQuery::changed_since(&since, report.fetched, page_size);
            let page = self.inner.remote.select(R::TABLE, &query).await?;
            let page_len = page.len();
            report.pages += 1;
            report.fetched += page_len;

            for row in page {
                let record = match R::from_remote(row.clone(), &ids) {
                    Ok(record) => record,
                    Err(error) => {
                        tracing::warn!("Skipping undecodable {} row: {error}", R::TABLE);
                        report.skipped += 1;
                        continue;
                    }
                };
                newest = newest.max(record.stamps().updated_at);
                let before = AffectedScope::of_local(store, R::TABLE, record.id()).await?;
                match store.apply_remote(record, now()).await? {
                    ApplyOutcome::Applied => {
                        report.applied += 1;
                        report.scope.merge(&before);
                        report
                            .scope
                            .merge(&AffectedScope::of_row(store, R::TABLE, &row).await?);
                    }
                    ApplyOutcome::Unchanged => report.unchanged += 1,
                    ApplyOutcome::Rejected => report.rejected += 1,
                }
            }

            if page_len < page_size {
                break;
            }
        }

        if newest > watermark {
            store.advance_watermark(R::TABLE, newest).await?;
        }
        report.watermark_after = store.watermark(R::TABLE).await?;
        Ok(report)
    }

    /// Pull every table in dependency order; one failing table does not stop the rest.
    pub async fn pull_all(&self) -> PullAllReport {
        let mut report = PullAllReport::default();
        for table in Table::ALL {
            match self.pull(table).await {
                Ok(table_report) => report.tables.push(table_report),
                Err(error) => {
                    tracing::warn!("Pull of {table} failed: {error}");
                    report.failures.push((table, error.to_string()));
                }
            }
        }

        let error = report
            .failures
            .first()
            .map(|(table, error)| format!("pull {table}: {error}"));
        self.record_cycle(LAST_PULL_AT, error).await;
        self.refresh_view(&report.scope()).await;
        report
    }

    /// First-run restore: pull everything into an empty store, then make
    /// sure the walk-in client exists.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let store = &self.inner.store;
        let restored = if store.count::<Client>().await? == 0 {
            tracing::info!("Local store is empty; restoring from the remote store");
            Some(self.pull_all().await)
        } else {
            None
        };

        let (walk_in, walk_in_seeded) = store.ensure_walk_in(now()).await?;
        if walk_in_seeded {
            tracing::info!("Seeded walk-in client {}", walk_in.id);
        }
        Ok(BootstrapReport {
            restored,
            walk_in_seeded,
        })
    }

    async fn record_cycle(&self, finished_key: &str, error: Option<String>) {
        let store = &self.inner.store;
        let stamp = iso_timestamp(now());
        let result: Result<()> = async {
            store.set_setting(finished_key, Some(&stamp)).await?;
            store.set_setting(LAST_SYNC_ERROR, error.as_deref()).await
        }
        .await;
        if let Err(error) = result {
            tracing::warn!("Failed to record sync status: {error}");
        }
    }

    async fn refresh_view(&self, scope: &AffectedScope) {
        let Some(view) = &self.inner.view else {
            return;
        };
        if let Err(error) = view.refresh_for(scope).await {
            tracing::warn!("Failed to refresh the ledger view: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DayKey, TransactionKind};
    use crate::models::Record;
    use crate::remote::MemoryRemote;
    use crate::util::{epoch, parse_timestamp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(value: &str) -> DateTime<Utc> {
        parse_timestamp(value).unwrap()
    }

    fn day() -> DayKey {
        "2024-03-01".parse().unwrap()
    }

    async fn engine_with(options: EngineOptions) -> (SyncEngine, MemoryRemote) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let engine = SyncEngine::new(store, Arc::new(remote.clone()), options);
        (engine, remote)
    }

    fn product_row(id: &str, name: &str, updated_at: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "price": 2.0,
            "active": true,
            "created_at": updated_at,
            "updated_at": updated_at
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_uploads_dirty_records_in_batches() {
        let (engine, remote) = engine_with(EngineOptions {
            push_batch_size: 2,
            ..EngineOptions::default()
        })
        .await;
        let now = at("2024-03-01T10:00:00Z");
        for name in ["Tea", "Coffee", "Juice"] {
            engine.store().put(&Product::new(name, 2.0, now)).await.unwrap();
        }

        let report = engine.push().await;
        assert!(report.is_success());
        assert_eq!(report.synced(), 3);
        assert_eq!(remote.upsert_calls(Table::Products), 2);
        assert_eq!(remote.rows(Table::Products).len(), 3);
        assert!(engine.store().list_dirty::<Product>().await.unwrap().is_empty());

        let again = engine.push().await;
        assert_eq!(again.attempted(), 0);
        assert_eq!(remote.upsert_calls(Table::Products), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_table_stays_dirty_without_blocking_others() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        let now = at("2024-03-01T10:00:00Z");
        let client = Client::new("Ana", now);
        let product = Product::new("Tea", 2.0, now);
        engine.store().put(&client).await.unwrap();
        engine.store().put(&product).await.unwrap();
        remote.fail_upserts(Table::Clients, 1);

        let report = engine.push().await;
        let failed: Vec<_> = report.failures().map(|(table, _)| table).collect();
        assert_eq!(failed, vec![Table::Clients]);
        assert_eq!(engine.store().list_dirty::<Client>().await.unwrap(), vec![client]);
        assert!(engine.store().list_dirty::<Product>().await.unwrap().is_empty());
        assert!(engine
            .store()
            .setting(LAST_SYNC_ERROR)
            .await
            .unwrap()
            .is_some_and(|error| error.contains("clients")));

        assert!(engine.push().await.is_success());
        assert!(engine.store().list_dirty::<Client>().await.unwrap().is_empty());
        assert_eq!(engine.store().setting(LAST_SYNC_ERROR).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_adopts_newer_server_version() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        let mut product = Product::new("Tea", 2.0, at("2024-03-01T10:00:00Z"));
        product.id = RecordId::from("p-1");
        engine.store().put(&product).await.unwrap();
        remote
            .insert_row(Table::Products, product_row("p-1", "Green tea", "2024-03-01T11:00:00Z"))
            .unwrap();

        let report = engine.push().await;
        assert_eq!(report.tables[1].superseded, 1);
        let stored = engine
            .store()
            .get::<Product>(&RecordId::from("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "Green tea");
        assert!(!stored.is_dirty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_reconciles_name_collisions_to_the_canonical_row() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        remote
            .insert_row(Table::Products, product_row("R2", "Coffee", "2024-03-01T09:00:00Z"))
            .unwrap();
        let now = at("2024-03-01T10:00:00Z");
        let mut local = Product::new("coffee ", 2.0, now);
        local.id = RecordId::from("L1");
        engine.store().put(&local).await.unwrap();
        let tx = Transaction::new(day(), TransactionKind::Sale, None, now);
        let item = LineItem::for_product(&tx.id, &local, 1, now);
        engine.store().insert_order(&tx, &[item.clone()]).await.unwrap();

        let report = engine.push().await;
        assert!(report.is_success());
        assert_eq!(report.reconciled(), 1);

        let products = engine.store().list_all::<Product>().await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].id, RecordId::from("R2"));
        let remote_item = remote.row(Table::LineItems, &item.id).unwrap();
        assert_eq!(remote_item["product_id"], "R2");
        assert_eq!(remote.rows(Table::Products).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_pages_and_advances_watermark_after_the_sweep() {
        let (engine, remote) = engine_with(EngineOptions {
            page_size: 2,
            ..EngineOptions::default()
        })
        .await;
        for (id, stamp) in [
            ("p-1", "2024-03-01T10:00:00Z"),
            ("p-2", "2024-03-01T10:00:01Z"),
            ("p-3", "2024-03-01T10:00:02Z"),
            ("p-4", "2024-03-01T10:00:03Z"),
        ] {
            remote
                .insert_row(Table::Products, product_row(id, id, stamp))
                .unwrap();
        }

        let report = engine.pull(Table::Products).await.unwrap();
        assert_eq!(report.fetched, 4);
        assert_eq!(report.applied, 4);
        assert_eq!(report.pages, 3);
        assert_eq!(report.watermark_before, epoch());
        assert_eq!(report.watermark_after, at("2024-03-01T10:00:03Z"));

        let again = engine.pull(Table::Products).await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(again.pages, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_sweep_keeps_the_old_watermark() {
        let (engine, remote) = engine_with(EngineOptions {
            page_size: 1,
            ..EngineOptions::default()
        })
        .await;
        for (id, stamp) in [("p-1", "2024-03-01T10:00:00Z"), ("p-2", "2024-03-01T10:00:01Z")] {
            remote
                .insert_row(Table::Products, product_row(id, id, stamp))
                .unwrap();
        }
        remote.fail_selects_after(Table::Products, 1);

        assert!(engine.pull(Table::Products).await.is_err());
        assert_eq!(engine.store().watermark(Table::Products).await.unwrap(), epoch());
        // Rows applied before the failure stay applied
        assert_eq!(engine.store().count::<Product>().await.unwrap(), 1);

        remote.clear_failures();
        let report = engine.pull(Table::Products).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.watermark_after, at("2024-03-01T10:00:01Z"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_all_continues_past_a_failing_table() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        remote
            .insert_row(Table::Products, product_row("p-1", "Tea", "2024-03-01T10:00:00Z"))
            .unwrap();
        remote.fail_selects_after(Table::Clients, 0);

        let report = engine.pull_all().await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, Table::Clients);
        assert_eq!(report.tables.len(), Table::ALL.len() - 1);
        assert_eq!(report.applied(), 1);
        assert!(engine.store().setting(LAST_PULL_AT).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn employees_upload_after_clients_and_follow_reconciliation() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        remote
            .insert_row(
                Table::Clients,
                json!({"id": "R2", "name": "Ana", "updated_at": "2024-03-01T09:00:00Z"}),
            )
            .unwrap();
        let now = at("2024-03-01T10:00:00Z");
        let mut local = Client::new("ana", now);
        local.id = RecordId::from("L1");
        engine.store().put(&local).await.unwrap();
        let employee = Employee::new("Carla", Some(local.id.clone()), now);
        engine.store().put(&employee).await.unwrap();

        let report = engine.push().await;
        assert!(report.is_success());
        let order: Vec<_> = report.tables.iter().map(|table| table.table).collect();
        assert_eq!(order, Table::ALL.to_vec());

        let uploaded = remote.row(Table::Employees, &employee.id).unwrap();
        assert_eq!(uploaded["client_id"], "R2");
        assert!(engine.store().list_dirty::<Employee>().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_scope_includes_the_day_a_transaction_left() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        let now = at("2024-03-01T10:00:00Z");
        let tx = Transaction::new(day(), TransactionKind::Sale, None, now);
        engine.store().insert_order(&tx, &[]).await.unwrap();
        engine.push().await;

        let mut moved = remote.row(Table::Transactions, &tx.id).unwrap();
        moved["date_key"] = json!("2024-03-02");
        moved["updated_at"] = json!("2024-03-01T11:00:00Z");
        remote.insert_row(Table::Transactions, moved).unwrap();

        let report = engine.pull(Table::Transactions).await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.scope.touches(day()));
        assert!(report.scope.touches("2024-03-02".parse().unwrap()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn patch_sends_only_changed_fields_of_uploaded_records() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        let now = at("2024-03-01T10:00:00Z");
        let mut tx = Transaction::new(day(), TransactionKind::Sale, None, now);
        engine.store().insert_order(&tx, &[]).await.unwrap();

        // Never uploaded: nothing to patch yet
        assert!(!engine
            .patch::<Transaction>(&tx.id, json!({"reversed": true}))
            .await
            .unwrap());

        engine.push().await;
        tx.reversed = true;
        tx.stamps.touch(at("2024-03-01T10:05:00Z"));
        engine.store().put(&tx).await.unwrap();

        assert!(engine
            .patch::<Transaction>(&tx.id, json!({"reversed": true}))
            .await
            .unwrap());
        let row = remote.row(Table::Transactions, &tx.id).unwrap();
        assert_eq!(row["reversed"], true);
        assert_eq!(
            parse_timestamp(row["updated_at"].as_str().unwrap()),
            Some(tx.stamps.updated_at)
        );
        assert_eq!(remote.upsert_calls(Table::Transactions), 1);
        assert!(engine.store().list_dirty::<Transaction>().await.unwrap().is_empty());

        assert!(engine
            .patch::<Transaction>(&tx.id, json!("reversed"))
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_restores_then_seeds_walk_in_once() {
        let (engine, remote) = engine_with(EngineOptions::default()).await;
        remote
            .insert_row(
                Table::Clients,
                json!({"id": "c-1", "name": "Ana", "updated_at": "2024-03-01T10:00:00Z"}),
            )
            .unwrap();

        let first = engine.bootstrap().await.unwrap();
        assert!(first.restored.is_some());
        assert!(first.walk_in_seeded);

        let second = engine.bootstrap().await.unwrap();
        assert!(second.restored.is_none());
        assert!(!second.walk_in_seeded);
        assert_eq!(engine.store().count::<Client>().await.unwrap(), 2);
    }
}
