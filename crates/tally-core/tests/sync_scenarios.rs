//! End-to-end sync scenarios against the in-memory remote store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tally_core::models::{PreparationStatus, RecordId, TransactionKind};
use tally_core::projection::ViewCache;
use tally_core::realtime::{ChangeEvent, ChangeKind, RealtimeSubscriber};
use tally_core::remote::{MemoryRemote, RemoteError, RemoteQuery, RemoteStore};
use tally_core::services::{OrderLine, OrderRequest};
use tally_core::sync::{EngineOptions, IncrementalPuller, DEFAULT_PULL_INTERVAL};
use tally_core::util::{now, parse_timestamp};
use tally_core::{
    Client, DayKey, LedgerService, LineItem, LocalStore, Product, SyncEngine, Table, Transaction,
};
use tokio::sync::Notify;

async fn device(remote: &MemoryRemote) -> (SyncEngine, LedgerService) {
    device_with(remote, EngineOptions::default()).await
}

async fn device_with(remote: &MemoryRemote, options: EngineOptions) -> (SyncEngine, LedgerService) {
    let store = LocalStore::open_in_memory().await.unwrap();
    let engine = SyncEngine::new(store.clone(), Arc::new(remote.clone()), options);
    (engine, LedgerService::new(store))
}

fn day(value: &str) -> DayKey {
    value.parse().unwrap()
}

fn at(value: &str) -> chrono::DateTime<chrono::Utc> {
    parse_timestamp(value).unwrap()
}

/// Remote store whose upserts wait until the test releases them.
struct GatedRemote {
    inner: MemoryRemote,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn upsert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.upsert(table, rows).await
    }

    async fn select(&self, table: Table, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        self.inner.select(table, query).await
    }

    async fn update_by_id(
        &self,
        table: Table,
        id: &RecordId,
        patch: Value,
    ) -> Result<Option<Value>, RemoteError> {
        self.inner.update_by_id(table, id, patch).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn replaying_a_realtime_event_is_idempotent() {
    let remote = MemoryRemote::new();
    let store = LocalStore::open_in_memory().await.unwrap();
    let subscriber = RealtimeSubscriber::new(Arc::new(remote), store.clone());
    let event = ChangeEvent {
        kind: ChangeKind::Insert,
        table: Table::Products,
        new_row: Some(json!({
            "id": "p-1",
            "name": "Coffee",
            "price": 2.5,
            "active": true,
            "updated_at": "2024-03-01T10:00:00Z"
        })),
        old_row: None,
    };

    assert!(subscriber.apply(event.clone()).await.unwrap());
    let once: Option<Product> = store.get(&"p-1".into()).await.unwrap();

    for _ in 0..3 {
        assert!(!subscriber.apply(event.clone()).await.unwrap());
    }
    let replayed: Option<Product> = store.get(&"p-1".into()).await.unwrap();

    assert_eq!(replayed, once);
    assert_eq!(store.count::<Product>().await.unwrap(), 1);
    assert!(store.list_conflicts(10).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_edits_converge_to_the_latest_write() {
    let remote = MemoryRemote::new();
    let (engine_a, ledger_a) = device(&remote).await;
    let (engine_b, ledger_b) = device(&remote).await;

    let client = ledger_a.create_client("Ana").await.unwrap();
    let coffee = ledger_a.create_product("Coffee", 2.5).await.unwrap();
    assert!(engine_a.push().await.is_success());
    assert!(engine_b.pull_all().await.is_success());

    // B edits first, A later; A uploads first.
    ledger_b.set_product_price(&coffee.id, 3.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    ledger_a.set_product_price(&coffee.id, 4.0).await.unwrap();
    ledger_b.rename_client(&client.id, "Ana Maria").await.unwrap();

    assert!(engine_a.push().await.is_success());
    assert!(engine_b.push().await.is_success());
    assert!(engine_a.pull_all().await.is_success());
    assert!(engine_b.pull_all().await.is_success());

    for store in [engine_a.store(), engine_b.store()] {
        let product: Product = store.get(&coffee.id).await.unwrap().unwrap();
        let renamed: Client = store.get(&client.id).await.unwrap().unwrap();
        assert_eq!(product.price, 4.0);
        assert_eq!(renamed.name, "Ana Maria");
        assert!(store.list_dirty::<Product>().await.unwrap().is_empty());
        assert!(store.list_dirty::<Client>().await.unwrap().is_empty());
    }
    let row = remote.row(Table::Products, &coffee.id).unwrap();
    assert_eq!(row["price"], json!(4.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn watermark_never_moves_back() {
    let remote = MemoryRemote::new();
    let (engine, _) = device_with(
        &remote,
        EngineOptions {
            page_size: 2,
            ..EngineOptions::default()
        },
    )
    .await;
    for (id, stamp) in [
        ("c-1", "2024-03-01T10:00:00Z"),
        ("c-2", "2024-03-01T10:01:00Z"),
        ("c-3", "2024-03-01T10:02:00Z"),
        ("c-4", "2024-03-01T10:03:00Z"),
    ] {
        remote
            .insert_row(Table::Clients, json!({"id": id, "name": id, "updated_at": stamp}))
            .unwrap();
    }
    let store = engine.store();
    let before = store.watermark(Table::Clients).await.unwrap();

    remote.fail_selects_after(Table::Clients, 1);
    assert!(engine.pull(Table::Clients).await.is_err());
    assert_eq!(store.watermark(Table::Clients).await.unwrap(), before);

    remote.clear_failures();
    engine.pull(Table::Clients).await.unwrap();
    let swept = store.watermark(Table::Clients).await.unwrap();
    assert_eq!(swept, at("2024-03-01T10:03:00Z"));

    assert!(!store
        .advance_watermark(Table::Clients, at("2024-03-01T09:00:00Z"))
        .await
        .unwrap());
    let report = engine.pull(Table::Clients).await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(store.watermark(Table::Clients).await.unwrap(), swept);
}

#[tokio::test(flavor = "multi_thread")]
async fn edits_during_a_push_stay_dirty() {
    let memory = MemoryRemote::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = GatedRemote {
        inner: memory.clone(),
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    };
    let store = LocalStore::open_in_memory().await.unwrap();
    let engine = SyncEngine::new(store.clone(), Arc::new(gated), EngineOptions::default());
    let ledger = LedgerService::new(store.clone());
    let client = ledger.create_client("Ana").await.unwrap();

    let push = engine.spawn_push();
    entered.notified().await;
    ledger.rename_client(&client.id, "Ana Maria").await.unwrap();
    release.notify_one();
    let report = push.await.unwrap();

    assert_eq!(report.synced(), 1);
    assert_eq!(memory.row(Table::Clients, &client.id).unwrap()["name"], json!("Ana"));
    let dirty: Vec<Client> = store.list_dirty().await.unwrap();
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].name, "Ana Maria");

    release.notify_one();
    assert!(engine.push().await.is_success());
    assert_eq!(
        memory.row(Table::Clients, &client.id).unwrap()["name"],
        json!("Ana Maria")
    );
    assert!(store.list_dirty::<Client>().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn ledger_orders_pending_then_ready_then_reversed() {
    let store = LocalStore::open_in_memory().await.unwrap();
    let view = ViewCache::new(store.clone());
    let sale = |status, reversed, created: &str| {
        let mut tx = Transaction::new(day("2024-03-01"), TransactionKind::Sale, None, at(created));
        tx.preparation_status = status;
        tx.reversed = reversed;
        tx
    };
    let a = sale(PreparationStatus::Pending, false, "2024-03-01T10:00:00Z");
    let b = sale(PreparationStatus::Ready, false, "2024-03-01T09:00:00Z");
    let c = sale(PreparationStatus::Pending, true, "2024-03-01T08:00:00Z");
    store.put_many(&[c.clone(), b.clone(), a.clone()]).await.unwrap();

    let ledger = view.select_day(day("2024-03-01")).await.unwrap();
    let order: Vec<_> = ledger.entries.iter().map(|entry| entry.id().clone()).collect();
    assert_eq!(order, vec![a.id, b.id, c.id]);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_product_reconciles_to_the_canonical_id() {
    let remote = MemoryRemote::new();
    let (engine, ledger) = device(&remote).await;
    remote
        .insert_row(
            Table::Products,
            json!({"id": "R2", "name": "coffee ", "price": 2.5, "active": true,
                   "updated_at": "2024-03-01T09:00:00Z"}),
        )
        .unwrap();

    let local = ledger.create_product("Coffee", 2.5).await.unwrap();
    assert_ne!(local.id.as_str(), "R2");
    let order = ledger
        .place_order(OrderRequest {
            day: Some(day("2024-03-01")),
            lines: vec![OrderLine {
                product_id: local.id.clone(),
                quantity: 1,
            }],
            ..OrderRequest::default()
        })
        .await
        .unwrap();

    let report = engine.push().await;
    assert!(report.is_success());
    assert_eq!(report.reconciled(), 1);

    let products: Vec<Product> = engine.store().list_all().await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id.as_str(), "R2");
    let item: LineItem = engine.store().get(&order.items[0].id).await.unwrap().unwrap();
    assert_eq!(item.product_id.as_ref().map(RecordId::as_str), Some("R2"));
    assert_eq!(remote.rows(Table::Products).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_pull_triggers_in_one_tick_run_once() {
    let remote = MemoryRemote::new();
    remote.set_latency(Some(Duration::from_millis(50)));
    let (engine, _) = device(&remote).await;
    let puller = IncrementalPuller::new(engine, DEFAULT_PULL_INTERVAL);

    let (first, second) = tokio::join!(puller.run_once(), puller.run_once());
    assert_eq!(
        [first.is_some(), second.is_some()].iter().filter(|ran| **ran).count(),
        1
    );
    assert_eq!(remote.select_calls(Table::Clients), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_table_does_not_block_the_others() {
    let remote = MemoryRemote::new();
    let (engine, ledger) = device(&remote).await;
    let client = ledger.create_client("Ana").await.unwrap();
    let coffee = ledger.create_product("Coffee", 2.5).await.unwrap();
    remote.fail_upserts(Table::Products, 1);

    let report = engine.push().await;
    let failed: Vec<Table> = report.failures().map(|(table, _)| table).collect();
    assert_eq!(failed, vec![Table::Products]);
    assert!(remote.row(Table::Clients, &client.id).is_some());
    assert!(remote.row(Table::Products, &coffee.id).is_none());

    assert!(engine.push().await.is_success());
    assert!(remote.row(Table::Products, &coffee.id).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_restores_then_seeds_walk_in_once() {
    let remote = MemoryRemote::new();
    remote
        .insert_row(
            Table::Clients,
            json!({"id": "c-1", "name": "Ana", "updated_at": "2024-03-01T10:00:00Z"}),
        )
        .unwrap();
    let (engine, ledger) = device(&remote).await;

    let first = engine.bootstrap().await.unwrap();
    assert_eq!(first.restored.map(|report| report.applied()), Some(1));
    assert!(first.walk_in_seeded);

    let second = engine.bootstrap().await.unwrap();
    assert!(second.restored.is_none());
    assert!(!second.walk_in_seeded);

    let walk_in = ledger.ensure_walk_in_client().await.unwrap();
    let clients = ledger.list_clients(true).await.unwrap();
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().any(|client| client.id == walk_in.id));
    assert!(now() >= walk_in.stamps.created_at);
}
