//! Per-table live subscriptions applying remote changes to the local store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::{ChangeEvent, ChangeFeed, ChangeKind, FeedSubscription};
use crate::db::{ApplyOutcome, LocalRecord};
use crate::models::{
    Client, Employee, IdMap, LineItem, Product, RecordId, Table, Transaction,
};
use crate::projection::ViewCache;
use crate::services::LocalStore;
use crate::sync::AffectedScope;
use crate::util::now;
use crate::Result;

/// Lifecycle of one table's subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Live,
    Errored(String),
    Closed,
}

impl SubscriptionState {
    /// Connecting or live; starting again would duplicate the feed
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Live)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Live => f.write_str("live"),
            Self::Errored(reason) => write!(f, "errored: {reason}"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: SubscriptionState,
    /// Set by `start`, cleared by `stop_all`; reconnects only revive wanted tables
    wanted: bool,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SubscriptionState::Closed,
            wanted: false,
            generation: 0,
            task: None,
        }
    }
}

struct SubscriberInner {
    feed: Arc<dyn ChangeFeed>,
    store: LocalStore,
    view: Option<ViewCache>,
    slots: Mutex<HashMap<Table, Slot>>,
}

/// Holds at most one live subscription per table. Cheap to clone.
#[derive(Clone)]
pub struct RealtimeSubscriber {
    inner: Arc<SubscriberInner>,
}

impl RealtimeSubscriber {
    pub fn new(feed: Arc<dyn ChangeFeed>, store: LocalStore) -> Self {
        Self::build(feed, store, None)
    }

    /// Subscriber that refreshes `view` when an event touches the selected day.
    pub fn with_view(feed: Arc<dyn ChangeFeed>, store: LocalStore, view: ViewCache) -> Self {
        Self::build(feed, store, Some(view))
    }

    fn build(feed: Arc<dyn ChangeFeed>, store: LocalStore, view: Option<ViewCache>) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                feed,
                store,
                view,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Table, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, table: Table) -> SubscriptionState {
        self.slots()
            .get(&table)
            .map_or(SubscriptionState::Closed, |slot| slot.state.clone())
    }

    /// State of every table, in dependency order
    pub fn states(&self) -> Vec<(Table, SubscriptionState)> {
        Table::ALL
            .into_iter()
            .map(|table| (table, self.state(table)))
            .collect()
    }

    /// Subscribe to `table`. Returns `false` when a subscription is already
    /// connecting or live, or when connecting failed (the error is logged).
    pub async fn start(&self, table: Table) -> bool {
        let generation = {
            let mut slots = self.slots();
            let slot = slots.entry(table).or_default();
            slot.wanted = true;
            if slot.state.is_active() {
                return false;
            }
            slot.generation += 1;
            slot.state = SubscriptionState::Connecting;
            slot.generation
        };

        match self.inner.feed.subscribe(table).await {
            Ok(subscription) => self.go_live(table, generation, subscription),
            Err(error) => {
                tracing::warn!("Realtime subscription to {table} failed: {error}");
                self.set_state(table, generation, SubscriptionState::Errored(error.to_string()));
                false
            }
        }
    }

    /// Subscribe to every table not yet subscribed. Returns how many went live.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for table in Table::ALL {
            if self.start(table).await {
                started += 1;
            }
        }
        started
    }

    /// Re-subscribe started tables whose subscription is not live.
    pub async fn reconnect(&self) -> usize {
        let stale: Vec<Table> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.wanted && !slot.state.is_active())
            .map(|(table, _)| *table)
            .collect();
        let mut revived = 0;
        for table in stale {
            if self.start(table).await {
                revived += 1;
            }
        }
        if revived > 0 {
            tracing::info!("Realtime reconnected {revived} table subscriptions");
        }
        revived
    }

    /// Drop every subscription.
    pub fn stop_all(&self) {
        let mut slots = self.slots();
        for (table, slot) in slots.iter_mut() {
            slot.wanted = false;
            slot.generation += 1;
            slot.state = SubscriptionState::Closed;
            if let Some(task) = slot.task.take() {
                task.abort();
                tracing::debug!("Closed realtime subscription to {table}");
            }
        }
    }

    fn go_live(&self, table: Table, generation: u64, mut subscription: FeedSubscription) -> bool {
        let mut slots = self.slots();
        let slot = slots.entry(table).or_default();
        if slot.generation != generation || !slot.wanted {
            // Stopped while connecting
            return false;
        }

        let subscriber = self.clone();
        slot.task = Some(tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    Ok(event) => {
                        if let Err(error) = subscriber.apply(event).await {
                            tracing::warn!("Failed to apply realtime {table} event: {error}");
                        }
                    }
                    Err(error) => {
                        tracing::warn!("Realtime feed for {table} failed: {error}");
                        subscriber.set_state(
                            table,
                            generation,
                            SubscriptionState::Errored(error.to_string()),
                        );
                        return;
                    }
                }
            }
            subscriber.set_state(
                table,
                generation,
                SubscriptionState::Errored("feed ended".to_string()),
            );
        }));
        slot.state = SubscriptionState::Live;
        tracing::info!("Realtime subscription to {table} is live");
        true
    }

    fn set_state(&self, table: Table, generation: u64, state: SubscriptionState) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&table) {
            if slot.generation == generation {
                slot.state = state;
                slot.task = None;
            }
        }
    }

    /// Apply one change event. Returns whether local state changed.
    ///
    /// Replaying an event leaves the store as it was after the first delivery.
    pub async fn apply(&self, event: ChangeEvent) -> Result<bool> {
        let store = &self.inner.store;
        let Some(id) = event.record_id() else {
            tracing::warn!("Ignoring realtime {} event without id", event.table);
            return Ok(false);
        };
        let table = event.table;
        let ids = store.load_id_map().await?;

        let scope = match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = event.new_row else {
                    return Ok(false);
                };
                let mut scope =
                    AffectedScope::of_local(store, table, &ids.local_id(table, &id)).await?;
                let outcome = match table {
                    Table::Clients => apply_row::<Client>(store, &row, &ids).await?,
                    Table::Products => apply_row::<Product>(store, &row, &ids).await?,
                    Table::Employees => apply_row::<Employee>(store, &row, &ids).await?,
                    Table::Transactions => apply_row::<Transaction>(store, &row, &ids).await?,
                    Table::LineItems => apply_row::<LineItem>(store, &row, &ids).await?,
                };
                if outcome != ApplyOutcome::Applied {
                    return Ok(false);
                }
                scope.merge(&AffectedScope::of_row(store, table, &row).await?);
                scope
            }
            ChangeKind::Delete => {
                let local_id = ids.local_id(table, &id);
                let row = event
                    .old_row
                    .unwrap_or_else(|| json!({ "id": local_id.as_str() }));
                let scope = AffectedScope::of_row(store, table, &row).await?;
                let deleted = match table {
                    Table::Clients => store.delete::<Client>(&local_id).await?,
                    Table::Products => store.delete::<Product>(&local_id).await?,
                    Table::Employees => store.delete::<Employee>(&local_id).await?,
                    Table::Transactions => store.delete::<Transaction>(&local_id).await?,
                    Table::LineItems => store.delete::<LineItem>(&local_id).await?,
                };
                if !deleted {
                    return Ok(false);
                }
                tracing::debug!("Removed {table} {local_id} after remote delete");
                scope
            }
        };

        if let Some(view) = &self.inner.view {
            view.refresh_for(&scope).await?;
        }
        Ok(true)
    }
}

async fn apply_row<R: LocalRecord>(
    store: &LocalStore,
    row: &Value,
    ids: &IdMap,
) -> Result<ApplyOutcome> {
    let record = R::from_remote(row.clone(), ids)?;
    let id: RecordId = record.id().clone();
    let outcome = store.apply_remote(record, now()).await?;
    tracing::debug!("Realtime {} {id}: {outcome:?}", R::TABLE);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DayKey, TransactionKind};
    use crate::remote::MemoryRemote;
    use crate::testing::eventually;
    use crate::models::Record;
    use pretty_assertions::assert_eq;

    async fn subscriber() -> (RealtimeSubscriber, MemoryRemote, LocalStore) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let subscriber = RealtimeSubscriber::new(Arc::new(remote.clone()), store.clone());
        (subscriber, remote, store)
    }

    fn product_event(kind: ChangeKind, updated_at: &str) -> ChangeEvent {
        ChangeEvent {
            kind,
            table: Table::Products,
            new_row: Some(json!({
                "id": "p-1",
                "name": "Tea",
                "price": 2.0,
                "updated_at": updated_at
            })),
            old_row: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replayed_events_leave_state_unchanged() {
        let (subscriber, _remote, store) = subscriber().await;
        let event = product_event(ChangeKind::Insert, "2024-03-01T10:00:00Z");

        assert!(subscriber.apply(event.clone()).await.unwrap());
        let after_first = store.list_all::<Product>().await.unwrap();
        for _ in 0..3 {
            assert!(!subscriber.apply(event.clone()).await.unwrap());
        }

        assert_eq!(store.list_all::<Product>().await.unwrap(), after_first);
        assert!(store.list_conflicts(10).await.unwrap().is_empty());
        assert!(!after_first[0].is_dirty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn older_events_do_not_overwrite_newer_rows() {
        let (subscriber, _remote, store) = subscriber().await;
        subscriber
            .apply(product_event(ChangeKind::Update, "2024-03-01T11:00:00Z"))
            .await
            .unwrap();
        assert!(!subscriber
            .apply(product_event(ChangeKind::Update, "2024-03-01T10:00:00Z"))
            .await
            .unwrap());
        assert_eq!(store.list_conflicts(10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_events_remove_rows() {
        let (subscriber, _remote, store) = subscriber().await;
        subscriber
            .apply(product_event(ChangeKind::Insert, "2024-03-01T10:00:00Z"))
            .await
            .unwrap();
        let delete = ChangeEvent {
            kind: ChangeKind::Delete,
            table: Table::Products,
            new_row: None,
            old_row: Some(json!({"id": "p-1"})),
        };

        assert!(subscriber.apply(delete.clone()).await.unwrap());
        assert!(!subscriber.apply(delete).await.unwrap());
        assert_eq!(store.count::<Product>().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_start_keeps_one_subscription() {
        let (subscriber, remote, store) = subscriber().await;
        assert!(subscriber.start(Table::Products).await);
        assert!(!subscriber.start(Table::Products).await);
        assert_eq!(subscriber.start_all().await, Table::ALL.len() - 1);
        assert_eq!(subscriber.state(Table::Products), SubscriptionState::Live);

        remote
            .insert_row(
                Table::Products,
                json!({"id": "p-9", "name": "Juice", "price": 4.0, "updated_at": "2024-03-01T10:00:00Z"}),
            )
            .unwrap();
        eventually(|| {
            let store = store.clone();
            async move { store.count::<Product>().await.unwrap() == 1 }
        })
        .await;
        assert!(store.list_conflicts(10).await.unwrap().is_empty());

        subscriber.stop_all();
        assert_eq!(subscriber.state(Table::Products), SubscriptionState::Closed);
        assert_eq!(subscriber.reconnect().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_revives_only_broken_tables() {
        let (subscriber, remote, _store) = subscriber().await;
        remote.set_feed_unavailable(true);
        assert!(!subscriber.start(Table::Clients).await);
        assert!(matches!(
            subscriber.state(Table::Clients),
            SubscriptionState::Errored(_)
        ));

        remote.set_feed_unavailable(false);
        assert!(subscriber.start(Table::Products).await);
        assert_eq!(subscriber.reconnect().await, 1);
        assert_eq!(subscriber.state(Table::Clients), SubscriptionState::Live);

        remote.disconnect_feeds();
        eventually(|| {
            let subscriber = subscriber.clone();
            async move { !subscriber.state(Table::Products).is_active() }
        })
        .await;
        eventually(|| {
            let subscriber = subscriber.clone();
            async move { !subscriber.state(Table::Clients).is_active() }
        })
        .await;
        assert_eq!(subscriber.reconnect().await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_events_for_the_selected_day_refresh_the_view() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let view = ViewCache::new(store.clone());
        let day: DayKey = "2024-03-01".parse().unwrap();
        view.select_day(day).await.unwrap();
        let subscriber =
            RealtimeSubscriber::with_view(Arc::new(remote), store.clone(), view.clone());
        let mut updates = view.subscribe();

        let other_day = ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::Transactions,
            new_row: Some(json!({
                "id": "t-2",
                "date_key": "2024-03-02",
                "kind": TransactionKind::Sale,
                "updated_at": "2024-03-02T10:00:00Z"
            })),
            old_row: None,
        };
        assert!(subscriber.apply(other_day).await.unwrap());
        assert!(!updates.has_changed().unwrap());

        let same_day = ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::Transactions,
            new_row: Some(json!({
                "id": "t-1",
                "date_key": "2024-03-01",
                "kind": "SALE",
                "updated_at": "2024-03-01T10:00:00Z"
            })),
            old_row: None,
        };
        assert!(subscriber.apply(same_day).await.unwrap());
        assert!(updates.has_changed().unwrap());
        assert_eq!(view.snapshot().unwrap().entries.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn moving_a_transaction_refreshes_the_day_it_left() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let view = ViewCache::new(store.clone());
        let first_day: DayKey = "2024-03-01".parse().unwrap();
        let subscriber =
            RealtimeSubscriber::with_view(Arc::new(remote), store.clone(), view.clone());

        let booked = ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::Transactions,
            new_row: Some(json!({
                "id": "t-1",
                "date_key": "2024-03-01",
                "kind": "SALE",
                "updated_at": "2024-03-01T10:00:00Z"
            })),
            old_row: None,
        };
        assert!(subscriber.apply(booked).await.unwrap());
        assert_eq!(view.select_day(first_day).await.unwrap().entries.len(), 1);

        let moved = ChangeEvent {
            kind: ChangeKind::Update,
            table: Table::Transactions,
            new_row: Some(json!({
                "id": "t-1",
                "date_key": "2024-03-02",
                "kind": "SALE",
                "updated_at": "2024-03-01T11:00:00Z"
            })),
            old_row: None,
        };
        assert!(subscriber.apply(moved).await.unwrap());

        let snapshot = view.snapshot().unwrap();
        assert_eq!(snapshot.day, first_day);
        assert!(snapshot.entries.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn employee_events_are_applied_and_deleted() {
        let (subscriber, _remote, store) = subscriber().await;
        let insert = ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::Employees,
            new_row: Some(json!({
                "id": "e-1",
                "name": "Carla",
                "client_id": "c-1",
                "updated_at": "2024-03-01T10:00:00Z"
            })),
            old_row: None,
        };
        assert!(subscriber.apply(insert).await.unwrap());
        let stored = store.get::<Employee>(&RecordId::from("e-1")).await.unwrap().unwrap();
        assert_eq!(stored.client_id, Some(RecordId::from("c-1")));

        let delete = ChangeEvent {
            kind: ChangeKind::Delete,
            table: Table::Employees,
            new_row: None,
            old_row: Some(json!({"id": "e-1"})),
        };
        assert!(subscriber.apply(delete).await.unwrap());
        assert_eq!(store.count::<Employee>().await.unwrap(), 0);
    }
}
