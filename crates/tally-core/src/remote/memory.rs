//! In-process remote store and change feed.
//!
//! Behaves like the hosted backend the sync engine targets: upserts keep the
//! row with the newest `updated_at`, deduplicated tables reject a second row
//! with the same normalized name (answering with the existing row), and every
//! accepted write is broadcast to feed subscribers. Failure injection hooks
//! make partial outages reproducible in tests.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use super::{row_id, Filter, RemoteError, RemoteQuery, RemoteStore};
use crate::models::{RecordId, Table};
use crate::realtime::{ChangeEvent, ChangeFeed, ChangeKind, FeedSubscription};
use crate::util::{epoch, normalize_name, parse_timestamp};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum FeedMessage {
    Change(ChangeEvent),
    Disconnect,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<Table, BTreeMap<RecordId, Value>>,
    failing_upserts: HashMap<Table, usize>,
    select_budget: HashMap<Table, usize>,
    upsert_calls: HashMap<Table, usize>,
    select_calls: HashMap<Table, usize>,
    feed_unavailable: bool,
    latency: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    feed: broadcast::Sender<FeedMessage>,
}

/// Shared in-memory backend; clones point at the same data.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                feed,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.inner.feed.send(FeedMessage::Change(event));
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Fail the next `count` upserts to `table`.
    pub fn fail_upserts(&self, table: Table, count: usize) {
        self.state().failing_upserts.insert(table, count);
    }

    /// Let `ok_calls` more selects on `table` succeed, then fail until cleared.
    pub fn fail_selects_after(&self, table: Table, ok_calls: usize) {
        self.state().select_budget.insert(table, ok_calls);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_upserts.clear();
        state.select_budget.clear();
        state.feed_unavailable = false;
    }

    /// Delay every upsert and select by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Refuse new feed subscriptions while `unavailable`.
    pub fn set_feed_unavailable(&self, unavailable: bool) {
        self.state().feed_unavailable = unavailable;
    }

    /// Drop every open feed subscription, as a lost connection would.
    pub fn disconnect_feeds(&self) {
        let _ = self.inner.feed.send(FeedMessage::Disconnect);
    }

    pub fn upsert_calls(&self, table: Table) -> usize {
        self.state().upsert_calls.get(&table).copied().unwrap_or_default()
    }

    pub fn select_calls(&self, table: Table) -> usize {
        self.state().select_calls.get(&table).copied().unwrap_or_default()
    }

    /// All rows of `table`, ordered by id
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state()
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: Table, id: &RecordId) -> Option<Value> {
        self.state()
            .tables
            .get(&table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Write a row as another device would, bypassing deduplication.
    pub fn insert_row(&self, table: Table, row: Value) -> Result<(), RemoteError> {
        let id = row_id(&row)
            .ok_or_else(|| RemoteError::InvalidPayload("row without id".into()))?;
        let old_row = self
            .state()
            .tables
            .entry(table)
            .or_default()
            .insert(id, row.clone());
        self.publish(ChangeEvent {
            kind: if old_row.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            },
            table,
            new_row: Some(row),
            old_row,
        });
        Ok(())
    }

    /// Physically delete a row, broadcasting a DELETE event.
    pub fn delete_row(&self, table: Table, id: &RecordId) -> Option<Value> {
        let removed = self
            .state()
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.remove(id));
        if let Some(old_row) = &removed {
            self.publish(ChangeEvent {
                kind: ChangeKind::Delete,
                table,
                new_row: None,
                old_row: Some(old_row.clone()),
            });
        }
        removed
    }

    /// Store one row; returns the row as stored and the event to broadcast.
    fn write_row(
        rows: &mut BTreeMap<RecordId, Value>,
        table: Table,
        row: Value,
    ) -> Result<(Value, Option<ChangeEvent>), RemoteError> {
        let id = row_id(&row)
            .ok_or_else(|| RemoteError::InvalidPayload(format!("{table} row without id")))?;

        let key = name_key(&row);
        if table.is_deduplicated() && !key.is_empty() {
            let canonical = rows
                .iter()
                .find(|(existing_id, existing)| **existing_id != id && name_key(existing) == key)
                .map(|(_, existing)| existing.clone());
            if let Some(canonical) = canonical {
                return Ok((canonical, None));
            }
        }

        match rows.get(&id) {
            Some(existing) if updated_at(existing) > updated_at(&row) => {
                Ok((existing.clone(), None))
            }
            Some(existing) => {
                let old_row = existing.clone();
                let mut merged = existing.clone();
                if let (Value::Object(target), Value::Object(fields)) = (&mut merged, row) {
                    target.extend(fields);
                }
                rows.insert(id, merged.clone());
                let event = ChangeEvent {
                    kind: ChangeKind::Update,
                    table,
                    new_row: Some(merged.clone()),
                    old_row: Some(old_row),
                };
                Ok((merged, Some(event)))
            }
            None => {
                rows.insert(id, row.clone());
                let event = ChangeEvent {
                    kind: ChangeKind::Insert,
                    table,
                    new_row: Some(row.clone()),
                    old_row: None,
                };
                Ok((row, Some(event)))
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        self.simulate_latency().await;
        let mut events = Vec::new();
        let stored = {
            let mut state = self.state();
            *state.upsert_calls.entry(table).or_default() += 1;
            if let Some(remaining) = state.failing_upserts.get_mut(&table) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RemoteError::Api {
                        status: 503,
                        message: format!("injected upsert failure on {table}"),
                    });
                }
            }

            let stored_rows = state.tables.entry(table).or_default();
            let mut stored = Vec::with_capacity(rows.len());
            for row in rows {
                let (row, event) = Self::write_row(stored_rows, table, row)?;
                stored.push(row);
                events.extend(event);
            }
            stored
        };
        for event in events {
            self.publish(event);
        }
        Ok(stored)
    }

    async fn select(&self, table: Table, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        *state.select_calls.entry(table).or_default() += 1;
        if let Some(budget) = state.select_budget.get_mut(&table) {
            if *budget == 0 {
                return Err(RemoteError::Http(format!(
                    "injected select failure on {table}"
                )));
            }
            *budget -= 1;
        }

        let mut rows: Vec<Value> = state
            .tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|row| query.filters.iter().all(|filter| matches_filter(row, filter)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(state);

        rows.sort_by(|left, right| {
            query
                .order
                .iter()
                .map(|column| compare_values(left.get(column), right.get(column)))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });

        let rows = rows.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn update_by_id(
        &self,
        table: Table,
        id: &RecordId,
        patch: Value,
    ) -> Result<Option<Value>, RemoteError> {
        let (updated, event) = {
            let mut state = self.state();
            let Some(existing) = state.tables.get_mut(&table).and_then(|rows| rows.get_mut(id))
            else {
                return Ok(None);
            };
            if patch.get("updated_at").is_some() && updated_at(existing) >= updated_at(&patch) {
                return Ok(None);
            }
            let old_row = existing.clone();
            if let (Value::Object(target), Value::Object(fields)) = (&mut *existing, patch) {
                target.extend(fields);
            }
            let updated = existing.clone();
            let event = ChangeEvent {
                kind: ChangeKind::Update,
                table,
                new_row: Some(updated.clone()),
                old_row: Some(old_row),
            };
            (updated, event)
        };
        self.publish(event);
        Ok(Some(updated))
    }
}

#[async_trait]
impl ChangeFeed for MemoryRemote {
    async fn subscribe(&self, table: Table) -> Result<FeedSubscription, RemoteError> {
        if self.state().feed_unavailable {
            return Err(RemoteError::WebSocket("feed unavailable".into()));
        }
        let mut feed = self.inner.feed.subscribe();
        let (sender, receiver) = mpsc::channel::<Result<ChangeEvent, RemoteError>>(FEED_CAPACITY);
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(FeedMessage::Change(event)) if event.table == table => {
                        if sender.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Ok(FeedMessage::Change(_)) => {}
                    Ok(FeedMessage::Disconnect) => {
                        let _ = sender.send(Err(RemoteError::Closed)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("In-memory feed for {table} skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(FeedSubscription::new(receiver, Some(task)))
    }
}

fn name_key(row: &Value) -> String {
    row.get("name")
        .and_then(Value::as_str)
        .map(normalize_name)
        .unwrap_or_default()
}

fn updated_at(row: &Value) -> chrono::DateTime<chrono::Utc> {
    row.get("updated_at")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(epoch)
}

fn matches_filter(row: &Value, filter: &Filter) -> bool {
    let ordering = compare_values(row.get(filter.column()), Some(filter.value()));
    match filter {
        Filter::Gt(..) => ordering.is_gt(),
        Filter::Gte(..) => ordering.is_ge(),
        Filter::Lt(..) => ordering.is_lt(),
        Filter::Lte(..) => ordering.is_le(),
        Filter::Eq(..) => ordering.is_eq(),
    }
}

/// Order JSON values; timestamps compare chronologically, missing values first.
fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::String(left)), Some(Value::String(right))) => {
            match (parse_timestamp(left), parse_timestamp(right)) {
                (Some(left), Some(right)) => left.cmp(&right),
                _ => left.cmp(right),
            }
        }
        (Some(Value::Number(left)), Some(Value::Number(right))) => left
            .as_f64()
            .partial_cmp(&right.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::Bool(left)), Some(Value::Bool(right))) => left.cmp(right),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(left), Some(right)) => left.to_string().cmp(&right.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn product(id: &str, name: &str, updated_at: &str) -> Value {
        json!({"id": id, "name": name, "price": 3.0, "active": true, "updated_at": updated_at})
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_answers_duplicate_names_with_canonical_row() {
        let remote = MemoryRemote::new();
        remote
            .insert_row(Table::Products, product("R2", "coffee ", "2024-03-01T09:00:00Z"))
            .unwrap();

        let stored = remote
            .upsert(
                Table::Products,
                vec![product("L1", "Coffee", "2024-03-01T10:00:00Z")],
            )
            .await
            .unwrap();

        assert_eq!(stored[0]["id"], "R2");
        assert_eq!(remote.rows(Table::Products).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_keeps_newer_row() {
        let remote = MemoryRemote::new();
        remote
            .upsert(
                Table::Products,
                vec![product("p", "Tea", "2024-03-01T10:00:00Z")],
            )
            .await
            .unwrap();

        let mut stale = product("p", "Tea", "2024-03-01T09:00:00Z");
        stale["price"] = json!(1.0);
        let stored = remote.upsert(Table::Products, vec![stale]).await.unwrap();

        assert_eq!(stored[0]["price"], 3.0);
        assert_eq!(stored[0]["updated_at"], "2024-03-01T10:00:00Z");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_select_filters_orders_and_pages() {
        let remote = MemoryRemote::new();
        for (id, at) in [
            ("c", "2024-03-01T10:00:02Z"),
            ("a", "2024-03-01T10:00:01Z"),
            ("b", "2024-03-01T10:00:01Z"),
            ("old", "2024-03-01T09:00:00Z"),
        ] {
            remote
                .insert_row(Table::Transactions, json!({"id": id, "updated_at": at}))
                .unwrap();
        }

        let first = remote
            .select(
                Table::Transactions,
                &RemoteQuery::changed_since("2024-03-01T10:00:00.000000Z", 0, 2),
            )
            .await
            .unwrap();
        let second = remote
            .select(
                Table::Transactions,
                &RemoteQuery::changed_since("2024-03-01T10:00:00.000000Z", 2, 2),
            )
            .await
            .unwrap();

        let ids = |rows: &[Value]| {
            rows.iter()
                .map(|row| row["id"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), vec!["a", "b"]);
        assert_eq!(ids(&second), vec!["c"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_injected_failures_run_out() {
        let remote = MemoryRemote::new();
        remote.fail_upserts(Table::Clients, 1);

        assert!(remote.upsert(Table::Clients, vec![]).await.is_err());
        assert!(remote.upsert(Table::Clients, vec![]).await.is_ok());
        assert_eq!(remote.upsert_calls(Table::Clients), 2);

        remote.fail_selects_after(Table::Clients, 1);
        let query = RemoteQuery::default();
        assert!(remote.select(Table::Clients, &query).await.is_ok());
        assert!(remote.select(Table::Clients, &query).await.is_err());
        remote.clear_failures();
        assert!(remote.select(Table::Clients, &query).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_feed_delivers_only_subscribed_table() {
        let remote = MemoryRemote::new();
        let mut feed = remote.subscribe(Table::Clients).await.unwrap();

        remote
            .insert_row(Table::Products, product("p", "Tea", "2024-03-01T10:00:00Z"))
            .unwrap();
        remote
            .insert_row(
                Table::Clients,
                json!({"id": "c", "name": "Ana", "updated_at": "2024-03-01T10:00:00Z"}),
            )
            .unwrap();
        remote.disconnect_feeds();

        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.table, Table::Clients);
        assert_eq!(event.kind, ChangeKind::Insert);
        assert!(matches!(feed.next().await, Some(Err(RemoteError::Closed))));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_by_id_merges_patch() {
        let remote = MemoryRemote::new();
        remote
            .insert_row(Table::Products, product("p", "Tea", "2024-03-01T10:00:00Z"))
            .unwrap();

        let updated = remote
            .update_by_id(Table::Products, &RecordId::from("p"), json!({"active": false}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated["active"], false);
        assert_eq!(updated["name"], "Tea");
        assert!(remote
            .update_by_id(Table::Products, &RecordId::from("missing"), json!({}))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stamped_patch_skips_newer_rows() {
        let remote = MemoryRemote::new();
        remote
            .insert_row(Table::Products, product("p", "Tea", "2024-03-01T10:00:00Z"))
            .unwrap();
        let id = RecordId::from("p");

        let stale = remote
            .update_by_id(
                Table::Products,
                &id,
                json!({"active": false, "updated_at": "2024-03-01T10:00:00Z"}),
            )
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(remote.row(Table::Products, &id).unwrap()["active"], true);

        let fresh = remote
            .update_by_id(
                Table::Products,
                &id,
                json!({"active": false, "updated_at": "2024-03-01T10:00:01Z"}),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh["active"], false);
        assert_eq!(fresh["updated_at"], "2024-03-01T10:00:01Z");
    }
}
