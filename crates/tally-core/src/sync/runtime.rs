//! Background sync: realtime subscriptions, periodic pull and push, and
//! catch-up after reconnects.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::engine::SyncEngine;
use super::network::NetworkMonitor;
use super::puller::{IncrementalPuller, DEFAULT_PULL_INTERVAL};
use super::scheduler::PeriodicJob;
use crate::db::{LAST_PULL_AT, LAST_PUSH_AT, LAST_SYNC_ERROR};
use crate::models::Table;
use crate::realtime::{ChangeFeed, RealtimeSubscriber, SubscriptionState};
use crate::state::SyncState;
use crate::Result;

pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub pull_interval: Duration,
    pub push_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            pull_interval: DEFAULT_PULL_INTERVAL,
            push_interval: DEFAULT_PUSH_INTERVAL,
        }
    }
}

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStatus {
    pub state: SyncState,
    pub online: bool,
    pub pulling: bool,
    pub pushing: bool,
    pub subscriptions: Vec<(Table, String)>,
    pub dirty: Vec<(Table, usize)>,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
}

impl RuntimeStatus {
    pub fn dirty_total(&self) -> usize {
        self.dirty.iter().map(|(_, count)| count).sum()
    }
}

/// Owns every background sync task of one store.
pub struct SyncRuntime {
    engine: SyncEngine,
    subscriber: RealtimeSubscriber,
    puller: IncrementalPuller,
    push_job: Arc<PeriodicJob>,
    network: NetworkMonitor,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncRuntime {
    pub fn new(
        engine: SyncEngine,
        feed: Arc<dyn ChangeFeed>,
        network: NetworkMonitor,
        options: RuntimeOptions,
    ) -> Self {
        let store = engine.store().clone();
        let subscriber = match engine.view() {
            Some(view) => RealtimeSubscriber::with_view(feed, store, view.clone()),
            None => RealtimeSubscriber::new(feed, store),
        };
        let puller =
            IncrementalPuller::new(engine.clone(), options.pull_interval).with_network(network.clone());
        Self {
            engine,
            subscriber,
            puller,
            push_job: Arc::new(PeriodicJob::new("periodic push", options.push_interval)),
            network,
            listener: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn subscriber(&self) -> &RealtimeSubscriber {
        &self.subscriber
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn is_started(&self) -> bool {
        self.puller.is_started()
    }

    /// Subscribe to every table and start the timers. Returns how many
    /// subscriptions went live; tables that failed are retried on reconnect.
    pub async fn start(&self) -> usize {
        let live = self.subscriber.start_all().await;
        self.puller.start();

        let engine = self.engine.clone();
        let network = self.network.clone();
        self.push_job.start(move || {
            let engine = engine.clone();
            let network = network.clone();
            async move {
                if network.is_online() {
                    engine.push().await;
                } else {
                    tracing::debug!("Skipping periodic push while offline");
                }
            }
        });

        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_none() {
            let mut reconnects = self.network.reconnects();
            let subscriber = self.subscriber.clone();
            let puller = self.puller.clone();
            let push_job = Arc::clone(&self.push_job);
            *listener = Some(tokio::spawn(async move {
                while reconnects.next().await.is_some() {
                    tracing::info!("Back online, catching up");
                    subscriber.reconnect().await;
                    puller.trigger();
                    push_job.trigger();
                }
            }));
        }

        tracing::info!(
            "Sync runtime started: {live} of {} subscriptions live",
            Table::ALL.len()
        );
        live
    }

    /// Stop timers, subscriptions and the reconnect listener. A cycle already
    /// running finishes on its own.
    pub fn stop(&self) {
        self.puller.stop();
        self.push_job.stop();
        self.subscriber.stop_all();
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        tracing::info!("Sync runtime stopped");
    }

    pub async fn status(&self) -> Result<RuntimeStatus> {
        let store = self.engine.store();
        let dirty = store.dirty_counts().await?;
        let last_push_at = store.setting(LAST_PUSH_AT).await?;
        let last_pull_at = store.setting(LAST_PULL_AT).await?;
        let last_error = store.setting(LAST_SYNC_ERROR).await?;

        let online = self.network.is_online();
        let pulling = self.puller.is_busy();
        let pushing = self.push_job.is_busy();
        let subscriptions = self
            .subscriber
            .states()
            .into_iter()
            .map(|(table, state)| (table, state.to_string()))
            .collect();

        Ok(RuntimeStatus {
            state: SyncState::from_parts(online, pulling || pushing, last_error.is_some()),
            online,
            pulling,
            pushing,
            subscriptions,
            dirty,
            last_push_at,
            last_pull_at,
            last_error,
        })
    }

    /// Tables whose subscription is not live
    pub fn degraded_tables(&self) -> Vec<Table> {
        self.subscriber
            .states()
            .into_iter()
            .filter(|(_, state)| *state != SubscriptionState::Live)
            .map(|(table, _)| table)
            .collect()
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Client;
    use crate::remote::MemoryRemote;
    use crate::services::LocalStore;
    use crate::sync::EngineOptions;
    use crate::testing::eventually;
    use crate::util::now;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn runtime(online: bool) -> (SyncRuntime, MemoryRemote) {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = MemoryRemote::new();
        let engine = SyncEngine::new(store, Arc::new(remote.clone()), EngineOptions::default());
        let network = NetworkMonitor::new(online, Duration::from_millis(20));
        let runtime = SyncRuntime::new(
            engine,
            Arc::new(remote.clone()),
            network,
            RuntimeOptions::default(),
        );
        (runtime, remote)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_pushes_pending_work_and_applies_live_events() {
        let (runtime, remote) = runtime(true).await;
        let client = Client::new("Ana", now());
        runtime.engine().store().put(&client).await.unwrap();

        assert_eq!(runtime.start().await, Table::ALL.len());
        eventually(|| async { remote.row(Table::Clients, &client.id).is_some() }).await;

        remote
            .insert_row(
                Table::Products,
                json!({"id": "p-1", "name": "Coffee", "price": 2.5, "active": true,
                       "updated_at": "2024-03-01T10:00:00Z"}),
            )
            .unwrap();
        let store = runtime.engine().store().clone();
        eventually(|| {
            let store = store.clone();
            async move {
                store
                    .get::<crate::models::Product>(&"p-1".into())
                    .await
                    .unwrap()
                    .is_some()
            }
        })
        .await;

        runtime.stop();
        assert!(runtime.degraded_tables().len() == Table::ALL.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_runtime_keeps_records_pending() {
        let (runtime, remote) = runtime(false).await;
        for table in Table::ALL {
            remote.fail_selects_after(table, 0);
        }
        let client = Client::new("Ana", now());
        runtime.engine().store().put(&client).await.unwrap();
        runtime.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(remote.upsert_calls(Table::Clients), 0);
        let status = runtime.status().await.unwrap();
        assert_eq!(status.state, SyncState::Offline);
        assert_eq!(status.dirty_total(), 1);
        runtime.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_revives_dropped_subscriptions() {
        let (runtime, remote) = runtime(true).await;
        runtime.start().await;

        remote.set_feed_unavailable(true);
        remote.disconnect_feeds();
        eventually(|| async { runtime.degraded_tables().len() == Table::ALL.len() }).await;

        remote.set_feed_unavailable(false);
        runtime.network().set_online(false);
        runtime.network().set_online(true);
        eventually(|| async { runtime.degraded_tables().is_empty() }).await;
        runtime.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_reports_last_error() {
        let (runtime, remote) = runtime(true).await;
        remote.fail_upserts(Table::Clients, 1);
        let client = Client::new("Ana", now());
        runtime.engine().store().put(&client).await.unwrap();

        let report = runtime.engine().push().await;
        assert!(!report.is_success());
        let status = runtime.status().await.unwrap();
        assert_eq!(status.state, SyncState::Error);
        assert!(status.last_error.is_some());
        assert_eq!(status.dirty_total(), 1);
    }
}
