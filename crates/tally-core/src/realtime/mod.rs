//! Live change feed from the remote store.

mod subscriber;
mod supabase;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{RecordId, Table};
use crate::remote::{row_id, RemoteError};

pub use subscriber::{RealtimeSubscriber, SubscriptionState};
pub use supabase::{parse_frame, Frame, SupabaseRealtime};

/// Row-level change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One row change delivered by a feed (at least once).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub new_row: Option<Value>,
    pub old_row: Option<Value>,
}

impl ChangeEvent {
    /// Id of the affected row, from the new row or else the old one
    pub fn record_id(&self) -> Option<RecordId> {
        self.new_row
            .as_ref()
            .and_then(row_id)
            .or_else(|| self.old_row.as_ref().and_then(row_id))
    }

    /// String column from the new row or else the old one
    pub fn column(&self, name: &str) -> Option<&str> {
        [self.new_row.as_ref(), self.old_row.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get(name).and_then(Value::as_str))
    }
}

/// Events of one table subscription. Dropping it stops the feed task.
#[derive(Debug)]
pub struct FeedSubscription {
    events: mpsc::Receiver<Result<ChangeEvent, RemoteError>>,
    task: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub const fn new(
        events: mpsc::Receiver<Result<ChangeEvent, RemoteError>>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { events, task }
    }

    /// Next event; `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, RemoteError>> {
        self.events.recv().await
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Source of per-table change events.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription for `table`. Resolves once the server accepted it.
    async fn subscribe(&self, table: Table) -> Result<FeedSubscription, RemoteError>;
}
