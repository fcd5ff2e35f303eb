//! Remote relational store: the shared backend every device converges on.

mod memory;
mod postgrest;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{RecordId, Table};

pub use memory::MemoryRemote;
pub use postgrest::PostgrestRemote;

/// Errors from the remote store and its change feed
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport failure (connect, timeout, TLS)
    #[error("Remote request failed: {0}")]
    Http(String),

    /// Backend answered with a non-success status
    #[error("Remote API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Uniqueness violation the client could not resolve
    #[error("Remote conflict on {table}: {message}")]
    Conflict { table: Table, message: String },

    /// Response body did not have the expected shape
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),

    /// Websocket/channel failure of the change feed
    #[error("Realtime channel error: {0}")]
    WebSocket(String),

    /// Change feed closed by the server
    #[error("Realtime channel closed")]
    Closed,

    /// Remote URL or key missing from the configuration
    #[error("Remote store not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RemoteError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(error.to_string())
    }
}

/// Comparison applied to one column
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Eq(String, Value),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Self::Gt(column, _)
            | Self::Gte(column, _)
            | Self::Lt(column, _)
            | Self::Lte(column, _)
            | Self::Eq(column, _) => column,
        }
    }

    pub const fn value(&self) -> &Value {
        match self {
            Self::Gt(_, value)
            | Self::Gte(_, value)
            | Self::Lt(_, value)
            | Self::Lte(_, value)
            | Self::Eq(_, value) => value,
        }
    }

    /// PostgREST operator name
    pub const fn operator(&self) -> &'static str {
        match self {
            Self::Gt(..) => "gt",
            Self::Gte(..) => "gte",
            Self::Lt(..) => "lt",
            Self::Lte(..) => "lte",
            Self::Eq(..) => "eq",
        }
    }
}

/// Filtered, ordered, paginated select
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteQuery {
    pub filters: Vec<Filter>,
    /// Ascending sort columns, most significant first
    pub order: Vec<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RemoteQuery {
    /// Rows changed strictly after `watermark`, oldest first, one page at a time
    pub fn changed_since(watermark: &str, offset: usize, limit: usize) -> Self {
        Self {
            filters: vec![Filter::Gt("updated_at".into(), Value::String(watermark.into()))],
            order: vec!["updated_at".into(), "id".into()],
            offset,
            limit: Some(limit),
        }
    }
}

/// CRUD and query access to the remote tables.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert-or-update rows by id, returning the stored rows.
    ///
    /// For deduplicated tables the returned row may carry a different
    /// (canonical) id than the one sent when the name already existed.
    async fn upsert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, RemoteError>;

    async fn select(&self, table: Table, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError>;

    /// Patch one row, returning it when it exists.
    ///
    /// A patch carrying `updated_at` only applies while the stored row is
    /// older than that stamp; otherwise nothing changes and `None` is returned.
    async fn update_by_id(
        &self,
        table: Table,
        id: &RecordId,
        patch: Value,
    ) -> Result<Option<Value>, RemoteError>;
}

/// Id carried by a remote row
pub(crate) fn row_id(row: &Value) -> Option<RecordId> {
    row.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(RecordId::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn changed_since_orders_by_timestamp_then_id() {
        let query = RemoteQuery::changed_since("2024-03-01T10:00:00.000000Z", 500, 500);
        assert_eq!(query.order, vec!["updated_at".to_string(), "id".to_string()]);
        assert_eq!(query.filters[0].operator(), "gt");
        assert_eq!(query.filters[0].column(), "updated_at");
        assert_eq!(query.offset, 500);
    }

    #[test]
    fn row_id_skips_blank_ids() {
        assert_eq!(row_id(&json!({"id": "a"})), Some(RecordId::from("a")));
        assert_eq!(row_id(&json!({"id": " "})), None);
        assert_eq!(row_id(&json!({"name": "x"})), None);
    }
}
