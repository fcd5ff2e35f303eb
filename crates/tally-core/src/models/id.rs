//! Record identifiers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::Table;

/// Identifier of any synced record.
///
/// Locally created records get a UUID v7 (time-sortable) so writes proceed
/// without the network; rows coming from the remote store keep whatever id the
/// server assigned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new locally-generated id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty after trimming (never valid)
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Two-way translation between local ids and server-canonical ids.
///
/// Only populated when local ids are retained after reconciliation; with the
/// default strategy both sides are the same id and lookups fall through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    to_remote: HashMap<(Table, RecordId), RecordId>,
    to_local: HashMap<(Table, RecordId), RecordId>,
}

impl IdMap {
    /// Register a local id and its canonical remote counterpart.
    pub fn insert(&mut self, table: Table, local: RecordId, remote: RecordId) {
        self.to_local.insert((table, remote.clone()), local.clone());
        self.to_remote.insert((table, local), remote);
    }

    /// Id to transmit for a local record.
    #[must_use]
    pub fn remote_id(&self, table: Table, local: &RecordId) -> RecordId {
        self.to_remote
            .get(&(table, local.clone()))
            .cloned()
            .unwrap_or_else(|| local.clone())
    }

    /// Local id for an inbound remote row.
    #[must_use]
    pub fn local_id(&self, table: Table, remote: &RecordId) -> RecordId {
        self.to_local
            .get(&(table, remote.clone()))
            .cloned()
            .unwrap_or_else(|| remote.clone())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_remote.is_empty()
    }
}
