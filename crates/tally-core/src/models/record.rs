//! Shared record traits and sync bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{IdMap, RecordId, Table};
use crate::error::Result;
use crate::util::normalize_name;

/// Timestamps every synced record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStamps {
    /// Creation time (business time)
    pub created_at: DateTime<Utc>,
    /// Last mutation time (business time), the sole conflict authority
    pub updated_at: DateTime<Utc>,
    /// Last time the remote store confirmed this exact version
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncStamps {
    /// Stamps for a record created locally at `now`, not yet uploaded
    #[must_use]
    pub const fn created(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            last_synced_at: None,
        }
    }

    /// Record a local mutation at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Never synced, or mutated after the last confirmed sync
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        match self.last_synced_at {
            Some(synced) => self.updated_at > synced,
            None => true,
        }
    }
}

/// A record mirrored between the local store and the remote store.
pub trait Record: Clone + PartialEq + Send + Sync + 'static {
    /// Table holding this record
    const TABLE: Table;

    fn id(&self) -> &RecordId;

    fn stamps(&self) -> &SyncStamps;

    fn stamps_mut(&mut self) -> &mut SyncStamps;

    /// Remote projection: exactly the fields transmitted on upload.
    fn to_remote(&self, ids: &IdMap) -> Result<Value>;

    /// Build a record from a remote row. `last_synced_at` is left unset.
    fn from_remote(row: Value, ids: &IdMap) -> Result<Self>;

    fn is_dirty(&self) -> bool {
        self.stamps().is_dirty()
    }

    /// Equal in every field except `last_synced_at`.
    fn same_content(&self, other: &Self) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        left.stamps_mut().last_synced_at = None;
        right.stamps_mut().last_synced_at = None;
        left == right
    }
}

/// Records deduplicated by normalized name (clients, products).
pub trait NamedRecord: Record {
    fn name(&self) -> &str;

    fn is_active(&self) -> bool;

    /// Canonical id recorded when the local id is retained
    fn remote_id(&self) -> Option<&RecordId>;

    fn set_remote_id(&mut self, remote_id: Option<RecordId>);

    fn set_id(&mut self, id: RecordId);

    /// Normalized deduplication key
    fn name_key(&self) -> String {
        normalize_name(self.name())
    }
}
