//! Client model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{IdMap, NamedRecord, Record, RecordId, SyncStamps, Table};
use crate::error::{Error, Result};

/// Display name of the sentinel walk-in client.
pub const WALK_IN_NAME: &str = "Walk-in customer";

/// Kind of counterparty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientKind {
    #[default]
    Regular,
    /// Anonymous counter customer
    WalkIn,
}

impl ClientKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "REGULAR",
            Self::WalkIn => "WALK_IN",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "REGULAR" => Ok(Self::Regular),
            "WALK_IN" => Ok(Self::WalkIn),
            other => Err(format!("unknown client kind '{other}'")),
        }
    }
}

/// A client of the business
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: RecordId,
    pub name: String,
    pub kind: ClientKind,
    /// Soft-delete flag; clients are never removed
    pub active: bool,
    /// Canonical server id when the local id was retained
    pub remote_id: Option<RecordId>,
    #[serde(flatten)]
    pub stamps: SyncStamps,
}

impl Client {
    /// Create a new regular client at `now`
    #[must_use]
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::generate(),
            name: name.into().trim().to_string(),
            kind: ClientKind::Regular,
            active: true,
            remote_id: None,
            stamps: SyncStamps::created(now),
        }
    }

    /// The sentinel walk-in client
    #[must_use]
    pub fn walk_in(now: DateTime<Utc>) -> Self {
        Self {
            kind: ClientKind::WalkIn,
            ..Self::new(WALK_IN_NAME, now)
        }
    }
}

/// Fields transmitted to and received from the remote `clients` table.
#[derive(Debug, Serialize, Deserialize)]
struct ClientRow {
    id: RecordId,
    name: String,
    #[serde(default)]
    kind: ClientKind,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

const fn default_active() -> bool {
    true
}

impl Record for Client {
    const TABLE: Table = Table::Clients;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn stamps(&self) -> &SyncStamps {
        &self.stamps
    }

    fn stamps_mut(&mut self) -> &mut SyncStamps {
        &mut self.stamps
    }

    fn to_remote(&self, ids: &IdMap) -> Result<Value> {
        let row = ClientRow {
            id: ids.remote_id(Table::Clients, &self.id),
            name: self.name.clone(),
            kind: self.kind,
            active: self.active,
            created_at: Some(self.stamps.created_at),
            updated_at: self.stamps.updated_at,
        };
        Ok(serde_json::to_value(row)?)
    }

    fn from_remote(row: Value, ids: &IdMap) -> Result<Self> {
        let row: ClientRow = serde_json::from_value(row)?;
        if row.id.is_blank() {
            return Err(Error::InvalidInput("remote client row without id".into()));
        }
        let id = ids.local_id(Table::Clients, &row.id);
        let remote_id = (id != row.id).then_some(row.id);
        Ok(Self {
            id,
            name: row.name,
            kind: row.kind,
            active: row.active,
            remote_id,
            stamps: SyncStamps {
                created_at: row.created_at.unwrap_or(row.updated_at),
                updated_at: row.updated_at,
                last_synced_at: None,
            },
        })
    }
}

impl NamedRecord for Client {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn remote_id(&self) -> Option<&RecordId> {
        self.remote_id.as_ref()
    }

    fn set_remote_id(&mut self, remote_id: Option<RecordId>) {
        self.remote_id = remote_id;
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_projection_omits_local_fields() {
        let client = Client::new("  Ana ", Utc::now());
        let row = client.to_remote(&IdMap::default()).unwrap();

        assert_eq!(row["name"], "Ana");
        assert_eq!(row["kind"], "REGULAR");
        assert!(row.get("last_synced_at").is_none());
        assert!(row.get("remote_id").is_none());
    }

    #[test]
    fn legacy_rows_without_active_flag_are_active() {
        let row = json!({
            "id": "c-1",
            "name": "Bruno",
            "updated_at": "2024-03-01T10:00:00Z"
        });
        let client = Client::from_remote(row, &IdMap::default()).unwrap();
        assert!(client.active);
        assert_eq!(client.stamps.created_at, client.stamps.updated_at);
        assert!(client.stamps.last_synced_at.is_none());
    }

    #[test]
    fn walk_in_client_uses_sentinel_name() {
        let client = Client::walk_in(Utc::now());
        assert_eq!(client.kind, ClientKind::WalkIn);
        assert_eq!(client.name_key(), "walk-in customer");
    }
}
