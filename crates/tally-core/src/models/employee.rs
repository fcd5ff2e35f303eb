//! Employee model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{IdMap, Record, RecordId, SyncStamps, Table};
use crate::error::{Error, Result};

/// A staff member, optionally attached to the client whose account they
/// consume under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: RecordId,
    pub name: String,
    pub client_id: Option<RecordId>,
    pub active: bool,
    #[serde(flatten)]
    pub stamps: SyncStamps,
}

impl Employee {
    #[must_use]
    pub fn new(name: impl Into<String>, client_id: Option<RecordId>, now: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::generate(),
            name: name.into().trim().to_string(),
            client_id,
            active: true,
            stamps: SyncStamps::created(now),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EmployeeRow {
    id: RecordId,
    name: String,
    #[serde(default)]
    client_id: Option<RecordId>,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

const fn default_active() -> bool {
    true
}

impl Record for Employee {
    const TABLE: Table = Table::Employees;

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
        let row = EmployeeRow {
            id: self.id.clone(),
            name: self.name.clone(),
            client_id: self
                .client_id
                .as_ref()
                .map(|client| ids.remote_id(Table::Clients, client)),
            active: self.active,
            created_at: Some(self.stamps.created_at),
            updated_at: self.stamps.updated_at,
        };
        Ok(serde_json::to_value(row)?)
    }

    fn from_remote(row: Value, ids: &IdMap) -> Result<Self> {
        let row: EmployeeRow = serde_json::from_value(row)?;
        if row.id.is_blank() {
            return Err(Error::InvalidInput("remote employee row without id".into()));
        }
        Ok(Self {
            id: row.id,
            name: row.name,
            client_id: row
                .client_id
                .filter(|client| !client.is_blank())
                .map(|client| ids.local_id(Table::Clients, &client)),
            active: row.active,
            stamps: SyncStamps {
                created_at: row.created_at.unwrap_or(row.updated_at),
                updated_at: row.updated_at,
                last_synced_at: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_reference_uses_canonical_ids_on_the_wire() {
        let mut ids = IdMap::default();
        ids.insert(Table::Clients, "local-c".into(), "remote-c".into());

        let employee = Employee::new(" Carla ", Some("local-c".into()), Utc::now());
        let row = employee.to_remote(&ids).unwrap();
        assert_eq!(row["name"], "Carla");
        assert_eq!(row["client_id"], "remote-c");

        let back = Employee::from_remote(row, &ids).unwrap();
        assert_eq!(back.client_id, Some(RecordId::from("local-c")));
    }

    #[test]
    fn rows_without_client_or_active_flag() {
        let row = json!({
            "id": "e-1",
            "name": "Davi",
            "client_id": null,
            "updated_at": "2024-03-01T10:00:00Z"
        });
        let employee = Employee::from_remote(row, &IdMap::default()).unwrap();
        assert!(employee.active);
        assert_eq!(employee.client_id, None);

        let blank = json!({"id": " ", "name": "x", "updated_at": "2024-03-01T10:00:00Z"});
        assert!(Employee::from_remote(blank, &IdMap::default()).is_err());
    }
}
