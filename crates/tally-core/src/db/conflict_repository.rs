//! Log of inbound rows rejected by last-write-wins

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{RecordId, SyncConflict, Table};
use crate::util::iso_timestamp;

const STRATEGY: &str = "lww";

/// Conflicts kept; older entries are dropped as new ones arrive
pub const RETAINED_CONFLICTS: usize = 1000;

pub struct ConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn record(
        &self,
        table: Table,
        record_id: &RecordId,
        local_updated_at: DateTime<Utc>,
        incoming_updated_at: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts
                (table_name, record_id, local_updated_at, incoming_updated_at, resolved_at, strategy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                table.name(),
                record_id.as_str(),
                iso_timestamp(local_updated_at),
                iso_timestamp(incoming_updated_at),
                iso_timestamp(resolved_at),
                STRATEGY
            ],
        )?;
        self.prune(RETAINED_CONFLICTS)?;
        Ok(())
    }

    /// Keep only the `keep` most recent conflicts. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM sync_conflicts WHERE id NOT IN (
                SELECT id FROM sync_conflicts ORDER BY resolved_at DESC, id DESC LIMIT ?1
             )",
            params![i64::try_from(keep).unwrap_or(i64::MAX)],
        )?;
        Ok(removed)
    }

    /// Most recent conflicts first
    pub fn list(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, table_name, record_id, local_updated_at, incoming_updated_at, resolved_at, strategy
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?1",
        )?;
        let conflicts = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok(SyncConflict {
                    id: row.get(0)?,
                    table_name: row.get(1)?,
                    record_id: row.get(2)?,
                    local_updated_at: row.get(3)?,
                    incoming_updated_at: row.get(4)?,
                    resolved_at: row.get(5)?,
                    strategy: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }
}
