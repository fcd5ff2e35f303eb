//! Per-table pull watermarks

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::Table;
use crate::util::{epoch, iso_timestamp, parse_timestamp};

/// Watermarks are stored as fixed-width ISO text, so SQL string comparison
/// orders them chronologically.
pub struct WatermarkRepository<'a> {
    conn: &'a Connection,
}

impl<'a> WatermarkRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Last observed remote `updated_at` for `table`, or the epoch
    pub fn get(&self, table: Table) -> Result<DateTime<Utc>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_watermarks WHERE key = ?1",
                params![table.watermark_key()],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            None => Ok(epoch()),
            Some(value) => parse_timestamp(&value).ok_or_else(|| {
                Error::Database(format!("invalid watermark for {table}: {value}"))
            }),
        }
    }

    /// Move the watermark forward. Smaller values are ignored; returns
    /// whether the stored value changed.
    pub fn advance(&self, table: Table, value: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT INTO sync_watermarks (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value
             WHERE excluded.value > sync_watermarks.value",
            params![table.watermark_key(), iso_timestamp(value)],
        )?;
        Ok(changed > 0)
    }
}
