//! Settings repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Key of the last completed push (ISO-8601)
pub const LAST_PUSH_AT: &str = "sync.last_push_at";
/// Key of the last completed pull sweep (ISO-8601)
pub const LAST_PULL_AT: &str = "sync.last_pull_at";
/// Key of the most recent sync failure message
pub const LAST_SYNC_ERROR: &str = "sync.last_error";

/// Key/value settings stored next to the ledger
pub struct SettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}
