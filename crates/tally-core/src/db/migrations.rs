//! Database migrations

use crate::error::{Error, Result};
use crate::models::Table;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
///
/// Fails with [`Error::IncompatibleSchema`] when the file was written by a
/// newer build or its tables use a primary-key layout this build cannot read.
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::IncompatibleSchema(format!(
            "database schema version {version} is newer than supported version {CURRENT_VERSION}"
        )));
    }
    verify_layout(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Every synced table must key its rows by a TEXT `id`.
fn verify_layout(conn: &Connection) -> Result<()> {
    for table in Table::ALL {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table.name()))?;
        let primary_key = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .find(|(_, _, pk)| *pk > 0);

        // Table not created yet
        let Some((name, column_type)) = primary_key.map(|(name, ty, _)| (name, ty)) else {
            continue;
        };
        if name != "id" || !column_type.eq_ignore_ascii_case("TEXT") {
            return Err(Error::IncompatibleSchema(format!(
                "table {table} is keyed by {name} {column_type}, expected id TEXT"
            )));
        }
    }
    Ok(())
}

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'REGULAR',
            active INTEGER NOT NULL DEFAULT 1,
            remote_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_synced_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_clients_name_key ON clients(name_key);
        CREATE INDEX IF NOT EXISTS idx_clients_remote_id ON clients(remote_id);
        CREATE INDEX IF NOT EXISTS idx_clients_sync ON clients(updated_at, last_synced_at);

        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            price REAL NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            remote_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_synced_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_products_name_key ON products(name_key);
        CREATE INDEX IF NOT EXISTS idx_products_remote_id ON products(remote_id);
        CREATE INDEX IF NOT EXISTS idx_products_sync ON products(updated_at, last_synced_at);

        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY NOT NULL,
            date_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            client_id TEXT,
            preparation_status TEXT NOT NULL DEFAULT 'PENDING',
            reversed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_synced_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_day_kind ON transactions(date_key, kind);
        CREATE INDEX IF NOT EXISTS idx_transactions_client ON transactions(client_id);
        CREATE INDEX IF NOT EXISTS idx_transactions_sync ON transactions(updated_at, last_synced_at);

        CREATE TABLE IF NOT EXISTS line_items (
            id TEXT PRIMARY KEY NOT NULL,
            transaction_id TEXT NOT NULL,
            product_id TEXT,
            product_name TEXT NOT NULL DEFAULT '',
            quantity INTEGER NOT NULL,
            unit_price REAL NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_synced_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_line_items_transaction ON line_items(transaction_id);
        CREATE INDEX IF NOT EXISTS idx_line_items_product ON line_items(product_id);
        CREATE INDEX IF NOT EXISTS idx_line_items_sync ON line_items(updated_at, last_synced_at);

        CREATE TABLE IF NOT EXISTS sync_watermarks (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            local_updated_at TEXT NOT NULL,
            incoming_updated_at TEXT NOT NULL,
            resolved_at TEXT NOT NULL,
            strategy TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(table_name, record_id);
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC);

        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: optional payment method on transactions
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    let has_column = tx
        .query_row(
            "SELECT 1 FROM pragma_table_info('transactions') WHERE name = 'payment_method'",
            [],
            |row| row.get::<_, i32>(0),
        )
        .optional()?
        .is_some();
    if !has_column {
        tx.execute_batch("ALTER TABLE transactions ADD COLUMN payment_method TEXT;")?;
    }
    tx.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    tx.commit()?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: employees, optionally attached to a client
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS employees (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            client_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_synced_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_employees_client ON employees(client_id);
        CREATE INDEX IF NOT EXISTS idx_employees_sync ON employees(updated_at, last_synced_at);

        INSERT INTO schema_version (version) VALUES (3);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 3");
    Ok(())
}
