//! Database connection management

use crate::error::{Error, Result};
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};

use super::migrations;

/// Database wrapper around a single `SQLite` connection
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open the database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically. An incompatible file is quarantined and
    /// recreated once per schema version; a second incompatibility is fatal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Self::open_path(&path) {
            Ok(database) => Ok(database),
            Err(error) if is_incompatible(&error) => Self::reset_once(&path, &error),
            Err(error) => Err(error),
        }
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut database = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    fn open_path(path: &Path) -> Result<Self> {
        let mut database = Self {
            conn: Connection::open(path)?,
            path: Some(path.to_path_buf()),
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    fn reset_once(path: &Path, cause: &Error) -> Result<Self> {
        let guard = reset_guard_path(path);
        if guard.exists() {
            tracing::error!(
                "Local database at {} is still incompatible after a reset: {cause}",
                path.display()
            );
            return Err(Error::IncompatibleSchema(format!(
                "{cause}; automatic reset already used (remove {} to allow another)",
                guard.display()
            )));
        }

        tracing::warn!(
            "Local database at {} is incompatible ({cause}); recreating it",
            path.display()
        );
        quarantine_db_files(path)?;
        std::fs::write(&guard, migrations::CURRENT_VERSION.to_string())?;

        Self::open_path(path).map_err(|error| {
            if is_incompatible(&error) {
                Error::IncompatibleSchema(format!("recreated database still incompatible: {error}"))
            } else {
                error
            }
        })
    }

    /// Configure `SQLite` for local use
    fn configure(&self) -> Result<()> {
        // WAL is unavailable for in-memory databases
        self.conn.pragma_update(None, "journal_mode", "WAL").ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL").ok();
        self.conn.pragma_update(None, "cache_size", 10000).ok();
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&mut self) -> Result<()> {
        migrations::run(&mut self.conn)
    }

    /// File backing this database, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a mutable reference, needed to open SQL transactions
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Whether `error` means the file cannot be used by this build at all.
pub fn is_incompatible(error: &Error) -> bool {
    match error {
        Error::IncompatibleSchema(_) => true,
        Error::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => {
            failure.code == ErrorCode::NotADatabase
        }
        _ => false,
    }
}

/// Flag file recording that the one-shot reset for this schema version ran.
pub fn reset_guard_path(db_path: &Path) -> PathBuf {
    let base_name = db_path
        .file_name()
        .map_or_else(|| "tally.db".into(), |name| name.to_string_lossy());
    db_path.with_file_name(format!(
        "{base_name}.reset-guard-v{}",
        migrations::CURRENT_VERSION
    ))
}

/// Move the database aside and drop its `-wal`/`-shm`/`-journal` sidecars.
fn quarantine_db_files(db_path: &Path) -> Result<()> {
    let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
        return Ok(());
    };

    if db_path.exists() {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));
        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved incompatible local DB file from {} to {}",
            db_path.display(),
            backup_path.display()
        );
    }

    let parent = match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let sidecar_prefix = format!("{base_name}-");

    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with(&sidecar_prefix) {
            let path = entry.path();
            std::fs::remove_file(&path)?;
            tracing::warn!("Removed stale local DB sidecar {}", path.display());
        }
    }

    Ok(())
}
