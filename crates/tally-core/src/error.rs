//! Error types for tally-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input, rejected before any local write
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another active record already uses this normalized name
    #[error("An active {table} record named '{name}' already exists")]
    DuplicateName { table: &'static str, name: String },

    /// On-disk schema cannot be opened by this build
    #[error("Incompatible local schema: {0}")]
    IncompatibleSchema(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote store or change feed error
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl Error {
    /// Whether the error came from the caller's input rather than the store.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::DuplicateName { .. })
    }
}
