use std::io;

use tally_core::config::ConfigError;
use tally_core::remote::RemoteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("No {kind} matches '{query}'")]
    NotFound { kind: &'static str, query: String },
    #[error("{0}")]
    Ambiguous(String),
    #[error("{0}")]
    SyncFailed(String),
    #[error(
        "Sync is not configured. Run `tally config init --supabase-url URL --supabase-anon-key KEY`, or set TALLY_SUPABASE_URL and TALLY_SUPABASE_ANON_KEY."
    )]
    SyncNotConfigured,
}
