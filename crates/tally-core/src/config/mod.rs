//! Runtime configuration shared by every front end.
//!
//! Values come from `<config_dir>/tally/config.json` and are then overridden
//! by `TALLY_*` environment variables. Every field has a default, so a missing
//! file yields a local-only configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::realtime::SupabaseRealtime;
use crate::remote::{PostgrestRemote, RemoteError};
use crate::sync::{
    EngineOptions, IdentityStrategy, RuntimeOptions, DEFAULT_PAGE_SIZE, DEFAULT_PUSH_BATCH_SIZE,
    DEFAULT_PULL_INTERVAL, DEFAULT_PUSH_INTERVAL,
};
use crate::util::{is_http_url, normalize_text_option};

const APP_DIR: &str = "tally";
const CONFIG_FILE_NAME: &str = "config.json";
const DB_FILE_NAME: &str = "tally.db";
const DEFAULT_RECONNECT_DEBOUNCE_MS: u64 = 1000;

/// Errors while loading, validating or saving the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write config at {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("Could not resolve the user {0} directory")]
    NoDirectory(&'static str),
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct TallyConfig {
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    /// User session token; the anon key is sent when absent
    pub access_token: Option<String>,
    pub db_path: Option<PathBuf>,
    pub page_size: usize,
    pub push_batch_size: usize,
    pub pull_interval_secs: u64,
    pub push_interval_secs: u64,
    pub reconnect_debounce_ms: u64,
    pub identity_strategy: IdentityStrategy,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            access_token: None,
            db_path: None,
            page_size: DEFAULT_PAGE_SIZE,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            pull_interval_secs: DEFAULT_PULL_INTERVAL.as_secs(),
            push_interval_secs: DEFAULT_PUSH_INTERVAL.as_secs(),
            reconnect_debounce_ms: DEFAULT_RECONNECT_DEBOUNCE_MS,
            identity_strategy: IdentityStrategy::default(),
        }
    }
}

impl std::fmt::Debug for TallyConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TallyConfig")
            .field("supabase_url", &self.supabase_url)
            .field(
                "supabase_anon_key",
                &self.supabase_anon_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("db_path", &self.db_path)
            .field("page_size", &self.page_size)
            .field("push_batch_size", &self.push_batch_size)
            .field("pull_interval_secs", &self.pull_interval_secs)
            .field("push_interval_secs", &self.push_interval_secs)
            .field("reconnect_debounce_ms", &self.reconnect_debounce_ms)
            .field("identity_strategy", &self.identity_strategy)
            .finish()
    }
}

/// `<config_dir>/tally/config.json`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoDirectory("config"))
}

/// `<data_dir>/tally/tally.db`
pub fn default_db_path() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR).join(DB_FILE_NAME))
        .ok_or(ConfigError::NoDirectory("data"))
}

impl TallyConfig {
    /// Load the default file, then apply the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from_path(&default_config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`; a missing file is the default configuration.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, serialized).map_err(write_error)
    }

    /// Apply `TALLY_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| normalize_text_option(lookup(key));

        if let Some(url) = value("TALLY_SUPABASE_URL") {
            self.supabase_url = Some(url);
        }
        if let Some(key) = value("TALLY_SUPABASE_ANON_KEY") {
            self.supabase_anon_key = Some(key);
        }
        if let Some(token) = value("TALLY_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Some(path) = value("TALLY_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = value("TALLY_PAGE_SIZE") {
            self.page_size = parse_number("TALLY_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = value("TALLY_PUSH_BATCH_SIZE") {
            self.push_batch_size = parse_number("TALLY_PUSH_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = value("TALLY_PULL_INTERVAL_SECS") {
            self.pull_interval_secs = parse_number("TALLY_PULL_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = value("TALLY_PUSH_INTERVAL_SECS") {
            self.push_interval_secs = parse_number("TALLY_PUSH_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = value("TALLY_IDENTITY_STRATEGY") {
            self.identity_strategy = raw.parse().map_err(|message| ConfigError::Invalid {
                key: "TALLY_IDENTITY_STRATEGY",
                message,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.supabase_url {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid {
                    key: "supabase_url",
                    message: "must include http:// or https://".to_string(),
                });
            }
        }
        let positive = [
            ("page_size", self.page_size as u64),
            ("push_batch_size", self.push_batch_size as u64),
            ("pull_interval_secs", self.pull_interval_secs),
            ("push_interval_secs", self.push_interval_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Both the project URL and the anon key are set.
    pub fn is_remote_configured(&self) -> bool {
        self.supabase_url.is_some() && self.supabase_anon_key.is_some()
    }

    /// Explicit path, else the configured one, else the platform default.
    pub fn resolve_db_path(&self, explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
        match explicit.or_else(|| self.db_path.clone()) {
            Some(path) => Ok(path),
            None => default_db_path(),
        }
    }

    pub const fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            page_size: self.page_size,
            push_batch_size: self.push_batch_size,
            identity_strategy: self.identity_strategy,
        }
    }

    pub const fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            pull_interval: Duration::from_secs(self.pull_interval_secs),
            push_interval: Duration::from_secs(self.push_interval_secs),
        }
    }

    pub const fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub fn remote(&self) -> Result<PostgrestRemote, RemoteError> {
        let (url, anon_key) = self.credentials()?;
        PostgrestRemote::new(url, anon_key, self.access_token.clone())
    }

    pub fn change_feed(&self) -> Result<SupabaseRealtime, RemoteError> {
        let (url, anon_key) = self.credentials()?;
        SupabaseRealtime::new(url, anon_key, self.access_token.clone())
    }

    fn credentials(&self) -> Result<(&str, &str), RemoteError> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| RemoteError::NotConfigured("supabase_url is not set".into()))?;
        let anon_key = self
            .supabase_anon_key
            .as_deref()
            .ok_or_else(|| RemoteError::NotConfigured("supabase_anon_key is not set".into()))?;
        Ok((url, anon_key))
    }

    fn normalize(&mut self) {
        self.supabase_url = normalize_text_option(self.supabase_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.supabase_anon_key = normalize_text_option(self.supabase_anon_key.take());
        self.access_token = normalize_text_option(self.access_token.take());
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        key,
        message: format!("'{raw}' is not a valid number"),
    })
}
