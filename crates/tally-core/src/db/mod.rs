//! Database layer for Tally

mod connection;
mod conflict_repository;
mod migrations;
mod repository;
mod settings_repository;
mod watermark_repository;

pub use connection::{is_incompatible, reset_guard_path, Database};
pub use conflict_repository::ConflictRepository;
pub use migrations::CURRENT_VERSION as SCHEMA_VERSION;
pub use repository::{
    child_references, remap_references, ApplyOutcome, LocalRecord, RecordRepository,
};
pub use settings_repository::{SettingsRepository, LAST_PULL_AT, LAST_PUSH_AT, LAST_SYNC_ERROR};
pub use watermark_repository::WatermarkRepository;
