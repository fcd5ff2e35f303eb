//! Shared utility functions used across multiple modules.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Deduplication key for names: trimmed, inner whitespace collapsed, lowercase.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Fixed-width ISO-8601 rendering (microseconds, `Z`), ordered lexicographically.
pub fn iso_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO-8601 timestamp with any offset into UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Current time at the store's microsecond precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The "never synced" watermark.
pub const fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Timestamp to store in `last_synced_at` for a row confirmed at `now`.
///
/// Never earlier than the row's own `updated_at`, so a row stamped from a
/// clock-skewed writer does not look dirty forever.
pub fn synced_stamp(now: DateTime<Utc>, updated_at: DateTime<Utc>) -> DateTime<Utc> {
    now.max(updated_at)
}
