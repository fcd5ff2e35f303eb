//! Sync conflict model

use serde::{Deserialize, Serialize};

/// Inbound remote row rejected because the local row was newer (LWW)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Table of the record involved
    pub table_name: String,
    /// Record involved in the conflict
    pub record_id: String,
    /// Existing row's timestamp when conflict occurred (ISO-8601)
    pub local_updated_at: String,
    /// Incoming row's timestamp that was rejected (ISO-8601)
    pub incoming_updated_at: String,
    /// Resolution timestamp (ISO-8601)
    pub resolved_at: String,
    /// Resolution strategy name
    pub strategy: String,
}
