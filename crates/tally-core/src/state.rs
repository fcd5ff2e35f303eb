//! Shared sync state shown by every front end.

use std::fmt;

use serde::Serialize;

/// Coarse sync status for display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    /// Combine connectivity, activity and the last cycle's outcome.
    pub const fn from_parts(online: bool, busy: bool, last_cycle_failed: bool) -> Self {
        if !online {
            Self::Offline
        } else if busy {
            Self::Syncing
        } else if last_cycle_failed {
            Self::Error
        } else {
            Self::Synced
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_wins_over_everything() {
        assert_eq!(SyncState::from_parts(false, true, true), SyncState::Offline);
        assert_eq!(SyncState::from_parts(true, true, true), SyncState::Syncing);
        assert_eq!(SyncState::from_parts(true, false, true), SyncState::Error);
        assert_eq!(SyncState::from_parts(true, false, false), SyncState::Synced);
    }
}
