//! Local id vs server-canonical id reconciliation for deduplicated tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::LocalRecord;
use crate::models::{NamedRecord, RecordId};
use crate::services::{LocalStore, ReconcileOutcome};
use crate::Result;

/// What to do when the server answers an upload with a different id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Replace the local row with the canonical one, re-pointing children
    #[default]
    AdoptCanonical,
    /// Keep the local id and remember the canonical id beside it
    RetainLocal,
}

impl IdentityStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdoptCanonical => "adopt_canonical",
            Self::RetainLocal => "retain_local",
        }
    }
}

impl fmt::Display for IdentityStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "adopt_canonical" | "adopt" => Ok(Self::AdoptCanonical),
            "retain_local" | "retain" => Ok(Self::RetainLocal),
            other => Err(format!("unknown identity strategy '{other}'")),
        }
    }
}

/// Folds server-canonical rows into the local store.
#[derive(Clone)]
pub struct IdentityReconciler {
    store: LocalStore,
    strategy: IdentityStrategy,
}

impl IdentityReconciler {
    pub const fn new(store: LocalStore, strategy: IdentityStrategy) -> Self {
        Self { store, strategy }
    }

    pub const fn strategy(&self) -> IdentityStrategy {
        self.strategy
    }

    /// Pair an uploaded record with its returned row: same id first, then
    /// same normalized name.
    pub fn match_returned<'r, R: NamedRecord>(pushed: &R, returned: &'r [R]) -> Option<&'r R> {
        returned
            .iter()
            .find(|row| row.id() == pushed.id())
            .or_else(|| {
                let key = pushed.name_key();
                returned.iter().find(|row| row.name_key() == key)
            })
    }

    /// Resolve `local_id` against the canonical row the server holds.
    ///
    /// Leaves exactly one local row for the canonical row's name key.
    pub async fn reconcile<R: LocalRecord + NamedRecord>(
        &self,
        local_id: &RecordId,
        canonical: R,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let canonical_id = canonical.id().clone();
        let outcome = match self.strategy {
            IdentityStrategy::AdoptCanonical => {
                self.store.adopt_canonical(local_id, canonical, now).await?
            }
            IdentityStrategy::RetainLocal => {
                self.store.retain_local(local_id, canonical, now).await?
            }
        };
        tracing::info!(
            "Reconciled {} {local_id} with canonical {canonical_id} ({}): {} children remapped, {} purged",
            R::TABLE,
            self.strategy,
            outcome.remapped_children,
            outcome.purged
        );
        Ok(outcome)
    }
}
