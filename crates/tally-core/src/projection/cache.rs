//! In-memory "selected day" view, rebuilt from the local store on demand.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use super::{build_daily_ledger, DailyLedger};
use crate::models::{DayKey, TransactionKind};
use crate::services::LocalStore;
use crate::sync::AffectedScope;
use crate::Result;

/// Holds the projection of the selected day. Never persisted.
#[derive(Clone)]
pub struct ViewCache {
    store: LocalStore,
    state: Arc<watch::Sender<Option<DailyLedger>>>,
    // Serializes rebuilds so an older read never overwrites a newer one
    rebuild: Arc<Mutex<()>>,
}

impl ViewCache {
    pub fn new(store: LocalStore) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            store,
            state: Arc::new(state),
            rebuild: Arc::new(Mutex::new(())),
        }
    }

    pub fn selected_day(&self) -> Option<DayKey> {
        self.state.borrow().as_ref().map(|ledger| ledger.day)
    }

    /// Current projection, `None` before a day is selected
    pub fn snapshot(&self) -> Option<DailyLedger> {
        self.state.borrow().clone()
    }

    /// Receive every recomputed projection
    pub fn subscribe(&self) -> watch::Receiver<Option<DailyLedger>> {
        self.state.subscribe()
    }

    /// Switch to `day` and compute its ledger.
    pub async fn select_day(&self, day: DayKey) -> Result<DailyLedger> {
        let _rebuild = self.rebuild.lock().await;
        let ledger = self.compute(day).await?;
        self.state.send_replace(Some(ledger.clone()));
        Ok(ledger)
    }

    /// Recompute the selected day. Returns `false` when nothing is selected.
    pub async fn refresh(&self) -> Result<bool> {
        let _rebuild = self.rebuild.lock().await;
        let Some(day) = self.selected_day() else {
            return Ok(false);
        };
        let ledger = self.compute(day).await?;
        self.state.send_replace(Some(ledger));
        Ok(true)
    }

    /// Recompute when `scope` touches the selected day.
    pub async fn refresh_for(&self, scope: &AffectedScope) -> Result<bool> {
        match self.selected_day() {
            Some(day) if scope.touches(day) => self.refresh().await,
            _ => Ok(false),
        }
    }

    pub fn clear(&self) {
        self.state.send_replace(None);
    }

    async fn compute(&self, day: DayKey) -> Result<DailyLedger> {
        let records = self.store.day_records(day, TransactionKind::Sale).await?;
        Ok(build_daily_ledger(day, records))
    }
}
