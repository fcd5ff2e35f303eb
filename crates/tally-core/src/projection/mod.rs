//! Read-only projections of the local store

mod cache;
mod ledger;

pub use cache::ViewCache;
pub use ledger::{build_daily_ledger, DailyLedger, LedgerEntry};
