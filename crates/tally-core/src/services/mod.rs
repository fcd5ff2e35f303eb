//! Store handle and user-facing ledger operations

mod ledger;
mod local_store;

pub use ledger::{LedgerService, OrderLine, OrderRequest, PlacedOrder};
pub use local_store::{DayRecords, LocalStore, ReconcileOutcome};
