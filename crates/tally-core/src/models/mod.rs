//! Data models for Tally

mod client;
mod day;
mod employee;
mod id;
mod line_item;
mod product;
mod record;
mod sync_conflict;
mod table;
mod transaction;

pub use client::{Client, ClientKind, WALK_IN_NAME};
pub use day::DayKey;
pub use employee::Employee;
pub use id::{IdMap, RecordId};
pub use line_item::LineItem;
pub use product::{validate_price, Product};
pub use record::{NamedRecord, Record, SyncStamps};
pub use sync_conflict::SyncConflict;
pub use table::Table;
pub use transaction::{PreparationStatus, Transaction, TransactionKind};
