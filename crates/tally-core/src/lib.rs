//! tally-core - Core library for Tally
//!
//! This crate contains the models, the local store, the remote store client
//! and the offline-first sync engine used by every Tally front end.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod projection;
pub mod realtime;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use models::{
    Client, DayKey, Employee, LineItem, Product, RecordId, SyncConflict, Table, Transaction,
};
pub use services::{LedgerService, LocalStore};
pub use state::SyncState;
pub use sync::{SyncEngine, SyncRuntime};
