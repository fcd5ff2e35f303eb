//! Offline-first synchronization: push, pull, reconciliation and scheduling.

mod engine;
mod identity;
mod network;
mod puller;
mod report;
mod runtime;
mod scheduler;

pub use engine::{
    BootstrapReport, EngineOptions, SyncEngine, DEFAULT_PAGE_SIZE, DEFAULT_PUSH_BATCH_SIZE,
};
pub use identity::{IdentityReconciler, IdentityStrategy};
pub use network::{NetworkMonitor, ReconnectSignal};
pub use puller::{IncrementalPuller, DEFAULT_PULL_INTERVAL};
pub use report::{AffectedScope, PullAllReport, PullReport, PushReport, TablePushReport};
pub use runtime::{RuntimeOptions, RuntimeStatus, SyncRuntime, DEFAULT_PUSH_INTERVAL};
pub use scheduler::{FlightGuard, PeriodicJob, SingleFlight};
