//! Periodic catch-up pull, the fallback when realtime events are missed.

use std::sync::Arc;
use std::time::Duration;

use super::engine::SyncEngine;
use super::network::NetworkMonitor;
use super::report::PullAllReport;
use super::scheduler::PeriodicJob;
use crate::models::Table;

pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(30);

/// Runs `pull_all` on start, every interval and on demand. Never two at once.
#[derive(Clone)]
pub struct IncrementalPuller {
    engine: SyncEngine,
    network: Option<NetworkMonitor>,
    job: Arc<PeriodicJob>,
}

impl IncrementalPuller {
    pub fn new(engine: SyncEngine, interval: Duration) -> Self {
        Self {
            engine,
            network: None,
            job: Arc::new(PeriodicJob::new("incremental pull", interval)),
        }
    }

    /// Report reachability seen by each cycle to `network`.
    #[must_use]
    pub fn with_network(mut self, network: NetworkMonitor) -> Self {
        self.network = Some(network);
        self
    }

    pub fn interval(&self) -> Duration {
        self.job.period()
    }

    /// Start the timer; the first cycle runs right away. No-op when started.
    pub fn start(&self) -> bool {
        let puller = self.clone();
        self.job.start(move || {
            let puller = puller.clone();
            async move {
                puller.cycle().await;
            }
        })
    }

    pub fn stop(&self) {
        self.job.stop();
    }

    pub fn is_started(&self) -> bool {
        self.job.is_started()
    }

    pub fn is_busy(&self) -> bool {
        self.job.is_busy()
    }

    /// Ask for a cycle now; dropped if one is already running.
    pub fn trigger(&self) {
        self.job.trigger();
    }

    /// Run one cycle in the caller's task. `None` when a cycle is already running.
    pub async fn run_once(&self) -> Option<PullAllReport> {
        let _flight = self.job.flight().try_begin()?;
        Some(self.cycle().await)
    }

    async fn cycle(&self) -> PullAllReport {
        let report = self.engine.pull_all().await;
        if report.fetched() > 0 || !report.is_success() {
            tracing::debug!("Incremental pull: {report}");
        }
        if let Some(network) = &self.network {
            // Every table failing is treated as lost connectivity
            network.set_online(report.failures.len() < Table::ALL.len());
        }
        report
    }
}
