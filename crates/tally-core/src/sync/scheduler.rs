//! Timer-driven jobs with a single-flight guard.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Allows at most one holder at a time; later callers are turned away, not queued.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the flight, or `None` when another holder is still running.
    pub fn try_begin(&self) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases its [`SingleFlight`] on drop.
#[derive(Debug)]
pub struct FlightGuard {
    running: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// A job run immediately on start, every `period`, and on demand via
/// [`PeriodicJob::trigger`]. Overlapping runs are dropped.
///
/// Stopping only disables the timer; a cycle already running completes.
#[derive(Debug)]
pub struct PeriodicJob {
    name: &'static str,
    period: Duration,
    flight: SingleFlight,
    wake: Arc<Notify>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicJob {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            flight: SingleFlight::new(),
            wake: Arc::new(Notify::new()),
            timer: Mutex::new(None),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Start the timer. Returns `false` when it is already running.
    pub fn start<F, Fut>(&self, job: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let name = self.name;
        let period = self.period;
        let flight = self.flight.clone();
        let wake = Arc::clone(&self.wake);
        *timer = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {}
                    () = wake.notified() => {}
                }
                let Some(guard) = flight.try_begin() else {
                    tracing::debug!("Skipping {name} cycle; previous cycle still running");
                    continue;
                };
                let cycle = job();
                tokio::spawn(async move {
                    cycle.await;
                    drop(guard);
                });
            }
        }));
        tracing::debug!("Started {name} job every {period:?}");
        true
    }

    /// Request an out-of-band cycle. Ignored while stopped.
    pub fn trigger(&self) {
        if self.is_started() {
            self.wake.notify_one();
        }
    }

    /// Stop the timer. An in-flight cycle still runs to completion.
    pub fn stop(&self) {
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!("Stopped {} job", self.name);
        }
    }

    pub fn is_started(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Whether a cycle is executing right now
    pub fn is_busy(&self) -> bool {
        self.flight.is_running()
    }

    /// Guard shared by timer cycles, for running a cycle by hand.
    pub const fn flight(&self) -> &SingleFlight {
        &self.flight
    }
}

impl Drop for PeriodicJob {
    fn drop(&mut self) {
        self.stop();
    }
}
