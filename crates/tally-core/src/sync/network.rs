//! Online/offline flag with a debounced reconnect signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Shared connectivity flag. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
    debounce: Duration,
}

impl NetworkMonitor {
    pub fn new(online: bool, debounce: Duration) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
            debounce,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Update the flag. Returns `true` when it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                tracing::info!("Network is back online");
            } else {
                tracing::warn!("Network went offline; local writes stay queued");
            }
        }
        changed
    }

    /// Raw flag changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Signal fired once per offline→online transition that stays online
    /// for the debounce window.
    pub fn reconnects(&self) -> ReconnectSignal {
        let mut changes = self.state.subscribe();
        let was_online = *changes.borrow_and_update();
        ReconnectSignal {
            changes,
            was_online,
            debounce: self.debounce,
        }
    }
}

/// Stream of debounced reconnects from a [`NetworkMonitor`].
#[derive(Debug)]
pub struct ReconnectSignal {
    changes: watch::Receiver<bool>,
    was_online: bool,
    debounce: Duration,
}

impl ReconnectSignal {
    /// Wait for the next settled reconnect; `None` once the monitor is gone.
    pub async fn next(&mut self) -> Option<()> {
        loop {
            self.changes.changed().await.ok()?;
            let online = *self.changes.borrow_and_update();
            let came_back = online && !self.was_online;
            self.was_online = online;
            if came_back && self.settled().await? {
                return Some(());
            }
        }
    }

    /// `Some(true)` if the link stayed up for the whole debounce window.
    async fn settled(&mut self) -> Option<bool> {
        let deadline = tokio::time::sleep(self.debounce);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return Some(true),
                changed = self.changes.changed() => {
                    changed.ok()?;
                    let online = *self.changes.borrow_and_update();
                    self.was_online = online;
                    if !online {
                        return Some(false);
                    }
                }
            }
        }
    }
}
