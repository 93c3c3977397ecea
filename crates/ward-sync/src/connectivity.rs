//! # Connectivity Signal
//!
//! Online/offline state fed by the platform (network reachability) and
//! consumed by the sync service.
//!
//! ```text
//!   platform ──set_online(bool)──► Connectivity (watch) ──► SyncService loop
//!                                                         (offline → online:
//!                                                          flush immediately)
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared, cloneable connectivity state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Connectivity { tx: Arc::new(tx) }
    }

    /// Records a connectivity change. Repeating the current value is a no-op.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a receiver that observes every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Connectivity::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_observed() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();
        assert!(!connectivity.is_online());

        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        // same value does not wake receivers
        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
