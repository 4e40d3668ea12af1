//! Connectivity observer
//!
//! Hosts report online/offline transitions through this small watch-channel
//! wrapper instead of the engine listening to platform events directly. The
//! [`StorageManager`](crate::StorageManager) subscribes and toggles the sync
//! manager's offline mode on every transition.

use tokio::sync::watch;

/// Publishes connectivity transitions to any number of subscribers.
pub struct ConnectivityObserver {
    tx: watch::Sender<bool>,
}

impl ConnectivityObserver {
    /// New observer, initially online.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }

    /// New observer with an explicit initial state.
    pub fn with_state(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Report a connectivity transition.
    pub fn set_online(&self, online: bool) {
        // Only transitions matter; send_if_modified avoids waking
        // subscribers on repeated identical reports.
        self.tx.send_if_modified(|state| {
            if *state == online {
                false
            } else {
                *state = online;
                true
            }
        });
    }

    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityObserver {
    fn default() -> Self {
        Self::new()
    }
}
