//! Online/offline signal shared between the client and its collaborators.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Connectivity state broadcast over a `watch` channel.
///
/// Clones share the same state. Setting the current value again does not
/// notify subscribers.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ConnectivitySignal {
    /// Create a signal with the given initial state
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create a signal that starts online
    pub fn online() -> Self {
        Self::new(true)
    }

    /// Create a signal that starts offline
    pub fn offline() -> Self {
        Self::new(false)
    }

    /// Update the state, returning whether it changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.sender.send_if_modified(|current| {
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
        changed
    }

    /// Current state
    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::online()
    }
}
