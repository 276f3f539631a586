//! Connectivity state fed by the host platform
//!
//! The library does not check the network itself. The host reports changes
//! through [`Connectivity::set_status`] and subscribers see each transition.

use std::sync::{Mutex, RwLock};

/// Kind of network link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

/// Reported network state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected(ConnectionType),
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected(_))
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Connected(ConnectionType::Unknown)
    }
}

/// Called with `(previous, current)` on every change
pub type ConnectivityObserver = Box<dyn Fn(ConnectionStatus, ConnectionStatus) + Send + Sync>;

/// Shared connectivity status with change subscriptions
#[derive(Default)]
pub struct Connectivity {
    status: Mutex<ConnectionStatus>,
    /// Held from the status update until every observer has returned
    notify: Mutex<()>,
    observers: RwLock<Vec<ConnectivityObserver>>,
}

impl Connectivity {
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a new status; observers run only when it actually changed.
    ///
    /// Concurrent callers are notified in the order their updates applied.
    /// Observers must not call back into `set_status`.
    pub fn set_status(&self, status: ConnectionStatus) -> bool {
        let _notifying = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        let previous = {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *current == status {
                return false;
            }
            std::mem::replace(&mut *current, status)
        };

        tracing::info!(?previous, current = ?status, "Connectivity changed");

        for observer in self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            observer(previous, status);
        }
        true
    }

    pub fn subscribe(&self, observer: ConnectivityObserver) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }
}
