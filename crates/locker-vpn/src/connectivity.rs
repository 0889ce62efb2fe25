//! Connectivity-driven restart policy.
//!
//! The platform delivers "network changed" notifications while the session
//! is running. A restart is only worth it on a genuine handoff (e.g. Wi-Fi
//! to cellular) that has finished connecting; re-associating to the same
//! transport or passing through a non-connected state never restarts.

use crate::network::{NetworkInfo, NetworkSnapshotTracker};
use std::sync::Arc;
use tracing::{debug, info};

/// Callback registered with the platform for network-change notifications.
///
/// The argument is the platform's current active network, if it can be
/// resolved.
pub type ConnectivityObserver = Arc<dyn Fn(Option<NetworkInfo>) + Send + Sync>;

/// What the monitor concluded from one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityDecision {
    /// Session is not running; notification dropped
    Inactive,
    /// No active network could be resolved
    NoActiveNetwork,
    /// Same transport as the recorded snapshot
    SameNetworkType,
    /// New transport, but not connected yet
    NotConnected,
    /// Handoff to a connected network of a different type
    Restart,
}

impl ConnectivityDecision {
    pub fn should_restart(&self) -> bool {
        matches!(self, ConnectivityDecision::Restart)
    }
}

/// Decides whether a network change warrants a session restart.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityMonitor {
    tracker: NetworkSnapshotTracker,
}

impl ConnectivityMonitor {
    /// Seed the snapshot with the network active when the session first started.
    pub fn new(initial: Option<NetworkInfo>) -> Self {
        Self {
            tracker: NetworkSnapshotTracker::new(initial),
        }
    }

    pub fn snapshot(&self) -> Option<NetworkInfo> {
        self.tracker.last()
    }

    /// Evaluate one notification.
    ///
    /// On [`ConnectivityDecision::Restart`] the snapshot already holds the new
    /// network, so the settle notification that follows the restart compares
    /// equal and is ignored.
    pub fn on_network_changed(&mut self, active: Option<NetworkInfo>) -> ConnectivityDecision {
        let Some(current) = active else {
            debug!("Network change without an active network, ignoring");
            return ConnectivityDecision::NoActiveNetwork;
        };

        if !self.tracker.is_new_type(&current) {
            debug!("Network change to {} keeps the same type, ignoring", current);
            return ConnectivityDecision::SameNetworkType;
        }

        if !current.state.is_connected() {
            debug!("Network {} is not connected yet, ignoring", current);
            return ConnectivityDecision::NotConnected;
        }

        info!(
            "Network changed from {} to {}, restarting session",
            self.tracker
                .last()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "none".to_string()),
            current
        );
        self.tracker.record(current);
        ConnectivityDecision::Restart
    }
}
