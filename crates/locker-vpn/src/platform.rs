//! Host platform boundary: tunnel creation, permission, connectivity
//! notifications and the active-session indicator.

use crate::connectivity::ConnectivityObserver;
use crate::engine::TunnelFd;
use crate::network::NetworkInfo;
use crate::proxy::{PackageResolver, SessionConfig};

/// Handle of a registered connectivity observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Platform errors
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("VPN permission not granted")]
    PermissionDenied,

    #[error("Tunnel establishment failed: {0}")]
    Establish(String),

    #[error("Subscription {0:?} not registered")]
    NotRegistered(SubscriptionId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An established tunnel interface.
pub trait TunnelHandle: Send {
    fn fd(&self) -> TunnelFd;

    /// Close the interface, consuming the handle.
    fn close(self) -> Result<(), PlatformError>;
}

/// Host platform services used by the session controller.
pub trait Platform: PackageResolver + Send {
    type Tunnel: TunnelHandle;

    /// Whether the user granted VPN permission.
    fn has_vpn_permission(&self) -> bool;

    /// Create the tunnel interface described by `config`.
    fn establish(&mut self, config: &SessionConfig) -> Result<Self::Tunnel, PlatformError>;

    /// Current active network, if any.
    fn active_network(&self) -> Option<NetworkInfo>;

    /// Deliver network-change notifications to `observer` until unregistered.
    fn register_connectivity(&mut self, observer: ConnectivityObserver) -> Result<SubscriptionId, PlatformError>;

    fn unregister_connectivity(&mut self, id: SubscriptionId) -> Result<(), PlatformError>;

    /// Show the persistent "VPN active" indicator.
    fn show_active_indicator(&mut self);

    fn clear_active_indicator(&mut self);
}
