//! Locker VPN - per-device VPN session control
//!
//! Brings up a local tunnel interface whose traffic an external packet
//! engine forwards to upstream proxies, and keeps it alive across network
//! handoffs.
//!
//! # Architecture
//!
//! ```text
//!  start/stop/revoke ──┐
//!                      ▼
//!  platform ──▶ SessionCommand channel ──▶ Dispatcher ──▶ VpnSessionController
//!  (network changed)                                       │          │
//!                                                          ▼          ▼
//!                                                       Platform    Engine
//!                                                      (tunnel fd) (proxies, CA)
//! ```
//!
//! # Features
//!
//! - **Explicit state machine**: Stopped / Starting / Running
//! - **Per-app proxies**: default proxy plus uid-scoped assignments
//! - **Handoff restarts**: only on a connected network of a new type
//! - **Engine CA**: generated once, loaded on every start

mod certs;
mod config;
mod connectivity;
mod dispatch;
mod engine;
mod network;
mod platform;
mod proxy;
mod session;

#[cfg(test)]
mod testing;

pub use certs::{CaStatus, prepare_ca};
pub use config::{
    AppFilter, AppProxy, ConfigError, InterfaceConfig, IpNetwork, ProxyAuth, ProxyEndpoint, TlsConfig, VpnConfig,
};
pub use connectivity::{ConnectivityDecision, ConnectivityMonitor, ConnectivityObserver};
pub use dispatch::{Dispatcher, SessionCommand, SessionReport, StopHook, command_channel, connectivity_observer};
pub use engine::{CaPaths, Engine, EngineError, RunOptions, TunnelFd};
pub use network::{ConnectionState, NetworkInfo, NetworkSnapshotTracker, NetworkType, ParseNetworkError};
pub use platform::{Platform, PlatformError, SubscriptionId, TunnelHandle};
pub use proxy::{
    PackageResolver, ProxyAssignment, ProxyConfigBuilder, ProxyKind, ProxyScope, SessionConfig,
    encode_credential_header,
};
pub use session::{SessionError, SessionState, VpnSessionController};
