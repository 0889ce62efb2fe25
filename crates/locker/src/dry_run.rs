//! Engine and platform stand-ins for running the controller on a host
//! without a packet engine or a VPN service.

use locker_vpn::{
    CaPaths, ConnectivityObserver, Engine, EngineError, NetworkInfo, PackageResolver, Platform, PlatformError,
    ProxyAssignment, RunOptions, SessionConfig, SubscriptionId, TunnelFd, TunnelHandle,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Logs every engine call.
#[derive(Debug, Default)]
pub struct DryRunEngine {
    running: bool,
    app_proxies: usize,
}

impl Engine for DryRunEngine {
    fn run(&mut self, fd: TunnelFd, options: &RunOptions) -> Result<(), EngineError> {
        info!(
            "[engine] run fd={} concurrency={} tls={}",
            fd,
            options.concurrency,
            options.tls.is_some()
        );
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if !self.running {
            return Err(EngineError::NotRunning);
        }
        info!("[engine] stop");
        self.running = false;
        Ok(())
    }

    fn reset_proxy_servers(&mut self) -> Result<(), EngineError> {
        debug!("[engine] reset {} app proxies", self.app_proxies);
        self.app_proxies = 0;
        Ok(())
    }

    fn set_default_proxy(&mut self, proxy: &ProxyAssignment) -> Result<(), EngineError> {
        info!(
            "[engine] default proxy {} ({}, code {}, auth={})",
            proxy.address,
            proxy.kind,
            proxy.kind.code(),
            !proxy.credential_header.is_empty()
        );
        Ok(())
    }

    fn add_proxy_server(&mut self, uid: u32, proxy: &ProxyAssignment) -> Result<(), EngineError> {
        info!("[engine] proxy for uid {} -> {} ({})", uid, proxy.address, proxy.kind);
        self.app_proxies += 1;
        Ok(())
    }

    fn generate_certs(&mut self, paths: &CaPaths) -> Result<(), EngineError> {
        info!(
            "[engine] generate CA {} / {}",
            paths.cert_path.display(),
            paths.key_path.display()
        );
        Ok(())
    }

    fn load_and_set_ca(&mut self, paths: &CaPaths) -> Result<(), EngineError> {
        info!("[engine] load CA {}", paths.cert_path.display());
        Ok(())
    }
}

/// Simulated active network with observer fan-out.
#[derive(Clone, Default)]
pub struct HostNetwork {
    active: Arc<Mutex<Option<NetworkInfo>>>,
    observers: Arc<Mutex<HashMap<u64, ConnectivityObserver>>>,
    next_id: Arc<AtomicU64>,
}

impl HostNetwork {
    pub fn new(initial: Option<NetworkInfo>) -> Self {
        let network = Self::default();
        *network.active.lock().unwrap_or_else(|e| e.into_inner()) = initial;
        network
    }

    pub fn active(&self) -> Option<NetworkInfo> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the active network and notify every observer.
    pub fn set_active(&self, info: Option<NetworkInfo>) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = info;

        let observers: Vec<ConnectivityObserver> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        debug!("Network now {:?}, notifying {} observer(s)", info, observers.len());
        for observer in observers {
            observer(info);
        }
    }

    fn register(&self, observer: ConnectivityObserver) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, observer);
        id
    }

    fn unregister(&self, id: u64) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Debug)]
pub struct HostTunnel {
    fd: TunnelFd,
}

impl TunnelHandle for HostTunnel {
    fn fd(&self) -> TunnelFd {
        self.fd
    }

    fn close(self) -> Result<(), PlatformError> {
        info!("[platform] close tunnel fd={}", self.fd);
        Ok(())
    }
}

/// Host platform: always permitted, fake descriptors, logged indicator.
pub struct HostPlatform {
    network: HostNetwork,
    package_uids: BTreeMap<String, u32>,
    next_fd: TunnelFd,
}

impl HostPlatform {
    pub fn new(network: HostNetwork, package_uids: BTreeMap<String, u32>) -> Self {
        Self {
            network,
            package_uids,
            next_fd: 100,
        }
    }
}

impl PackageResolver for HostPlatform {
    fn resolve_uid(&self, package: &str) -> Option<u32> {
        self.package_uids.get(package).copied()
    }
}

impl Platform for HostPlatform {
    type Tunnel = HostTunnel;

    fn has_vpn_permission(&self) -> bool {
        true
    }

    fn establish(&mut self, config: &SessionConfig) -> Result<HostTunnel, PlatformError> {
        let fd = self.next_fd;
        self.next_fd += 1;
        info!(
            "[platform] establish '{}' fd={} addresses={:?} routes={} mtu={} filter={:?}",
            config.session_name,
            fd,
            config.interface.addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            config.interface.routes.len(),
            config.interface.mtu,
            config.app_filter
        );
        Ok(HostTunnel { fd })
    }

    fn active_network(&self) -> Option<NetworkInfo> {
        self.network.active()
    }

    fn register_connectivity(&mut self, observer: ConnectivityObserver) -> Result<SubscriptionId, PlatformError> {
        let id = self.network.register(observer);
        debug!("[platform] connectivity subscription {}", id);
        Ok(SubscriptionId(id))
    }

    fn unregister_connectivity(&mut self, id: SubscriptionId) -> Result<(), PlatformError> {
        if self.network.unregister(id.0) {
            Ok(())
        } else {
            Err(PlatformError::NotRegistered(id))
        }
    }

    fn show_active_indicator(&mut self) {
        info!("[platform] VPN active");
    }

    fn clear_active_indicator(&mut self) {
        info!("[platform] VPN inactive");
    }
}
