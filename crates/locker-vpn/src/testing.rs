//! Recording engine and platform fakes shared by the unit tests.

use crate::connectivity::ConnectivityObserver;
use crate::engine::{CaPaths, Engine, EngineError, RunOptions, TunnelFd};
use crate::network::NetworkInfo;
use crate::platform::{Platform, PlatformError, SubscriptionId, TunnelHandle};
use crate::proxy::{PackageResolver, ProxyAssignment, SessionConfig};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Run { fd: TunnelFd, concurrency: usize, tls: bool },
    Stop,
    ResetProxies,
    SetDefaultProxy(String),
    AddProxy(u32, String),
    GenerateCerts,
    LoadCa,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Establish,
    CloseTunnel(TunnelFd),
    Register,
    Unregister,
    ShowIndicator,
    ClearIndicator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Engine(EngineCall),
    Platform(PlatformCall),
}

/// Ordered log shared by the fakes.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn all(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn engine(&self) -> Vec<EngineCall> {
        self.all()
            .into_iter()
            .filter_map(|c| match c {
                Call::Engine(e) => Some(e),
                Call::Platform(_) => None,
            })
            .collect()
    }

    pub fn platform(&self) -> Vec<PlatformCall> {
        self.all()
            .into_iter()
            .filter_map(|c| match c {
                Call::Platform(p) => Some(p),
                Call::Engine(_) => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.all().iter().filter(|c| *c == call).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub struct RecordingEngine {
    log: CallLog,
    failing: HashSet<&'static str>,
}

impl RecordingEngine {
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            failing: HashSet::new(),
        }
    }

    pub fn fail_on(&mut self, call: &'static str) {
        self.failing.insert(call);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.log.engine()
    }

    fn record(&self, name: &'static str, call: EngineCall) -> Result<(), EngineError> {
        self.log.push(Call::Engine(call));
        if self.failing.contains(name) {
            return Err(EngineError::Rejected {
                call: name,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl Engine for RecordingEngine {
    fn run(&mut self, fd: TunnelFd, options: &RunOptions) -> Result<(), EngineError> {
        let call = EngineCall::Run {
            fd,
            concurrency: options.concurrency,
            tls: options.tls.is_some(),
        };
        self.record("run", call)
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.record("stop", EngineCall::Stop)
    }

    fn reset_proxy_servers(&mut self) -> Result<(), EngineError> {
        self.record("reset_proxy_servers", EngineCall::ResetProxies)
    }

    fn set_default_proxy(&mut self, proxy: &ProxyAssignment) -> Result<(), EngineError> {
        self.record("set_default_proxy", EngineCall::SetDefaultProxy(proxy.address.clone()))
    }

    fn add_proxy_server(&mut self, uid: u32, proxy: &ProxyAssignment) -> Result<(), EngineError> {
        self.record("add_proxy_server", EngineCall::AddProxy(uid, proxy.address.clone()))
    }

    fn generate_certs(&mut self, _paths: &CaPaths) -> Result<(), EngineError> {
        self.record("generate_certs", EngineCall::GenerateCerts)
    }

    fn load_and_set_ca(&mut self, _paths: &CaPaths) -> Result<(), EngineError> {
        self.record("load_and_set_ca", EngineCall::LoadCa)
    }
}

pub struct FakeTunnel {
    fd: TunnelFd,
    log: CallLog,
}

impl TunnelHandle for FakeTunnel {
    fn fd(&self) -> TunnelFd {
        self.fd
    }

    fn close(self) -> Result<(), PlatformError> {
        self.log.push(Call::Platform(PlatformCall::CloseTunnel(self.fd)));
        Ok(())
    }
}

pub type Observers = Arc<Mutex<HashMap<u64, ConnectivityObserver>>>;

pub struct FakePlatform {
    log: CallLog,
    pub permission: bool,
    pub establish_fails: bool,
    pub register_fails: bool,
    pub unregister_fails: bool,
    pub active: Option<NetworkInfo>,
    pub packages: HashMap<String, u32>,
    observers: Observers,
    next_fd: TunnelFd,
    next_subscription: u64,
}

impl FakePlatform {
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            permission: true,
            establish_fails: false,
            register_fails: false,
            unregister_fails: false,
            active: None,
            packages: HashMap::new(),
            observers: Observers::default(),
            next_fd: 10,
            next_subscription: 1,
        }
    }

    pub fn observers(&self) -> Observers {
        self.observers.clone()
    }
}

/// Invoke every registered observer with `info`.
pub fn notify(observers: &Observers, info: Option<NetworkInfo>) {
    let current: Vec<ConnectivityObserver> = observers.lock().unwrap().values().cloned().collect();
    for observer in current {
        observer(info);
    }
}

impl PackageResolver for FakePlatform {
    fn resolve_uid(&self, package: &str) -> Option<u32> {
        self.packages.get(package).copied()
    }
}

impl Platform for FakePlatform {
    type Tunnel = FakeTunnel;

    fn has_vpn_permission(&self) -> bool {
        self.permission
    }

    fn establish(&mut self, _config: &SessionConfig) -> Result<FakeTunnel, PlatformError> {
        self.log.push(Call::Platform(PlatformCall::Establish));
        if self.establish_fails {
            return Err(PlatformError::Establish("interface refused".to_string()));
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        Ok(FakeTunnel {
            fd,
            log: self.log.clone(),
        })
    }

    fn active_network(&self) -> Option<NetworkInfo> {
        self.active
    }

    fn register_connectivity(&mut self, observer: ConnectivityObserver) -> Result<SubscriptionId, PlatformError> {
        self.log.push(Call::Platform(PlatformCall::Register));
        if self.register_fails {
            return Err(PlatformError::Establish("callback refused".to_string()));
        }
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.observers.lock().unwrap().insert(id, observer);
        Ok(SubscriptionId(id))
    }

    fn unregister_connectivity(&mut self, id: SubscriptionId) -> Result<(), PlatformError> {
        self.log.push(Call::Platform(PlatformCall::Unregister));
        let removed = self.observers.lock().unwrap().remove(&id.0);
        if self.unregister_fails || removed.is_none() {
            return Err(PlatformError::NotRegistered(id));
        }
        Ok(())
    }

    fn show_active_indicator(&mut self) {
        self.log.push(Call::Platform(PlatformCall::ShowIndicator));
    }

    fn clear_active_indicator(&mut self) {
        self.log.push(Call::Platform(PlatformCall::ClearIndicator));
    }
}
