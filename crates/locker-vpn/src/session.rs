//! VPN session controller
//!
//! Owns the tunnel lifecycle as an explicit state machine:
//!
//! ```text
//!  Stopped --start--> Starting --setup ok--> Running
//!     ^                   |                     |
//!     +----setup failed---+                     |
//!     +-------------stop / revoke---------------+
//!                 Running --restart--> Starting --> Running | Stopped
//! ```
//!
//! The tunnel handle and the connectivity subscription exist exactly while
//! the session is Running, and are torn down together.

use crate::certs::prepare_ca;
use crate::config::{ConfigError, VpnConfig};
use crate::connectivity::{ConnectivityDecision, ConnectivityMonitor, ConnectivityObserver};
use crate::engine::{Engine, EngineError, RunOptions};
use crate::network::NetworkInfo;
use crate::platform::{Platform, PlatformError, SubscriptionId, TunnelHandle};
use crate::proxy::{ProxyConfigBuilder, ProxyScope, SessionConfig};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No tunnel
    Stopped,
    /// Setup in progress
    Starting,
    /// Tunnel established and engine running
    Running,
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("VPN permission not granted")]
    PermissionDenied,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tunnel establishment failed: {0}")]
    TunnelEstablish(#[source] PlatformError),

    #[error("Tunnel close failed: {0}")]
    TunnelClose(#[source] PlatformError),

    #[error("Connectivity subscription failed: {0}")]
    Subscription(#[source] PlatformError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Drives one VPN session over an [`Engine`] and a [`Platform`].
pub struct VpnSessionController<E: Engine, P: Platform> {
    config: VpnConfig,
    engine: E,
    platform: P,
    /// Registered with the platform on every setup
    observer: ConnectivityObserver,
    state: SessionState,
    tunnel: Option<P::Tunnel>,
    subscription: Option<SubscriptionId>,
    /// Created on first start, kept across restarts
    monitor: Option<ConnectivityMonitor>,
    started_at: Option<Instant>,
    restarts: u32,
}

impl<E: Engine, P: Platform> VpnSessionController<E, P> {
    pub fn new(config: VpnConfig, engine: E, platform: P, observer: ConnectivityObserver) -> Self {
        Self {
            config,
            engine,
            platform,
            observer,
            state: SessionState::Stopped,
            tunnel: None,
            subscription: None,
            monitor: None,
            started_at: None,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn config(&self) -> &VpnConfig {
        &self.config
    }

    /// Replace the configuration. Takes effect on the next setup.
    pub fn set_config(&mut self, config: VpnConfig) {
        self.config = config;
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Time since the current tunnel came up.
    pub fn connection_duration(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Connectivity-driven restarts since creation.
    pub fn restart_count(&self) -> u32 {
        self.restarts
    }

    /// Network recorded at the last restart decision (or first start).
    pub fn network_snapshot(&self) -> Option<NetworkInfo> {
        self.monitor.as_ref().and_then(|m| m.snapshot())
    }

    /// Start the session.
    ///
    /// No-op unless Stopped. Prepares the engine CA, then sets up the tunnel.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Stopped {
            debug!("Start ignored, session is {:?}", self.state);
            return Ok(());
        }

        if !self.platform.has_vpn_permission() {
            warn!("Start refused: VPN permission not granted");
            return Err(SessionError::PermissionDenied);
        }

        info!("Starting VPN session '{}'", self.config.session_name);

        if let Some(paths) = self.config.tls.ca_paths() {
            if let Err(e) = prepare_ca(&mut self.engine, &paths) {
                error!("Engine CA preparation failed: {}", e);
                return Err(e.into());
            }
        }

        self.setup()?;
        self.platform.show_active_indicator();
        Ok(())
    }

    /// Stop the session. Idempotent.
    ///
    /// Teardown always completes; the first failure is returned.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Stopped {
            debug!("Stop ignored, session already stopped");
            return Ok(());
        }

        info!("Stopping VPN session");
        let result = self.teardown();
        self.platform.clear_active_indicator();
        result
    }

    /// The platform revoked the tunnel (e.g. another VPN took over).
    pub fn revoke(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Stopped {
            debug!("Revoke ignored, session already stopped");
            return Ok(());
        }

        warn!("VPN tunnel revoked by platform");
        self.stop()
    }

    /// Tear down and set up again. No-op unless Running.
    ///
    /// The indicator stays up unless the new setup fails.
    pub fn restart_if_running(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Running {
            debug!("Restart ignored, session is {:?}", self.state);
            return Ok(());
        }

        self.restarts += 1;
        info!("Restarting VPN session (restart #{})", self.restarts);

        if let Err(e) = self.teardown() {
            warn!("Teardown during restart reported: {}", e);
        }

        if let Err(e) = self.setup() {
            self.platform.clear_active_indicator();
            return Err(e);
        }
        Ok(())
    }

    /// Feed a network-change notification through the connectivity monitor.
    pub fn on_network_changed(&mut self, active: Option<NetworkInfo>) -> Result<ConnectivityDecision, SessionError> {
        if self.state != SessionState::Running {
            debug!("Network change while {:?}, ignoring", self.state);
            return Ok(ConnectivityDecision::Inactive);
        }

        let Some(monitor) = self.monitor.as_mut() else {
            return Ok(ConnectivityDecision::Inactive);
        };

        let decision = monitor.on_network_changed(active);
        if decision.should_restart() {
            self.restart_if_running()?;
        }
        Ok(decision)
    }

    /// Starting -> Running, or back to Stopped on any failure.
    fn setup(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Starting;

        match self.try_setup() {
            Ok(tunnel) => {
                let fd = tunnel.fd();
                self.tunnel = Some(tunnel);
                self.state = SessionState::Running;
                self.started_at = Some(Instant::now());
                info!("VPN session running (fd {})", fd);
                Ok(())
            }
            Err(e) => {
                error!("VPN session setup failed: {}", e);
                self.state = SessionState::Stopped;
                Err(e)
            }
        }
    }

    fn try_setup(&mut self) -> Result<P::Tunnel, SessionError> {
        let session = ProxyConfigBuilder::new(&self.config, &self.platform).build()?;
        self.apply_proxies(&session)?;

        let tunnel = self
            .platform
            .establish(&session)
            .map_err(SessionError::TunnelEstablish)?;

        let options = RunOptions {
            concurrency: self.config.concurrency,
            tls: self.config.tls.ca_paths(),
        };
        if let Err(e) = self.engine.run(tunnel.fd(), &options) {
            close_quietly(tunnel);
            return Err(e.into());
        }

        if self.monitor.is_none() {
            self.monitor = Some(ConnectivityMonitor::new(self.platform.active_network()));
        }

        match self.platform.register_connectivity(self.observer.clone()) {
            Ok(id) => self.subscription = Some(id),
            Err(e) => {
                if let Err(stop_err) = self.engine.stop() {
                    warn!("Engine stop after failed subscription: {}", stop_err);
                }
                close_quietly(tunnel);
                return Err(SessionError::Subscription(e));
            }
        }

        Ok(tunnel)
    }

    fn apply_proxies(&mut self, session: &SessionConfig) -> Result<(), EngineError> {
        self.engine.reset_proxy_servers()?;
        self.engine.set_default_proxy(&session.default_proxy)?;

        for proxy in &session.app_proxies {
            if let ProxyScope::Application(uid) = proxy.scope {
                self.engine.add_proxy_server(uid, proxy)?;
            }
        }
        debug!(
            "Applied default proxy {} and {} app proxies",
            session.default_proxy.address,
            session.app_proxies.len()
        );
        Ok(())
    }

    /// Unsubscribe, close the tunnel and stop the engine. Ends Stopped.
    fn teardown(&mut self) -> Result<(), SessionError> {
        if let Some(id) = self.subscription.take() {
            if let Err(e) = self.platform.unregister_connectivity(id) {
                debug!("Connectivity subscription already gone: {}", e);
            }
        }

        let mut first_error = None;
        if let Some(tunnel) = self.tunnel.take() {
            if let Err(e) = tunnel.close() {
                warn!("Tunnel close failed: {}", e);
                first_error = Some(SessionError::TunnelClose(e));
            }
            if let Err(e) = self.engine.stop() {
                warn!("Engine stop failed: {}", e);
                first_error.get_or_insert(SessionError::Engine(e));
            }
        }

        self.state = SessionState::Stopped;
        self.started_at = None;
        first_error.map_or(Ok(()), Err)
    }
}

impl<E: Engine, P: Platform> Drop for VpnSessionController<E, P> {
    fn drop(&mut self) {
        if self.state != SessionState::Stopped {
            if let Err(e) = self.stop() {
                warn!("Stop on drop failed: {}", e);
            }
        }
    }
}

fn close_quietly<T: TunnelHandle>(tunnel: T) {
    if let Err(e) = tunnel.close() {
        warn!("Tunnel close after failed setup: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppProxy, ProxyEndpoint};
    use crate::network::{ConnectionState, NetworkType};
    use crate::testing::{Call, CallLog, EngineCall, FakePlatform, PlatformCall, RecordingEngine};
    use std::sync::Arc;

    type Controller = VpnSessionController<RecordingEngine, FakePlatform>;

    fn test_config() -> VpnConfig {
        let mut config = VpnConfig::default();
        config.tls.enabled = false;
        config
    }

    fn controller_with(config: VpnConfig, setup: impl FnOnce(&mut RecordingEngine, &mut FakePlatform)) -> (Controller, CallLog) {
        let log = CallLog::default();
        let mut engine = RecordingEngine::with_log(log.clone());
        let mut platform = FakePlatform::with_log(log.clone());
        platform.active = Some(NetworkInfo::connected(NetworkType::Wifi));
        setup(&mut engine, &mut platform);
        let observer: ConnectivityObserver = Arc::new(|_: Option<NetworkInfo>| {});
        (VpnSessionController::new(config, engine, platform, observer), log)
    }

    fn controller() -> (Controller, CallLog) {
        controller_with(test_config(), |_, _| {})
    }

    fn engine_call(call: EngineCall) -> Call {
        Call::Engine(call)
    }

    fn platform_call(call: PlatformCall) -> Call {
        Call::Platform(call)
    }

    #[test]
    fn test_start_runs_session() {
        let (mut session, log) = controller();

        session.start().unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert!(session.connection_duration().is_some());
        assert_eq!(
            log.all(),
            vec![
                engine_call(EngineCall::ResetProxies),
                engine_call(EngineCall::SetDefaultProxy("127.0.0.1:1080".to_string())),
                platform_call(PlatformCall::Establish),
                engine_call(EngineCall::Run { fd: 10, concurrency: 2, tls: false }),
                platform_call(PlatformCall::Register),
                platform_call(PlatformCall::ShowIndicator),
            ]
        );
    }

    #[test]
    fn test_start_is_noop_when_running() {
        let (mut session, log) = controller();
        session.start().unwrap();
        log.clear();

        session.start().unwrap();

        assert!(log.all().is_empty());
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_start_without_permission() {
        let (mut session, log) = controller_with(test_config(), |_, p| p.permission = false);

        assert!(matches!(session.start(), Err(SessionError::PermissionDenied)));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(log.all().is_empty());
    }

    #[test]
    fn test_start_prepares_ca_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VpnConfig::default();
        config.resolve_paths(dir.path());
        let (mut session, log) = controller_with(config, |_, _| {});

        session.start().unwrap();

        let engine = log.engine();
        assert_eq!(engine[0], EngineCall::GenerateCerts);
        assert_eq!(engine[1], EngineCall::LoadCa);
        assert!(engine.contains(&EngineCall::Run { fd: 10, concurrency: 2, tls: true }));
    }

    #[test]
    fn test_establish_failure_leaves_stopped() {
        let (mut session, log) = controller_with(test_config(), |_, p| p.establish_fails = true);

        assert!(matches!(session.start(), Err(SessionError::TunnelEstablish(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(log.count(&platform_call(PlatformCall::Establish)), 1);
        assert!(!log.engine().iter().any(|c| matches!(c, EngineCall::Run { .. })));
        assert_eq!(log.count(&platform_call(PlatformCall::ShowIndicator)), 0);
    }

    #[test]
    fn test_engine_run_failure_closes_tunnel() {
        let (mut session, log) = controller_with(test_config(), |e, _| e.fail_on("run"));

        assert!(matches!(session.start(), Err(SessionError::Engine(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(log.count(&platform_call(PlatformCall::CloseTunnel(10))), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::Register)), 0);
    }

    #[test]
    fn test_subscription_failure_tears_down() {
        let (mut session, log) = controller_with(test_config(), |_, p| p.register_fails = true);

        assert!(matches!(session.start(), Err(SessionError::Subscription(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(log.count(&engine_call(EngineCall::Stop)), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::CloseTunnel(10))), 1);
    }

    #[test]
    fn test_stop_tears_down_in_order() {
        let (mut session, log) = controller();
        session.start().unwrap();
        log.clear();

        session.stop().unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.connection_duration().is_none());
        assert_eq!(
            log.all(),
            vec![
                platform_call(PlatformCall::Unregister),
                platform_call(PlatformCall::CloseTunnel(10)),
                engine_call(EngineCall::Stop),
                platform_call(PlatformCall::ClearIndicator),
            ]
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut session, log) = controller();

        session.stop().unwrap();
        session.start().unwrap();
        session.stop().unwrap();
        session.stop().unwrap();

        assert_eq!(log.count(&engine_call(EngineCall::Stop)), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::ClearIndicator)), 1);
    }

    #[test]
    fn test_stop_tolerates_unregister_failure() {
        let (mut session, log) = controller_with(test_config(), |_, p| p.unregister_fails = true);
        session.start().unwrap();

        session.stop().unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(log.count(&engine_call(EngineCall::Stop)), 1);
    }

    #[test]
    fn test_stop_reports_engine_failure_after_full_teardown() {
        let (mut session, log) = controller_with(test_config(), |e, _| e.fail_on("stop"));
        session.start().unwrap();

        assert!(matches!(session.stop(), Err(SessionError::Engine(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(log.count(&platform_call(PlatformCall::ClearIndicator)), 1);
    }

    #[test]
    fn test_revoke_matches_stop() {
        let (mut session, log) = controller();
        session.start().unwrap();

        session.revoke().unwrap();
        session.revoke().unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(log.count(&engine_call(EngineCall::Stop)), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::CloseTunnel(10))), 1);
    }

    #[test]
    fn test_restart_when_stopped_is_noop() {
        let (mut session, log) = controller();

        session.restart_if_running().unwrap();

        assert!(log.all().is_empty());
        assert_eq!(session.restart_count(), 0);
    }

    #[test]
    fn test_restart_cycles_tunnel_and_keeps_indicator() {
        let (mut session, log) = controller();
        session.start().unwrap();
        log.clear();

        session.restart_if_running().unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.restart_count(), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::CloseTunnel(10))), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::Establish)), 1);
        assert_eq!(log.count(&engine_call(EngineCall::Run { fd: 11, concurrency: 2, tls: false })), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::Register)), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::ShowIndicator)), 0);
        assert_eq!(log.count(&platform_call(PlatformCall::ClearIndicator)), 0);
        // CA is only prepared on start
        assert_eq!(log.count(&engine_call(EngineCall::LoadCa)), 0);
    }

    #[test]
    fn test_network_handoff_restarts_once() {
        let (mut session, log) = controller();
        session.start().unwrap();
        log.clear();

        let mobile = Some(NetworkInfo::connected(NetworkType::Mobile));
        assert_eq!(session.on_network_changed(mobile).unwrap(), ConnectivityDecision::Restart);
        assert_eq!(session.on_network_changed(mobile).unwrap(), ConnectivityDecision::SameNetworkType);

        assert_eq!(session.restart_count(), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::Establish)), 1);
        assert_eq!(session.network_snapshot(), mobile);
    }

    #[test]
    fn test_network_change_ignored_when_stopped() {
        let (mut session, _log) = controller();

        let decision = session
            .on_network_changed(Some(NetworkInfo::new(NetworkType::Mobile, ConnectionState::Connected)))
            .unwrap();

        assert_eq!(decision, ConnectivityDecision::Inactive);
    }

    #[test]
    fn test_app_proxies_applied() {
        let mut config = test_config();
        config.app_proxies = vec![AppProxy {
            package: "com.android.chrome".to_string(),
            endpoint: ProxyEndpoint {
                address: "10.0.0.5:8080".to_string(),
                ..ProxyEndpoint::default()
            },
        }];
        let (mut session, log) = controller_with(config, |_, p| {
            p.packages.insert("com.android.chrome".to_string(), 10123);
        });

        session.start().unwrap();

        assert!(log.engine().contains(&EngineCall::AddProxy(10123, "10.0.0.5:8080".to_string())));
    }

    #[test]
    fn test_drop_stops_running_session() {
        let (mut session, log) = controller();
        session.start().unwrap();

        drop(session);

        assert_eq!(log.count(&engine_call(EngineCall::Stop)), 1);
        assert_eq!(log.count(&platform_call(PlatformCall::ClearIndicator)), 1);
    }
}
