//! Session command dispatch.
//!
//! Every lifecycle trigger (user start/stop, platform revoke, connectivity
//! notifications) becomes a [`SessionCommand`] on one channel, and a single
//! dispatcher thread applies them to the controller in arrival order.

use crate::connectivity::{ConnectivityDecision, ConnectivityObserver};
use crate::engine::Engine;
use crate::network::NetworkInfo;
use crate::platform::Platform;
use crate::session::{SessionError, SessionState, VpnSessionController};
use crossbeam_channel::{Receiver, Sender, unbounded};
use locker_tasks::TaskPool;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Commands accepted by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Start request from the given package
    Start { package: String },
    /// Stop request from the given package
    Stop { package: String },
    RestartIfRunning,
    /// Platform revoked the tunnel
    Revoked,
    /// Connectivity notification with the current active network
    NetworkChanged(Option<NetworkInfo>),
    /// Stop the session and end the dispatch loop
    Shutdown,
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::RestartIfRunning => "restart",
            Self::Revoked => "revoke",
            Self::NetworkChanged(_) => "network-changed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub command: &'static str,
    /// State after the command
    pub state: SessionState,
    /// Set for network-change commands
    pub decision: Option<ConnectivityDecision>,
    pub error: Option<String>,
}

/// Create the command channel.
pub fn command_channel() -> (Sender<SessionCommand>, Receiver<SessionCommand>) {
    unbounded()
}

/// Observer that forwards notifications into the command channel.
pub fn connectivity_observer(commands: Sender<SessionCommand>) -> ConnectivityObserver {
    Arc::new(move |info| {
        if commands.send(SessionCommand::NetworkChanged(info)).is_err() {
            debug!("Dispatcher gone, dropping network notification");
        }
    })
}

/// Run after a stop request, once background jobs are cancelled
pub type StopHook = Box<dyn FnMut() + Send>;

/// Applies [`SessionCommand`]s to a controller.
pub struct Dispatcher<E: Engine, P: Platform> {
    controller: VpnSessionController<E, P>,
    commands: Receiver<SessionCommand>,
    /// In-flight filter jobs are cancelled on stop and revoke
    tasks: Option<TaskPool>,
    reports: Option<Sender<SessionReport>>,
    on_stop: Option<StopHook>,
    /// Packages allowed to start/stop; empty allows any
    trusted_packages: Vec<String>,
}

impl<E: Engine, P: Platform> Dispatcher<E, P> {
    pub fn new(controller: VpnSessionController<E, P>, commands: Receiver<SessionCommand>) -> Self {
        Self {
            controller,
            commands,
            tasks: None,
            reports: None,
            on_stop: None,
            trusted_packages: Vec::new(),
        }
    }

    pub fn with_task_pool(mut self, pool: TaskPool) -> Self {
        self.tasks = Some(pool);
        self
    }

    pub fn with_reports(mut self, reports: Sender<SessionReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Call `hook` on every accepted stop request, after in-flight jobs
    /// were cancelled and the session stopped.
    pub fn with_stop_hook(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn with_trusted_packages(mut self, packages: Vec<String>) -> Self {
        self.trusted_packages = packages;
        self
    }

    pub fn controller(&self) -> &VpnSessionController<E, P> {
        &self.controller
    }

    /// Apply one command.
    pub fn handle(&mut self, command: SessionCommand) -> ControlFlow<()> {
        let name = command.name();
        let mut decision = None;

        let result: Result<(), String> = match command {
            SessionCommand::Start { package } => match self.check_caller(&package) {
                Ok(()) => self.controller.start().map_err(describe),
                Err(e) => Err(e),
            },
            SessionCommand::Stop { package } => match self.check_caller(&package) {
                Ok(()) => {
                    self.cancel_tasks();
                    let result = self.controller.stop().map_err(describe);
                    if let Some(hook) = self.on_stop.as_mut() {
                        hook();
                    }
                    result
                }
                Err(e) => Err(e),
            },
            SessionCommand::RestartIfRunning => self.controller.restart_if_running().map_err(describe),
            SessionCommand::Revoked => {
                self.cancel_tasks();
                self.controller.revoke().map_err(describe)
            }
            SessionCommand::NetworkChanged(info) => match self.controller.on_network_changed(info) {
                Ok(d) => {
                    decision = Some(d);
                    Ok(())
                }
                Err(e) => Err(describe(e)),
            },
            SessionCommand::Shutdown => {
                info!("Session dispatcher shutting down");
                self.cancel_tasks();
                let result = self.controller.stop().map_err(describe);
                self.report(name, decision, result);
                return ControlFlow::Break(());
            }
        };

        self.report(name, decision, result);
        ControlFlow::Continue(())
    }

    /// Process commands until [`SessionCommand::Shutdown`] or every sender
    /// is dropped. Returns the controller, stopped.
    pub fn run(mut self) -> VpnSessionController<E, P> {
        info!("Session dispatcher started");

        while let Ok(command) = self.commands.recv() {
            debug!("Dispatching {:?}", command);
            if self.handle(command).is_break() {
                break;
            }
        }

        if self.controller.state() != SessionState::Stopped {
            if let Err(e) = self.controller.stop() {
                warn!("Stop at dispatcher exit failed: {}", e);
            }
        }
        self.controller
    }

    /// Run the dispatch loop on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<VpnSessionController<E, P>>>
    where
        E: 'static,
        P: 'static,
    {
        thread::Builder::new()
            .name("session-dispatch".to_string())
            .spawn(move || self.run())
    }

    fn check_caller(&self, package: &str) -> Result<(), String> {
        if self.trusted_packages.is_empty() || self.trusted_packages.iter().any(|p| p == package) {
            debug!("Command from {}", package);
            Ok(())
        } else {
            warn!("Ignoring command from untrusted package {}", package);
            Err(format!("package {} is not trusted", package))
        }
    }

    fn cancel_tasks(&self) {
        if let Some(pool) = &self.tasks {
            let cancelled = pool.cancel_all();
            if cancelled > 0 {
                info!("Cancelled {} background task(s)", cancelled);
            }
        }
    }

    fn report(&self, command: &'static str, decision: Option<ConnectivityDecision>, result: Result<(), String>) {
        if let Err(e) = &result {
            warn!("Command {} failed: {}", command, e);
        }
        if let Some(reports) = &self.reports {
            let _ = reports.send(SessionReport {
                command,
                state: self.controller.state(),
                decision,
                error: result.err(),
            });
        }
    }
}

fn describe(e: SessionError) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VpnConfig;
    use crate::network::NetworkType;
    use crate::testing::{Call, CallLog, EngineCall, FakePlatform, PlatformCall, RecordingEngine, notify};
    use locker_tasks::{PoolConfig, TaskError, TaskEvent};
    use std::time::Duration;

    fn setup() -> (
        Dispatcher<RecordingEngine, FakePlatform>,
        Sender<SessionCommand>,
        Receiver<SessionReport>,
        CallLog,
        crate::testing::Observers,
    ) {
        let log = CallLog::default();
        let engine = RecordingEngine::with_log(log.clone());
        let mut platform = FakePlatform::with_log(log.clone());
        platform.active = Some(NetworkInfo::connected(NetworkType::Wifi));
        let observers = platform.observers();

        let mut config = VpnConfig::default();
        config.tls.enabled = false;

        let (tx, rx) = command_channel();
        let controller = VpnSessionController::new(config, engine, platform, connectivity_observer(tx.clone()));
        let (report_tx, report_rx) = unbounded();
        let dispatcher = Dispatcher::new(controller, rx).with_reports(report_tx);
        (dispatcher, tx, report_rx, log, observers)
    }

    fn start() -> SessionCommand {
        SessionCommand::Start {
            package: "org.locker.app".to_string(),
        }
    }

    fn next_report(reports: &Receiver<SessionReport>) -> SessionReport {
        reports.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_commands_drive_controller() {
        let (mut dispatcher, _tx, reports, log, _observers) = setup();

        assert!(dispatcher.handle(start()).is_continue());
        assert_eq!(next_report(&reports).state, SessionState::Running);

        assert!(dispatcher.handle(SessionCommand::Revoked).is_continue());
        let report = next_report(&reports);
        assert_eq!(report.command, "revoke");
        assert_eq!(report.state, SessionState::Stopped);
        assert!(report.error.is_none());
        assert_eq!(log.count(&Call::Engine(EngineCall::Stop)), 1);
    }

    #[test]
    fn test_untrusted_package_rejected() {
        let (dispatcher, _tx, reports, log, _observers) = setup();
        let mut dispatcher = dispatcher.with_trusted_packages(vec!["org.locker.ui".to_string()]);

        dispatcher.handle(start());

        let report = next_report(&reports);
        assert_eq!(report.state, SessionState::Stopped);
        assert!(report.error.unwrap().contains("not trusted"));
        assert!(log.all().is_empty());
    }

    #[test]
    fn test_network_notification_restarts_via_channel() {
        let (dispatcher, tx, reports, log, observers) = setup();
        let handle = dispatcher.spawn().unwrap();

        tx.send(start()).unwrap();
        assert_eq!(next_report(&reports).state, SessionState::Running);

        notify(&observers, Some(NetworkInfo::connected(NetworkType::Mobile)));
        let report = next_report(&reports);
        assert_eq!(report.command, "network-changed");
        assert_eq!(report.decision, Some(ConnectivityDecision::Restart));
        assert_eq!(report.state, SessionState::Running);

        tx.send(SessionCommand::Shutdown).unwrap();
        let controller = handle.join().unwrap();

        assert_eq!(controller.state(), SessionState::Stopped);
        assert_eq!(controller.restart_count(), 1);
        assert_eq!(log.count(&Call::Platform(PlatformCall::Establish)), 2);
        // The subscription from the restart was released at shutdown
        assert!(observers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stop_cancels_background_tasks() {
        let (dispatcher, _tx, reports, _log, _observers) = setup();
        let (pool, events) = TaskPool::new(PoolConfig::default());
        let mut dispatcher = dispatcher.with_task_pool(pool.clone());

        let id = pool
            .submit("long-import", |ctx| {
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(TaskError::Cancelled)
            })
            .unwrap();

        dispatcher.handle(start());
        next_report(&reports);
        dispatcher.handle(SessionCommand::Stop {
            package: "org.locker.app".to_string(),
        });
        next_report(&reports);

        let cancelled = events
            .iter()
            .find(|e| e.is_terminal())
            .unwrap();
        assert_eq!(cancelled, TaskEvent::Cancelled { task_id: id });
    }

    #[test]
    fn test_stop_hook_runs_after_cancellation() {
        let (dispatcher, _tx, reports, _log, _observers) = setup();
        let (pool, _events) = TaskPool::new(PoolConfig::default());
        let (started_tx, started_rx) = unbounded();
        let token_slot = Arc::new(std::sync::Mutex::new(None));
        let slot = token_slot.clone();
        pool.submit("long-install", move |ctx| {
            *slot.lock().unwrap() = Some(ctx.token().clone());
            started_tx.send(()).unwrap();
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(TaskError::Cancelled)
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (hook_tx, hook_rx) = unbounded();
        let seen = token_slot.clone();
        let mut dispatcher = dispatcher.with_task_pool(pool).with_stop_hook(move || {
            let cancelled = seen.lock().unwrap().as_ref().is_some_and(|t| t.is_cancelled());
            hook_tx.send(cancelled).unwrap();
        });

        dispatcher.handle(SessionCommand::Revoked);
        next_report(&reports);
        assert!(hook_rx.try_recv().is_err());

        dispatcher.handle(SessionCommand::Stop {
            package: "org.locker.app".to_string(),
        });
        next_report(&reports);
        assert_eq!(hook_rx.try_recv(), Ok(true));
    }
}
