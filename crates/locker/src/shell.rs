//! Interactive host session: reads commands from stdin and drives the
//! dispatcher and filter jobs.

use crate::config::AppConfig;
use crate::dry_run::{DryRunEngine, HostNetwork, HostPlatform};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use locker_filter::{AdBlockIndexManager, BlocklistImporter, DomainStore, FilterJobs, SharedStore, SledDomainStore};
use locker_tasks::{PoolConfig, TaskEvent, TaskPool};
use locker_vpn::{
    ConnectionState, Dispatcher, NetworkInfo, NetworkType, SessionCommand, SessionReport, VpnSessionController,
    command_channel, connectivity_observer,
};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Package identity the shell issues session commands as
const SHELL_PACKAGE: &str = "locker.shell";

const HELP: &str = "\
commands:
  start | stop | restart | revoke
  net <wifi|mobile|ethernet|bluetooth|other|none> [connected|connecting|disconnected|...]
  import <file>      import a domain list into the store
  rules <zip>        install and build a rules archive
  save | load        save or load rules.bin
  bypass <on|off>    toggle filter bypass
  url <url>          test a URL against the index
  stats              index and store counts
  cancel             cancel background jobs
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Start,
    Stop,
    Restart,
    Revoke,
    Net(Option<NetworkInfo>),
    Import(PathBuf),
    Rules(PathBuf),
    Save,
    Load,
    Bypass(bool),
    Url(String),
    Stats,
    Cancel,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ShellCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();

    let command = match (verb.to_ascii_lowercase().as_str(), arg) {
        ("start", None) => ShellCommand::Start,
        ("stop", None) => ShellCommand::Stop,
        ("restart", None) => ShellCommand::Restart,
        ("revoke", None) => ShellCommand::Revoke,
        ("net", Some("none")) => ShellCommand::Net(None),
        ("net", Some(kind)) => {
            let network_type: NetworkType = kind.parse().map_err(|e| format!("{e}"))?;
            let state = match words.next() {
                Some(state) => state.parse::<ConnectionState>().map_err(|e| format!("{e}"))?,
                None => ConnectionState::Connected,
            };
            ShellCommand::Net(Some(NetworkInfo::new(network_type, state)))
        }
        ("import", Some(path)) => ShellCommand::Import(PathBuf::from(path)),
        ("rules", Some(path)) => ShellCommand::Rules(PathBuf::from(path)),
        ("save", None) => ShellCommand::Save,
        ("load", None) => ShellCommand::Load,
        ("bypass", Some("on")) => ShellCommand::Bypass(true),
        ("bypass", Some("off")) => ShellCommand::Bypass(false),
        ("url", Some(url)) => ShellCommand::Url(url.to_string()),
        ("stats", None) => ShellCommand::Stats,
        ("cancel", None) => ShellCommand::Cancel,
        ("help" | "?", None) => ShellCommand::Help,
        ("quit" | "exit", None) => ShellCommand::Quit,
        _ => return Err(format!("unrecognised command: {} (try 'help')", line.trim())),
    };
    Ok(Some(command))
}

struct Shell {
    commands: Sender<SessionCommand>,
    network: HostNetwork,
    pool: TaskPool,
    jobs: FilterJobs,
}

impl Shell {
    fn execute(&self, command: ShellCommand) -> ControlFlow<()> {
        match command {
            ShellCommand::Start => self.send(SessionCommand::Start {
                package: SHELL_PACKAGE.to_string(),
            }),
            ShellCommand::Stop => self.send(SessionCommand::Stop {
                package: SHELL_PACKAGE.to_string(),
            }),
            ShellCommand::Restart => self.send(SessionCommand::RestartIfRunning),
            ShellCommand::Revoke => self.send(SessionCommand::Revoked),
            ShellCommand::Net(info) => self.network.set_active(info),
            ShellCommand::Import(path) => print_submitted(self.jobs.submit_import(path)),
            ShellCommand::Rules(path) => print_submitted(self.jobs.submit_install_rules(path)),
            ShellCommand::Save => print_submitted(self.jobs.submit_save()),
            ShellCommand::Load => print_submitted(self.jobs.submit_load()),
            ShellCommand::Bypass(on) => {
                let index = self.jobs.index();
                let result = if on { index.enable_bypass() } else { index.disable_bypass() };
                match result {
                    Ok(()) => println!("bypass {}", if on { "on" } else { "off" }),
                    Err(e) => println!("error: {e}"),
                }
            }
            ShellCommand::Url(url) => match self.jobs.index().test_url_blocked(&url) {
                Ok(blocked) => println!("{} {}", if blocked { "BLOCK" } else { "allow" }, url),
                Err(e) => println!("error: {e}"),
            },
            ShellCommand::Stats => self.print_stats(),
            ShellCommand::Cancel => println!("cancelled {} job(s)", self.pool.cancel_all()),
            ShellCommand::Help => println!("{HELP}"),
            ShellCommand::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            warn!("Session dispatcher is gone");
        }
    }

    fn print_stats(&self) {
        match self.jobs.index().stats() {
            Ok(stats) => println!(
                "index: {} rules, {} phrases, bypass {}",
                stats.rules,
                stats.phrases,
                if stats.bypassed { "on" } else { "off" }
            ),
            Err(e) => println!("index: {e}"),
        }

        let store = self.jobs.store().lock().unwrap_or_else(|e| e.into_inner());
        match store.len() {
            Ok(len) => println!("store: {} blocked domains at {}", len, store.path().display()),
            Err(e) => println!("store: {e}"),
        }
        println!("jobs in flight: {}", self.pool.in_flight());
    }
}

fn print_submitted(result: Result<locker_tasks::TaskId, locker_tasks::PoolError>) {
    match result {
        Ok(id) => println!("submitted {id}"),
        Err(e) => println!("error: {e}"),
    }
}

/// Print task events and session reports, one thread per stream. Each
/// thread ends when its stream closes.
fn spawn_printers(
    events: Receiver<TaskEvent>,
    reports: Receiver<SessionReport>,
) -> std::io::Result<Vec<thread::JoinHandle<()>>> {
    let task_printer = thread::Builder::new().name("task-printer".to_string()).spawn(move || {
        for event in events {
            println!("[task] {event}");
        }
    })?;
    let session_printer = thread::Builder::new().name("session-printer".to_string()).spawn(move || {
        for report in reports {
            print_report(&report);
        }
    })?;
    Ok(vec![task_printer, session_printer])
}

fn print_report(report: &SessionReport) {
    match (&report.error, report.decision) {
        (Some(error), _) => println!("[session] {} failed: {} ({:?})", report.command, error, report.state),
        (None, Some(decision)) => println!("[session] {}: {:?} ({:?})", report.command, decision, report.state),
        (None, None) => println!("[session] {}: {:?}", report.command, report.state),
    }
}

/// Run the interactive session until `quit`, end of input or Ctrl-C.
pub async fn run(config: AppConfig) -> Result<()> {
    std::fs::create_dir_all(&config.files_dir)
        .with_context(|| format!("creating {}", config.files_dir.display()))?;

    let (pool, task_events) = TaskPool::new(PoolConfig {
        workers: config.workers,
        queue_capacity: config.queue_capacity,
    });

    let store: SharedStore = Arc::new(Mutex::new(
        SledDomainStore::open(&config.files_dir).context("opening domain store")?,
    ));
    let jobs = FilterJobs::new(
        pool.clone(),
        store,
        AdBlockIndexManager::new(),
        BlocklistImporter::new(Duration::from_millis(config.progress_interval_ms)),
        &config.files_dir,
    );

    let network = HostNetwork::new(Some(NetworkInfo::connected(NetworkType::Wifi)));
    let platform = HostPlatform::new(network.clone(), config.package_uids.clone());

    let (commands, command_rx) = command_channel();
    let controller = VpnSessionController::new(
        config.vpn.clone(),
        DryRunEngine::default(),
        platform,
        connectivity_observer(commands.clone()),
    );

    let (report_tx, report_rx) = unbounded();
    let index = jobs.index().clone();
    let dispatcher = Dispatcher::new(controller, command_rx)
        .with_task_pool(pool.clone())
        .with_reports(report_tx)
        .with_stop_hook(move || index.clear())
        .with_trusted_packages(config.trusted_packages.clone());
    let dispatch_handle = dispatcher.spawn().context("spawning session dispatcher")?;
    let printers = spawn_printers(task_events, report_rx).context("spawning printers")?;

    let shell = Shell {
        commands: commands.clone(),
        network,
        pool: pool.clone(),
        jobs,
    };

    info!("Locker shell ready, files in {}", config.files_dir.display());
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if shell.execute(command).is_break() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("{message}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let _ = commands.send(SessionCommand::Shutdown);
    drop(shell);
    drop(commands);

    if dispatch_handle.join().is_err() {
        warn!("Session dispatcher panicked");
    }
    pool.shutdown();
    drop(pool);
    for printer in printers {
        if printer.join().is_err() {
            warn!("Printer thread panicked");
        }
    }

    info!("Locker shell stopped");
    Ok(())
}
