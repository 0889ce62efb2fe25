//! Locker host binary
//!
//! Initializes the allocator and logging, loads configuration and runs
//! either the interactive session or a one-shot filter command.

mod cli;
mod config;
mod dry_run;
mod shell;

use anyhow::Result;
use clap::Parser;
use cli::{Args, Command};
use config::AppConfig;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .compact()
        .init();

    let config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Run => {
            info!("Locker starting...");
            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            let result = runtime.block_on(shell::run(config));
            // A pending stdin read would otherwise keep the runtime alive
            runtime.shutdown_timeout(Duration::from_millis(200));
            result?;
            info!("Locker shutting down");
        }
        Command::Import { file } => cli::import(&config, &file)?,
        Command::Compile { archive, out } => cli::compile(&config, &archive, out.as_deref())?,
        Command::Inspect { index } => cli::inspect(&index)?,
    }
    Ok(())
}
