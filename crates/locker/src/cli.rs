//! Command-line surface and the one-shot subcommands.

use crate::config::AppConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use locker_filter::{BlocklistImporter, CompiledIndex, DomainStore, INDEX_FILE, SledDomainStore};
use locker_tasks::CancelToken;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Locker - per-device VPN with domain and content filtering
#[derive(Parser, Debug)]
#[command(name = "locker")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Config file (defaults: /etc/locker, user config dir, current dir)
    #[arg(short, long, env = "LOCKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive session with a dry-run engine
    Run,

    /// Import a newline-delimited domain list into the store
    Import {
        /// Domain list, one per line
        file: PathBuf,
    },

    /// Parse and build a rules archive, then save the index
    Compile {
        /// Zip archive of .rules / .triggers files
        archive: PathBuf,

        /// Output index (default: <files_dir>/rules.bin)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Load a saved index and print its counts
    Inspect {
        /// Index file written by `compile` or `save`
        index: PathBuf,
    },
}

pub fn import(config: &AppConfig, file: &Path) -> Result<()> {
    let mut store = SledDomainStore::open(&config.files_dir).context("opening domain store")?;
    let importer = BlocklistImporter::new(Duration::from_millis(config.progress_interval_ms));

    let summary = importer
        .import_file(file, &mut store, &CancelToken::new(), |n| info!("{} domains staged", n))
        .with_context(|| format!("importing {}", file.display()))?;

    println!(
        "imported {} domains in {:?} ({} blank lines); store now holds {}",
        summary.inserted,
        summary.elapsed,
        summary.skipped,
        store.len()?
    );
    Ok(())
}

pub fn compile(config: &AppConfig, archive: &Path, out: Option<&Path>) -> Result<()> {
    let mut index = CompiledIndex::new();
    let stats = index
        .parse_rules_zip_archive(archive, None)
        .with_context(|| format!("parsing {}", archive.display()))?;
    index.build();

    let out = match out {
        Some(path) => path.to_path_buf(),
        None => {
            std::fs::create_dir_all(&config.files_dir)?;
            config.files_dir.join(INDEX_FILE)
        }
    };
    let size = index.save_to_file(&out)?;

    println!(
        "{}: {} rules, {} phrases ({} invalid lines, {} skipped entries) -> {} ({} bytes)",
        archive.display(),
        index.rules_count()?,
        index.phrases_count()?,
        stats.invalid_lines,
        stats.skipped_entries,
        out.display(),
        size
    );
    Ok(())
}

pub fn inspect(path: &Path) -> Result<()> {
    let mut index = CompiledIndex::load_from_file(path).with_context(|| format!("loading {}", path.display()))?;
    index.build();

    println!("{}", path.display());
    println!("  rules:      {}", index.rules_count()?);
    println!("  phrases:    {}", index.phrases_count()?);
    println!(
        "  block page: {}",
        index.block_page().map_or("none".to_string(), |html| format!("{} bytes", html.len()))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_compile() {
        let args = Args::try_parse_from(["locker", "-v", "compile", "rules.zip", "--out", "x.bin"]).unwrap();
        assert!(args.verbose);
        match args.command {
            Command::Compile { archive, out } => {
                assert_eq!(archive, PathBuf::from("rules.zip"));
                assert_eq!(out, Some(PathBuf::from("x.bin")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_import_then_inspect_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            files_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let list = dir.path().join("hosts.txt");
        std::fs::write(&list, "a.com\nb.com\n").unwrap();

        import(&config, &list).unwrap();
        assert!(inspect(&dir.path().join("missing.bin")).is_err());
    }
}
