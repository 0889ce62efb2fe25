//! Host configuration: VPN settings plus where filter data lives.

use anyhow::{Context, Result, bail};
use locker_vpn::VpnConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Domain store, `rules.zip` and `rules.bin`
    pub files_dir: PathBuf,
    /// Background worker threads
    pub workers: usize,
    /// Jobs that may wait for a worker
    pub queue_capacity: usize,
    /// Minimum milliseconds between import progress updates
    pub progress_interval_ms: u64,
    /// Packages allowed to start/stop the session; empty allows any
    pub trusted_packages: Vec<String>,
    /// Package name to uid table used by the host platform
    pub package_uids: BTreeMap<String, u32>,
    pub vpn: VpnConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let files_dir = dirs::data_local_dir()
            .map(|dir| dir.join("locker"))
            .unwrap_or_else(|| PathBuf::from("locker-data"));

        Self {
            files_dir,
            workers: 2,
            queue_capacity: 16,
            progress_interval_ms: 1000,
            trusted_packages: Vec::new(),
            package_uids: BTreeMap::new(),
            vpn: VpnConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `explicit` if given, else the first existing default location,
    /// else defaults. Relative CA paths are resolved against `files_dir`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => search_paths().into_iter().find(|p| p.is_file()),
        };

        let mut config = match path {
            Some(path) => {
                info!("Loading config from {}", path.display());
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        let files_dir = config.files_dir.clone();
        config.vpn.resolve_paths(&files_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        self.vpn.validate().context("invalid [vpn] section")?;
        Ok(())
    }
}

/// Default config locations, most specific last.
fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/locker").join(CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("locker").join(CONFIG_FILE));
    }
    paths.push(PathBuf::from(CONFIG_FILE));
    paths
}
