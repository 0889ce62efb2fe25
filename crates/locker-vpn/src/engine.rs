//! Packet engine boundary.
//!
//! The engine consumes the tunnel file descriptor and forwards traffic to
//! the configured proxies. It is an external component; this trait is the
//! whole surface the session controller relies on.

use crate::proxy::ProxyAssignment;
use std::path::PathBuf;

/// Tunnel file descriptor as handed to the engine.
pub type TunnelFd = i32;

/// Locations of the engine's CA certificate and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaPaths {
    /// True if both files are present.
    pub fn exist(&self) -> bool {
        self.cert_path.is_file() && self.key_path.is_file()
    }
}

/// Parameters for [`Engine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Worker concurrency
    pub concurrency: usize,
    /// CA used for TLS interception, if enabled
    pub tls: Option<CaPaths>,
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine rejected {call}: {reason}")]
    Rejected { call: &'static str, reason: String },

    #[error("Engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// External packet engine.
pub trait Engine: Send {
    /// Start processing packets from `fd`.
    fn run(&mut self, fd: TunnelFd, options: &RunOptions) -> Result<(), EngineError>;

    /// Stop processing. The tunnel is closed by the caller.
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Forget every proxy assignment.
    fn reset_proxy_servers(&mut self) -> Result<(), EngineError>;

    fn set_default_proxy(&mut self, proxy: &ProxyAssignment) -> Result<(), EngineError>;

    /// Route traffic of application `uid` through `proxy`.
    fn add_proxy_server(&mut self, uid: u32, proxy: &ProxyAssignment) -> Result<(), EngineError>;

    /// Create a CA certificate and key at `paths`.
    fn generate_certs(&mut self, paths: &CaPaths) -> Result<(), EngineError>;

    /// Load the CA at `paths` and use it for interception.
    fn load_and_set_ca(&mut self, paths: &CaPaths) -> Result<(), EngineError>;
}
