//! VPN Configuration
//!
//! Interface parameters, app filtering and proxy endpoints for one VPN
//! session, loadable from TOML.

use crate::engine::CaPaths;
use crate::proxy::ProxyKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Smallest MTU accepted for an interface carrying IPv6
const MIN_MTU: u16 = 1280;

/// Address with prefix length, written as "addr/prefix"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpNetwork {
    /// Network or host address
    pub addr: IpAddr,
    /// Prefix length in bits
    pub prefix: u8,
}

impl IpNetwork {
    /// Create a network, checking the prefix against the address family
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(ConfigError::InvalidNetwork(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    /// 0.0.0.0/0
    pub fn ipv4_default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    /// ::/0
    pub fn ipv6_default() -> Self {
        Self {
            addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix: 0,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidNetwork(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for IpNetwork {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpNetwork> for String {
    fn from(network: IpNetwork) -> Self {
        network.to_string()
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Tunnel interface parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Addresses assigned to the interface
    pub addresses: Vec<IpNetwork>,
    /// Routes captured by the tunnel
    pub routes: Vec<IpNetwork>,
    /// Interface MTU
    pub mtu: u16,
    /// DNS servers pushed to the interface (none by default)
    pub dns_servers: Vec<IpAddr>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            // fc00::1/7 is a unique-local address; only the engine sees it
            addresses: vec![IpNetwork {
                addr: IpAddr::V6(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 1)),
                prefix: 7,
            }],
            routes: vec![IpNetwork::ipv4_default(), IpNetwork::ipv6_default()],
            mtu: 10240,
            dns_servers: Vec::new(),
        }
    }
}

/// Which applications the tunnel captures
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "packages", rename_all = "lowercase")]
pub enum AppFilter {
    /// Every application
    #[default]
    All,
    /// Only the listed applications
    Allow(Vec<String>),
    /// Everything except the listed applications
    Disallow(Vec<String>),
}

/// Identity/token pair carried in the proxy credential header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub identity: String,
    pub token: String,
}

/// Upstream proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyEndpoint {
    /// "host:port"
    pub address: String,
    /// Proxy protocol
    pub kind: ProxyKind,
    /// Proxy username (may be empty)
    pub username: String,
    /// Proxy password (may be empty)
    pub password: String,
    /// Optional credential header source
    pub auth: Option<ProxyAuth>,
}

impl Default for ProxyEndpoint {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:1080".to_string(),
            kind: ProxyKind::Socks,
            username: String::new(),
            password: String::new(),
            auth: None,
        }
    }
}

/// Proxy dedicated to one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProxy {
    /// Application package identity
    pub package: String,
    #[serde(flatten)]
    pub endpoint: ProxyEndpoint,
}

/// Engine CA material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Load a CA into the engine on start
    pub enabled: bool,
    /// PEM certificate
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: PathBuf::from("self_cert.pem"),
            key_path: PathBuf::from("self_cert.key"),
        }
    }
}

impl TlsConfig {
    /// CA paths when TLS is enabled
    pub fn ca_paths(&self) -> Option<CaPaths> {
        self.enabled.then(|| CaPaths {
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
        })
    }
}

/// Complete VPN configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Session name shown by the platform
    pub session_name: String,
    /// Tunnel interface
    pub interface: InterfaceConfig,
    /// Application capture filter
    pub app_filter: AppFilter,
    /// Proxy for applications without a dedicated one
    pub default_proxy: ProxyEndpoint,
    /// Per-application proxies
    pub app_proxies: Vec<AppProxy>,
    /// Engine worker concurrency
    pub concurrency: usize,
    /// Engine CA
    pub tls: TlsConfig,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            session_name: "Locker".to_string(),
            interface: InterfaceConfig::default(),
            app_filter: AppFilter::All,
            default_proxy: ProxyEndpoint::default(),
            app_proxies: Vec::new(),
            concurrency: 2,
            tls: TlsConfig::default(),
        }
    }
}

impl VpnConfig {
    /// Parse from a TOML string
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Make relative CA paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [&mut self.tls.cert_path, &mut self.tls.key_path] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.trim().is_empty() {
            return Err(ConfigError::EmptySessionName);
        }
        if self.interface.addresses.is_empty() {
            return Err(ConfigError::NoAddresses);
        }
        if self.interface.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        if self.interface.mtu < MIN_MTU {
            return Err(ConfigError::MtuTooLow(self.interface.mtu));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }

        check_proxy_address(&self.default_proxy.address)?;

        let mut seen = HashSet::new();
        for app in &self.app_proxies {
            if !seen.insert(app.package.as_str()) {
                return Err(ConfigError::DuplicateAppProxy(app.package.clone()));
            }
            check_proxy_address(&app.endpoint.address)?;
        }

        if self.tls.enabled
            && (self.tls.cert_path.as_os_str().is_empty() || self.tls.key_path.as_os_str().is_empty())
        {
            return Err(ConfigError::MissingCaPath);
        }
        Ok(())
    }
}

/// Accepts "host:port" and "[v6]:port" with a non-zero port.
fn check_proxy_address(address: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidProxyAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host == "[]" {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Session name is empty")]
    EmptySessionName,

    #[error("Interface needs at least one address")]
    NoAddresses,

    #[error("Interface needs at least one route")]
    NoRoutes,

    #[error("MTU {0} too low (minimum 1280)")]
    MtuTooLow(u16),

    #[error("Engine concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Duplicate proxy for package {0}")]
    DuplicateAppProxy(String),

    #[error("TLS enabled without certificate or key path")]
    MissingCaPath,

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
