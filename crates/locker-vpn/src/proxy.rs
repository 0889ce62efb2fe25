//! Proxy assignment building.
//!
//! Turns a [`VpnConfig`] into the per-session description handed to the
//! platform (interface parameters, app filter) and to the engine (proxy
//! assignments). Pure: no engine or platform side effects.

use crate::config::{AppFilter, ConfigError, InterfaceConfig, ProxyAuth, ProxyEndpoint, VpnConfig};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Proxy protocol understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// SOCKS5 upstream
    #[default]
    Socks,
    /// HTTP CONNECT upstream
    Http,
}

impl ProxyKind {
    /// Numeric code used by the engine boundary.
    pub fn code(self) -> i32 {
        match self {
            ProxyKind::Socks => 1,
            ProxyKind::Http => 2,
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Socks => f.write_str("socks"),
            ProxyKind::Http => f.write_str("http"),
        }
    }
}

/// Which traffic a proxy assignment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScope {
    /// Every application without a dedicated assignment
    Default,
    /// One application, by platform uid
    Application(u32),
}

/// A proxy the engine should route a scope through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAssignment {
    pub scope: ProxyScope,
    /// "host:port"
    pub address: String,
    pub kind: ProxyKind,
    /// Base64 of "identity:token", empty when unauthenticated
    pub credential_header: String,
    pub username: String,
    pub password: String,
}

impl ProxyAssignment {
    fn from_endpoint(scope: ProxyScope, endpoint: &ProxyEndpoint) -> Self {
        Self {
            scope,
            address: endpoint.address.clone(),
            kind: endpoint.kind,
            credential_header: encode_credential_header(endpoint.auth.as_ref()),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
        }
    }
}

/// Encode the proxy credential header value.
pub fn encode_credential_header(auth: Option<&ProxyAuth>) -> String {
    match auth {
        Some(auth) => STANDARD.encode(format!("{}:{}", auth.identity, auth.token)),
        None => String::new(),
    }
}

/// Maps an application package identity to its platform uid.
pub trait PackageResolver {
    fn resolve_uid(&self, package: &str) -> Option<u32>;
}

/// Everything one session setup needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub session_name: String,
    pub interface: InterfaceConfig,
    /// App filter with unresolvable packages removed
    pub app_filter: AppFilter,
    pub default_proxy: ProxyAssignment,
    pub app_proxies: Vec<ProxyAssignment>,
}

/// Builds a [`SessionConfig`] from configuration and a package resolver.
pub struct ProxyConfigBuilder<'a, R: PackageResolver + ?Sized> {
    config: &'a VpnConfig,
    resolver: &'a R,
}

impl<'a, R: PackageResolver + ?Sized> ProxyConfigBuilder<'a, R> {
    pub fn new(config: &'a VpnConfig, resolver: &'a R) -> Self {
        Self { config, resolver }
    }

    pub fn build(&self) -> Result<SessionConfig, ConfigError> {
        self.config.validate()?;

        let default_proxy = ProxyAssignment::from_endpoint(ProxyScope::Default, &self.config.default_proxy);

        let mut app_proxies = Vec::with_capacity(self.config.app_proxies.len());
        for app in &self.config.app_proxies {
            match self.resolver.resolve_uid(&app.package) {
                Some(uid) => {
                    debug!("Proxy for {} (uid {}) via {}", app.package, uid, app.endpoint.address);
                    app_proxies.push(ProxyAssignment::from_endpoint(ProxyScope::Application(uid), &app.endpoint));
                }
                None => warn!("Package {} not installed, skipping its proxy", app.package),
            }
        }

        Ok(SessionConfig {
            session_name: self.config.session_name.clone(),
            interface: self.config.interface.clone(),
            app_filter: self.resolved_filter(),
            default_proxy,
            app_proxies,
        })
    }

    fn resolved_filter(&self) -> AppFilter {
        let keep = |packages: &[String]| -> Vec<String> {
            packages
                .iter()
                .filter(|p| {
                    let found = self.resolver.resolve_uid(p).is_some();
                    if !found {
                        warn!("Package {} not installed, dropping from app filter", p);
                    }
                    found
                })
                .cloned()
                .collect()
        };

        match &self.config.app_filter {
            AppFilter::All => AppFilter::All,
            AppFilter::Allow(packages) => AppFilter::Allow(keep(packages)),
            AppFilter::Disallow(packages) => AppFilter::Disallow(keep(packages)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppProxy;
    use std::collections::HashMap;

    struct MapResolver(HashMap<&'static str, u32>);

    impl PackageResolver for MapResolver {
        fn resolve_uid(&self, package: &str) -> Option<u32> {
            self.0.get(package).copied()
        }
    }

    fn resolver() -> MapResolver {
        MapResolver(HashMap::from([("com.android.chrome", 10123), ("org.mozilla.firefox", 10200)]))
    }

    #[test]
    fn test_credential_header() {
        let auth = ProxyAuth {
            identity: "device-1".to_string(),
            token: "s3cret".to_string(),
        };
        assert_eq!(encode_credential_header(Some(&auth)), "ZGV2aWNlLTE6czNjcmV0");
        assert_eq!(encode_credential_header(None), "");
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(ProxyKind::Socks.code(), 1);
        assert_eq!(ProxyKind::Http.code(), 2);
    }

    #[test]
    fn test_build_defaults() {
        let config = VpnConfig::default();
        let session = ProxyConfigBuilder::new(&config, &resolver()).build().unwrap();

        assert_eq!(session.default_proxy.scope, ProxyScope::Default);
        assert_eq!(session.default_proxy.address, "127.0.0.1:1080");
        assert_eq!(session.default_proxy.kind, ProxyKind::Socks);
        assert!(session.default_proxy.credential_header.is_empty());
        assert!(session.app_proxies.is_empty());
        assert_eq!(session.interface.mtu, 10240);
    }

    #[test]
    fn test_app_proxy_resolution() {
        let mut config = VpnConfig::default();
        config.app_proxies = vec![
            AppProxy {
                package: "com.android.chrome".to_string(),
                endpoint: ProxyEndpoint {
                    address: "10.0.0.5:8080".to_string(),
                    kind: ProxyKind::Http,
                    username: "user".to_string(),
                    password: "pass".to_string(),
                    auth: Some(ProxyAuth {
                        identity: "id".to_string(),
                        token: "tok".to_string(),
                    }),
                },
            },
            AppProxy {
                package: "com.example.missing".to_string(),
                endpoint: ProxyEndpoint::default(),
            },
        ];

        let session = ProxyConfigBuilder::new(&config, &resolver()).build().unwrap();

        assert_eq!(session.app_proxies.len(), 1);
        let chrome = &session.app_proxies[0];
        assert_eq!(chrome.scope, ProxyScope::Application(10123));
        assert_eq!(chrome.kind, ProxyKind::Http);
        assert_eq!(chrome.credential_header, STANDARD.encode("id:tok"));
        assert_eq!(chrome.username, "user");
    }

    #[test]
    fn test_app_filter_drops_unknown_packages() {
        let mut config = VpnConfig::default();
        config.app_filter = AppFilter::Disallow(vec![
            "org.mozilla.firefox".to_string(),
            "com.example.missing".to_string(),
        ]);

        let session = ProxyConfigBuilder::new(&config, &resolver()).build().unwrap();
        assert_eq!(session.app_filter, AppFilter::Disallow(vec!["org.mozilla.firefox".to_string()]));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = VpnConfig::default();
        config.default_proxy.address = "no-port".to_string();
        assert!(ProxyConfigBuilder::new(&config, &resolver()).build().is_err());
    }
}
