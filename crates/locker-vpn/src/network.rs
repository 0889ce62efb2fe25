//! Active network description and the last-known snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport of the active network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Mobile,
    Ethernet,
    Bluetooth,
    Other,
}

/// Connection state reported alongside the network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Suspended,
    Disconnecting,
    Disconnected,
    Unknown,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// The platform's current active network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_type: NetworkType,
    pub state: ConnectionState,
}

impl NetworkInfo {
    pub fn new(network_type: NetworkType, state: ConnectionState) -> Self {
        Self { network_type, state }
    }

    pub fn connected(network_type: NetworkType) -> Self {
        Self::new(network_type, ConnectionState::Connected)
    }
}

impl fmt::Display for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_type, self.state)
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wifi => "wifi",
            Self::Mobile => "mobile",
            Self::Ethernet => "ethernet",
            Self::Bluetooth => "bluetooth",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Suspended => "suspended",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Unrecognised network type or state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown network value: {0}")]
pub struct ParseNetworkError(String);

impl FromStr for NetworkType {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Ok(Self::Wifi),
            "mobile" | "cellular" => Ok(Self::Mobile),
            "ethernet" => Ok(Self::Ethernet),
            "bluetooth" => Ok(Self::Bluetooth),
            "other" => Ok(Self::Other),
            _ => Err(ParseNetworkError(s.to_string())),
        }
    }
}

impl FromStr for ConnectionState {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "suspended" => Ok(Self::Suspended),
            "disconnecting" => Ok(Self::Disconnecting),
            "disconnected" => Ok(Self::Disconnected),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseNetworkError(s.to_string())),
        }
    }
}

/// Last-known active network.
///
/// Only the connectivity monitor writes it, and only when it decides to
/// restart the session.
#[derive(Debug, Clone, Default)]
pub struct NetworkSnapshotTracker {
    last: Option<NetworkInfo>,
}

impl NetworkSnapshotTracker {
    pub fn new(initial: Option<NetworkInfo>) -> Self {
        Self { last: initial }
    }

    pub fn last(&self) -> Option<NetworkInfo> {
        self.last
    }

    /// True if nothing was recorded yet or the transport differs.
    pub fn is_new_type(&self, info: &NetworkInfo) -> bool {
        match self.last {
            Some(last) => last.network_type != info.network_type,
            None => true,
        }
    }

    pub fn record(&mut self, info: NetworkInfo) {
        self.last = Some(info);
    }
}
