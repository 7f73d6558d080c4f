//! Host environment domain entity.
//!
//! A *host* is identified by a stable string identifier that it announces in
//! its `initialize` message.  The same host may be reachable through several
//! bridges at once (a TLS socket advertised over mDNS, a UNIX socket on the
//! local machine, ...).  The aggregator collects all of them into a single
//! [`HostEnvironment`] per identifier.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One way of reaching a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bridge {
    /// TLS over TCP, advertised as `_labhost-tls._tcp.local`.
    Tls {
        hostname: Option<String>,
        address: IpAddr,
        port: u16,
        /// Lowercase hex SHA-256 fingerprint from the TXT record, used for pinning.
        fingerprint: Option<String>,
    },
    /// Plaintext websocket, advertised as `_labhost-ws._tcp.local`.
    #[serde(rename = "websocket")]
    WebSocket {
        hostname: Option<String>,
        address: IpAddr,
        port: u16,
    },
    /// UNIX domain socket on this machine.
    Unix { path: PathBuf },
}

impl Bridge {
    /// Short name of the bridge type, for listings.
    pub fn kind(&self) -> &'static str {
        match self {
            Bridge::Tls { .. } => "tls",
            Bridge::WebSocket { .. } => "websocket",
            Bridge::Unix { .. } => "unix",
        }
    }
}

impl std::fmt::Display for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bridge::Tls { address, port, .. } => write!(f, "tls://{}", std::net::SocketAddr::new(*address, *port)),
            Bridge::WebSocket { address, port, .. } => {
                write!(f, "ws://{}", std::net::SocketAddr::new(*address, *port))
            }
            Bridge::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// How a saved host is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeSettings {
    /// The host runs on this machine and is spawned by the desktop shell.
    Local,
    /// A remote host reached over TCP (optionally TLS-pinned).
    Tcp {
        hostname: String,
        port: u16,
        #[serde(default)]
        fingerprint: Option<String>,
    },
}

/// Settings saved by the user for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    pub identifier: String,
    #[serde(default)]
    pub label: Option<String>,
    pub bridge: BridgeSettings,
}

impl HostSettings {
    /// Returns `true` if the saved bridge is of type `local`.
    pub fn is_local(&self) -> bool {
        matches!(self.bridge, BridgeSettings::Local)
    }
}

/// Aggregated view of one host across every discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEnvironment {
    pub identifier: String,
    pub bridges: Vec<Bridge>,
    pub host_settings: Option<HostSettings>,
    pub label: Option<String>,
}

impl HostEnvironment {
    /// Creates an environment with no bridges, settings or label.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            bridges: Vec::new(),
            host_settings: None,
            label: None,
        }
    }

    /// Creates the record for a saved host: no bridges, the stored label.
    pub fn from_settings(settings: HostSettings) -> Self {
        Self {
            identifier: settings.identifier.clone(),
            bridges: Vec::new(),
            label: settings.label.clone(),
            host_settings: Some(settings),
        }
    }

    /// Appends a bridge unless an identical one is already listed.
    pub fn add_bridge(&mut self, bridge: Bridge) {
        if !self.bridges.contains(&bridge) {
            self.bridges.push(bridge);
        }
    }

    /// The label to show: the explicit label, or the identifier.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.identifier)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
