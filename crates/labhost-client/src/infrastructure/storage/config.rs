//! TOML-based configuration for the `labhost` client.
//!
//! The file lives in the platform-appropriate config directory:
//! - Windows:  `%APPDATA%\LabHost\config.toml`
//! - Linux:    `~/.config/labhost/config.toml`
//! - macOS:    `~/Library/Application Support/LabHost/config.toml`
//!
//! # Example file (for beginners)
//!
//! ```toml
//! [general]
//! log_level = "debug"
//!
//! [discovery]
//! debounce_ms = 400
//! query_delay_ms = 800
//! socket_dir = "/run/user/1000/labhost"
//!
//! [connection]
//! close_timeout_ms = 2000
//! request_timeout_ms = 5000
//!
//! [[hosts]]
//! identifier = "bench-7"
//! label = "Bench 7"
//! bridge = { type = "tcp", hostname = "bench-7.lab", port = 4443 }
//!
//! [[hosts]]
//! identifier = "desk"
//! bridge = { type = "local" }
//! ```
//!
//! Every section and every field is optional.  Missing values fall back to the
//! `default_*` helper functions below, so an empty file is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use labhost_core::HostSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Hosts saved by the user.
    #[serde(default)]
    pub hosts: Vec<HostSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// mDNS and socket-probe timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// Quiet period before service listeners are notified.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long `get_services` waits for answers after querying.
    #[serde(default = "default_query_delay_ms")]
    pub query_delay_ms: u64,
    /// Directory holding `<identifier>.sock` files.  Unset means the
    /// per-user runtime directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
    /// Upper bound on probing all local sockets.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// How long `close` waits for the peer before dropping the socket.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Per-request deadline.  Unset means requests wait until the connection
    /// closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_debounce_ms() -> u64 {
    400
}
fn default_query_delay_ms() -> u64 {
    800
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_close_timeout_ms() -> u64 {
    2000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { log_level: default_log_level() }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            query_delay_ms: default_query_delay_ms(),
            socket_dir: None,
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            close_timeout_ms: default_close_timeout_ms(),
            request_timeout_ms: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn query_delay(&self) -> Duration {
        Duration::from_millis(self.query_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl ConnectionConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Inserts `settings`, replacing any saved host with the same identifier.
    pub fn upsert_host(&mut self, settings: HostSettings) {
        match self.hosts.iter_mut().find(|h| h.identifier == settings.identifier) {
            Some(existing) => *existing = settings,
            None => self.hosts.push(settings),
        }
    }

    /// Removes the saved host `identifier`.  Returns `false` if it was unknown.
    pub fn remove_host(&mut self, identifier: &str) -> bool {
        let before = self.hosts.len();
        self.hosts.retain(|h| h.identifier != identifier);
        self.hosts.len() != before
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the default location.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to the default location.
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating the parent directory if needed.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the `LabHost` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("LabHost"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("labhost"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("LabHost"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
