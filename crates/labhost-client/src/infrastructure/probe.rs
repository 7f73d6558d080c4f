//! UNIX-socket prober.
//!
//! Hosts started on this machine listen on `<identifier>.sock` inside one
//! well-known directory.  A socket file can outlive its host (crash, kill -9),
//! so a file alone proves nothing: each candidate is opened and must complete
//! the `initialize`/`state` handshake before it counts as live.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::application::host_search::SocketProber;
use crate::application::protocol_client::{Handshake, ProtocolClient};
use crate::infrastructure::transport::{OpenOptions, Transport, TransportError};

const SOCKET_EXTENSION: &str = "sock";

/// Why a probe failed.  Only logged; the aggregator sees a plain "not live".
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not connect: {0}")]
    Connect(#[from] TransportError),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Default socket directory: `$XDG_RUNTIME_DIR/labhost`, else `<tmp>/labhost`.
pub fn default_socket_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("labhost")
}

/// Path of the socket a host with `identifier` listens on.
pub fn socket_path(dir: &Path, identifier: &str) -> PathBuf {
    dir.join(format!("{identifier}.{SOCKET_EXTENSION}"))
}

/// Probes `<identifier>.sock` files in one directory.
#[derive(Debug, Clone)]
pub struct UnixSocketProber {
    dir: PathBuf,
    close_timeout: Duration,
}

impl UnixSocketProber {
    pub fn new(dir: impl Into<PathBuf>, close_timeout: Duration) -> Self {
        Self { dir: dir.into(), close_timeout }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens `path`, runs the handshake and closes again.  No requests are sent.
    pub async fn check(&self, path: &Path) -> Result<String, ProbeError> {
        let transport =
            Transport::open(OpenOptions::unix(path).with_close_timeout(self.close_timeout)).await?;
        let client = ProtocolClient::new(transport);

        let outcome = client.initialize().await;
        client.close().await;

        match outcome {
            Ok(Handshake::Accepted(info)) => Ok(info.identifier),
            Ok(Handshake::Rejected(reason)) => Err(ProbeError::Handshake(reason.to_string())),
            Err(e) => Err(ProbeError::Handshake(e.to_string())),
        }
    }
}

#[async_trait]
impl SocketProber for UnixSocketProber {
    async fn candidates(&self) -> Vec<(String, PathBuf)> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("cannot list socket directory {}: {e}", self.dir.display());
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(SOCKET_EXTENSION) {
                        continue;
                    }
                    if let Some(identifier) = path.file_stem().and_then(|s| s.to_str()) {
                        found.push((identifier.to_string(), path.clone()));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("error while listing {}: {e}", self.dir.display());
                    break;
                }
            }
        }

        found.sort();
        found
    }

    async fn probe(&self, path: &Path) -> bool {
        match self.check(path).await {
            Ok(identifier) => {
                debug!(%identifier, "host answered on {}", path.display());
                true
            }
            Err(e) => {
                debug!("{} is not live: {e}", path.display());
                false
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("labhost-probe-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_socket_path_appends_extension() {
        assert_eq!(
            socket_path(Path::new("/run/labhost"), "bench-1"),
            PathBuf::from("/run/labhost/bench-1.sock")
        );
    }

    #[test]
    fn test_default_socket_dir_ends_with_labhost() {
        assert!(default_socket_dir().ends_with("labhost"));
    }

    #[tokio::test]
    async fn test_candidates_lists_only_sock_files() {
        // Arrange
        let dir = temp_dir();
        std::fs::write(dir.join("bench-1.sock"), b"").unwrap();
        std::fs::write(dir.join("bench-2.sock"), b"").unwrap();
        std::fs::write(dir.join("notes.txt"), b"").unwrap();
        let prober = UnixSocketProber::new(&dir, Duration::from_millis(100));

        // Act
        let found = prober.candidates().await;

        // Assert
        let ids: Vec<_> = found.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["bench-1", "bench-2"]);
        assert_eq!(found[0].1, dir.join("bench-1.sock"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_yields_no_candidates() {
        let prober = UnixSocketProber::new("/nonexistent/labhost-test-dir", Duration::from_millis(100));
        assert!(prober.candidates().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_socket_file_is_not_live() {
        // Arrange – a regular file named like a socket
        let dir = temp_dir();
        let path = dir.join("ghost.sock");
        std::fs::write(&path, b"").unwrap();
        let prober = UnixSocketProber::new(&dir, Duration::from_millis(100));

        // Act
        let live = prober.probe(&path).await;

        // Assert
        assert!(!live);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
