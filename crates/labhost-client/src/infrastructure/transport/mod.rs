//! Stream transport: a byte pipe to one host over TCP, TLS or a UNIX socket.
//!
//! # Receive model
//!
//! A background task reads the socket and appends whatever arrives to an
//! accumulator.  [`Transport::recv`] waits until the accumulator is non-empty
//! and hands back *everything* collected so far as one chunk.  Only one
//! `recv()` may be outstanding at a time; chunk boundaries carry no meaning
//! and the framing layer above reassembles lines from them.
//!
//! # Failure classification
//!
//! Connection problems a user can act on map to a [`FailureReason`] through
//! [`TransportError::reason`]; everything else is an ordinary I/O error.

pub mod tls;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use labhost_core::protocol::framing::ChunkSource;
use labhost_core::protocol::messages::FailureReason;
use labhost_core::{Bridge, BridgeSettings, HostEnvironment};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::application::protocol_client::MessageChannel;

/// Default bound on how long [`Transport::close`] waits for the peer.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUFFER_SIZE: usize = 16 * 1024;

// ── Options and results ───────────────────────────────────────────────────────

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

/// TLS trust policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Require the chain to be authorized by the web-PKI roots.
    pub server_certificate_check: bool,
    /// Require the certificate's SHA-256 fingerprint to equal this value.
    pub server_certificate_fingerprint: Option<String>,
}

/// Everything needed to open a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub address: Address,
    pub tls: Option<TlsOptions>,
    pub close_timeout: Duration,
}

impl OpenOptions {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            address: Address::Tcp { host: host.into(), port },
            tls: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            address: Address::Unix { path: path.into() },
            tls: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Builds options for a discovered bridge.
    ///
    /// TLS bridges pin the advertised fingerprint when there is one.
    /// Returns `None` for bridge types this transport cannot speak.
    pub fn for_bridge(bridge: &Bridge) -> Option<Self> {
        match bridge {
            Bridge::Tls { address, port, fingerprint, .. } => {
                Some(Self::tcp(address.to_string(), *port).with_tls(TlsOptions {
                    server_certificate_check: false,
                    server_certificate_fingerprint: fingerprint.clone(),
                }))
            }
            Bridge::Unix { path } => Some(Self::unix(path.clone())),
            Bridge::WebSocket { .. } => None,
        }
    }

    /// Builds options for a saved remote host.
    ///
    /// A saved fingerprint is pinned; without one the web-PKI check is
    /// required instead.  Returns `None` for `local` settings.
    pub fn for_settings(settings: &BridgeSettings) -> Option<Self> {
        match settings {
            BridgeSettings::Tcp { hostname, port, fingerprint } => {
                Some(Self::tcp(hostname.clone(), *port).with_tls(TlsOptions {
                    server_certificate_check: fingerprint.is_none(),
                    server_certificate_fingerprint: fingerprint.clone(),
                }))
            }
            BridgeSettings::Local => None,
        }
    }
}

/// Every way of opening `host`, most local first: UNIX sockets, then saved
/// remote settings, then advertised TLS bridges.
pub fn connection_plan(host: &HostEnvironment, close_timeout: Duration) -> Vec<OpenOptions> {
    let unix = host.bridges.iter().filter(|b| matches!(b, Bridge::Unix { .. }));
    let remote = host.bridges.iter().filter(|b| !matches!(b, Bridge::Unix { .. }));

    let mut plan: Vec<OpenOptions> = unix.filter_map(OpenOptions::for_bridge).collect();
    if let Some(settings) = &host.host_settings {
        plan.extend(OpenOptions::for_settings(&settings.bridge));
    }
    plan.extend(remote.filter_map(OpenOptions::for_bridge));

    plan.into_iter().map(|o| o.with_close_timeout(close_timeout)).collect()
}

/// Certificate details of an established (or rejected) TLS session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// DER encoding of the peer's end-entity certificate.
    pub certificate: Vec<u8>,
    /// Lowercase hex SHA-256 of `certificate`.
    pub fingerprint: String,
    /// Whether the web-PKI roots authorized the chain.
    pub trusted: bool,
}

/// Errors that can occur while opening or using a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing is listening at the address, or the socket file is missing.
    #[error("connection to {target} refused: {source}")]
    Refused {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The address cannot be used (port 0, empty host, bad server name, ...).
    #[error("invalid connection parameters: {0}")]
    InvalidParameters(String),

    /// Certificate checking was requested and the chain is not trusted.
    #[error("server certificate {} is not trusted", info.fingerprint)]
    UntrustedServer { info: TlsInfo },

    /// The certificate does not match the pinned fingerprint.
    #[error("server certificate {} does not match pinned fingerprint {expected}", info.fingerprint)]
    FingerprintMismatch { expected: String, info: TlsInfo },

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(#[source] io::Error),

    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    /// `recv()` was called while another `recv()` was still waiting.
    #[error("a receive is already pending on this connection")]
    RecvPending,
}

impl TransportError {
    /// The typed failure reason, for errors a caller can act on.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            TransportError::Refused { .. } => Some(FailureReason::Refused),
            TransportError::InvalidParameters(_) => Some(FailureReason::InvalidParameters),
            TransportError::UntrustedServer { .. } => Some(FailureReason::UntrustedServer),
            TransportError::FingerprintMismatch { .. } => Some(FailureReason::FingerprintMismatch),
            TransportError::Tls(_) | TransportError::Io(_) | TransportError::RecvPending => None,
        }
    }

    /// Certificate details attached to a TLS policy failure.
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        match self {
            TransportError::UntrustedServer { info } | TransportError::FingerprintMismatch { info, .. } => {
                Some(info)
            }
            _ => None,
        }
    }
}

/// Maps a connect error to the failure categories callers can act on.
fn classify_connect_error(target: &Address, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
            TransportError::Refused { target: target.to_string(), source: e }
        }
        io::ErrorKind::InvalidInput | io::ErrorKind::AddrNotAvailable => {
            TransportError::InvalidParameters(format!("{target}: {e}"))
        }
        _ => TransportError::Io(e),
    }
}

// ── Receive buffer ────────────────────────────────────────────────────────────

#[derive(Default)]
struct InboundState {
    buffer: Vec<u8>,
    ended: bool,
}

/// Shared between the reader task and `recv()`.
#[derive(Default)]
struct Inbound {
    state: Mutex<InboundState>,
    arrived: Notify,
}

impl Inbound {
    fn lock(&self) -> MutexGuard<'_, InboundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, bytes: &[u8]) {
        self.lock().buffer.extend_from_slice(bytes);
        self.arrived.notify_one();
    }

    fn end(&self) {
        self.lock().ended = true;
        self.arrived.notify_one();
    }
}

/// Clears the "receive pending" flag when `recv()` returns or is cancelled.
struct PendingGuard<'a>(&'a AtomicBool);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ── Transport ─────────────────────────────────────────────────────────────────

/// An open connection to a host.
pub struct Transport {
    peer: String,
    inbound: Arc<Inbound>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    recv_pending: AtomicBool,
    closed_by_caller: Arc<AtomicBool>,
    tls_info: Option<TlsInfo>,
    close_timeout: Duration,
}

impl Transport {
    /// Connects according to `options`.
    pub async fn open(options: OpenOptions) -> Result<Self, TransportError> {
        match &options.address {
            Address::Tcp { host, port } => {
                if host.is_empty() {
                    return Err(TransportError::InvalidParameters("empty host".to_string()));
                }
                if *port == 0 {
                    return Err(TransportError::InvalidParameters("port 0".to_string()));
                }

                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| classify_connect_error(&options.address, e))?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("could not disable Nagle on {}: {e}", options.address);
                }

                match &options.tls {
                    None => {
                        info!("connected to {}", options.address);
                        Ok(Self::wrap(stream, options.address.to_string(), None, options.close_timeout))
                    }
                    Some(tls_options) => {
                        let (stream, tls_info) = tls::handshake(stream, host, tls_options).await?;
                        info!("connected to {} over TLS", options.address);
                        Ok(Self::wrap(
                            stream,
                            options.address.to_string(),
                            Some(tls_info),
                            options.close_timeout,
                        ))
                    }
                }
            }
            Address::Unix { path } => Self::open_unix(&options, path).await,
        }
    }

    #[cfg(unix)]
    async fn open_unix(options: &OpenOptions, path: &std::path::Path) -> Result<Self, TransportError> {
        if options.tls.is_some() {
            return Err(TransportError::InvalidParameters(
                "TLS is not supported over UNIX sockets".to_string(),
            ));
        }
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| classify_connect_error(&options.address, e))?;
        debug!("connected to UNIX socket {}", path.display());
        Ok(Self::wrap(stream, options.address.to_string(), None, options.close_timeout))
    }

    #[cfg(not(unix))]
    async fn open_unix(_options: &OpenOptions, path: &std::path::Path) -> Result<Self, TransportError> {
        Err(TransportError::InvalidParameters(format!(
            "UNIX sockets are not supported on this platform ({})",
            path.display()
        )))
    }

    /// Wraps an already-connected stream.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>, close_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::wrap(stream, peer.into(), None, close_timeout)
    }

    fn wrap<S>(stream: S, peer: String, tls_info: Option<TlsInfo>, close_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let inbound = Arc::new(Inbound::default());
        let closed_by_caller = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&inbound),
            Arc::clone(&closed_by_caller),
            peer.clone(),
        ));

        Self {
            peer,
            inbound,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            reader_task: Mutex::new(Some(reader_task)),
            recv_pending: AtomicBool::new(false),
            closed_by_caller,
            tls_info,
            close_timeout,
        }
    }

    /// Human-readable peer address, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Certificate details when the connection uses TLS.
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls_info.as_ref()
    }

    /// Returns `true` once the stream has ended and the buffer is drained.
    pub fn is_closed(&self) -> bool {
        let state = self.inbound.lock();
        state.ended && state.buffer.is_empty()
    }

    /// Waits for data and returns everything received since the last call.
    ///
    /// Returns `Ok(None)` once the stream has ended and nothing is buffered.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.recv_pending.swap(true, Ordering::AcqRel) {
            return Err(TransportError::RecvPending);
        }
        let _guard = PendingGuard(&self.recv_pending);

        loop {
            {
                let mut state = self.inbound.lock();
                if !state.buffer.is_empty() {
                    return Ok(Some(std::mem::take(&mut state.buffer)));
                }
                if state.ended {
                    return Ok(None);
                }
            }
            self.inbound.arrived.notified().await;
        }
    }

    /// Writes `bytes`; failures are logged, not returned.
    pub async fn send(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("write to {} failed: {e}", self.peer);
        }
    }

    /// Shuts the stream down and waits for the peer to close its side.
    ///
    /// Gives up after the configured close timeout and stops reading.
    pub async fn close(&self) {
        self.closed_by_caller.store(true, Ordering::SeqCst);

        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("shutdown of {} failed: {e}", self.peer);
        }

        let task = self.reader_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut task) = task {
            if time::timeout(self.close_timeout, &mut task).await.is_err() {
                debug!("{} did not close within {:?}; aborting reader", self.peer, self.close_timeout);
                task.abort();
            }
        }

        self.inbound.end();
        debug!("closed connection to {}", self.peer);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

async fn read_loop<R>(mut reader: R, inbound: Arc<Inbound>, closed_by_caller: Arc<AtomicBool>, peer: String)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("{peer} closed the stream");
                break;
            }
            Ok(n) => inbound.push(&buf[..n]),
            Err(e) => {
                if closed_by_caller.load(Ordering::SeqCst) {
                    debug!("read from {peer} ended during close: {e}");
                } else {
                    warn!("read from {peer} failed: {e}");
                }
                break;
            }
        }
    }
    inbound.end();
}

// ── Channel adapters ──────────────────────────────────────────────────────────

#[async_trait]
impl ChunkSource for Transport {
    async fn next_chunk(&self) -> io::Result<Option<Vec<u8>>> {
        self.recv().await.map_err(io::Error::other)
    }
}

#[async_trait]
impl MessageChannel for Transport {
    async fn send(&self, bytes: &[u8]) {
        Transport::send(self, bytes).await
    }

    async fn close(&self) {
        Transport::close(self).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
