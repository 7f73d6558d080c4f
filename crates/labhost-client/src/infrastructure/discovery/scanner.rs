//! ServiceScanner: owns the multicast socket and feeds the registry.
//!
//! # How mDNS browsing works (for beginners)
//!
//! Multicast DNS is ordinary DNS sent to the group address `224.0.0.251`
//! on port 5353 instead of to a server.  Every machine on the LAN that
//! joined the group sees every packet.
//!
//! 1. To *browse*, we send a question "PTR `_labhost-tls._tcp.local`?" to the
//!    group.
//! 2. Each host offering that service answers with a PTR record naming its
//!    instance, usually with the SRV, TXT and A/AAAA records attached as
//!    "additional" records.
//! 3. Hosts also announce themselves unprompted when they start and say
//!    goodbye (TTL 0) when they stop.
//!
//! The scanner listens passively the whole time, so answers to *anyone's*
//! question end up in our cache.  Sending a question only speeds things up.
//!
//! # Errors
//!
//! The passive receive path never fails: unreadable packets are logged at
//! debug level and dropped.  Socket errors are only returned by
//! [`ServiceScanner::query_services`] and [`ServiceScanner::get_services`].

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use labhost_core::Service;
use simple_dns::{Name, Packet, Question, SimpleDnsError, CLASS, QCLASS, QTYPE, TYPE};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::records::parse_packet;
use super::registry::{ServiceRegistry, ServicesCallback, DEFAULT_DEBOUNCE};

/// IPv4 mDNS group address.
pub const MDNS_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

/// Default wait between sending queries and reading the cache.
pub const DEFAULT_QUERY_DELAY: Duration = Duration::from_millis(800);

/// Largest mDNS packet we accept (jumbo-frame friendly).
const MAX_PACKET_SIZE: usize = 9000;

/// Errors surfaced by the active scanner operations.
#[derive(Debug, Error)]
pub enum ScannerError {
    /// The multicast socket could not be created or bound.
    #[error("failed to bind mDNS socket on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    /// A query packet could not be built (usually an invalid service type).
    #[error("failed to build mDNS query: {0}")]
    Encode(#[from] SimpleDnsError),

    /// The query could not be sent.
    #[error("failed to send mDNS query to {destination}: {source}")]
    Send {
        destination: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The scanner was closed and no longer owns a socket.
    #[error("mDNS scanner is closed")]
    Closed,
}

/// Socket and timing settings for a [`ServiceScanner`].
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Local address to bind.  Port 5353 shared with other responders.
    pub bind_addr: SocketAddrV4,
    /// Where queries are sent.
    pub destination: SocketAddr,
    /// Join the mDNS multicast group after binding.
    pub join_multicast: bool,
    pub debounce: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT),
            destination: SocketAddr::V4(SocketAddrV4::new(MDNS_IPV4, MDNS_PORT)),
            join_multicast: true,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Builds a UDP socket that can share port 5353 with the OS responder.
fn multicast_socket(config: &ScannerConfig) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(config.bind_addr).into())?;

    if config.join_multicast {
        // Hosts without a multicast route can still see unicast replies.
        if let Err(e) = socket.join_multicast_v4(&MDNS_IPV4, &Ipv4Addr::UNSPECIFIED) {
            warn!("could not join mDNS group {MDNS_IPV4}: {e}");
        }
        socket.set_multicast_loop_v4(true)?;
    }

    Ok(socket.into())
}

/// Builds one packet asking for the PTR records of every type.
pub fn build_query(types: &[String]) -> Result<Vec<u8>, SimpleDnsError> {
    let mut packet = Packet::new_query(0);
    for service_type in types {
        packet.questions.push(Question::new(
            Name::new(service_type)?,
            QTYPE::TYPE(TYPE::PTR),
            QCLASS::CLASS(CLASS::IN),
            false,
        ));
    }
    packet.build_bytes_vec()
}

/// Multicast-DNS service browser.
pub struct ServiceScanner {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    registry: Arc<ServiceRegistry>,
    destination: SocketAddr,
    shutdown: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceScanner {
    /// Binds the socket and starts listening.  Must be called inside a
    /// tokio runtime.
    pub fn start(config: ScannerConfig) -> Result<Self, ScannerError> {
        let bind_error = |source| ScannerError::Bind { addr: config.bind_addr, source };

        let std_socket = multicast_socket(&config).map_err(bind_error)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(bind_error)?);

        let registry = ServiceRegistry::new(config.debounce);
        let shutdown = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&registry),
            shutdown.clone(),
        ));

        info!("mDNS scanner listening on {}", config.bind_addr);
        Ok(Self {
            socket: Mutex::new(Some(socket)),
            registry,
            destination: config.destination,
            shutdown,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The address the socket is bound to.  Fails with `NotConnected` once
    /// the scanner is closed.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self.socket() {
            Some(socket) => socket.local_addr(),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "mDNS scanner is closed")),
        }
    }

    /// Lists the live services of `types` from the cache, without querying.
    pub fn list_services(&self, types: &[String]) -> Vec<Service> {
        self.registry.list(types)
    }

    /// Sends PTR queries for `types`.  Does not wait for answers.
    pub async fn query_services(&self, types: &[String]) -> Result<(), ScannerError> {
        let socket = self.socket().ok_or(ScannerError::Closed)?;
        let bytes = build_query(types)?;
        socket
            .send_to(&bytes, self.destination)
            .await
            .map_err(|source| ScannerError::Send { destination: self.destination, source })?;
        debug!("sent mDNS query for {types:?}");
        Ok(())
    }

    /// Queries, waits `query_delay`, then lists.  A zero delay skips the query.
    pub async fn get_services(
        &self,
        types: &[String],
        query_delay: Duration,
    ) -> Result<Vec<Service>, ScannerError> {
        if !query_delay.is_zero() {
            self.query_services(types).await?;
            time::sleep(query_delay).await;
        }
        Ok(self.list_services(types))
    }

    /// Calls `callback` with the services of `types` after every debounced
    /// change, until `cancel` fires.
    pub fn listen_to_services(&self, callback: ServicesCallback, types: Vec<String>, cancel: CancellationToken) {
        self.registry.subscribe(types, callback, cancel);
    }

    /// Stops listening, cancels the debounce timer, drops subscriptions and
    /// releases the socket.
    ///
    /// The port is free again once the receive loop has wound down, which
    /// happens on its next poll.  Calling `close` twice is harmless.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.registry.close();
        if let Some(receiver) = self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take() {
            receiver.abort();
        }
        if self.socket.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            debug!("mDNS scanner closed");
        }
    }
}

impl Drop for ServiceScanner {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, registry: Arc<ServiceRegistry>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, src)) => match parse_packet(&buf[..len]) {
                Ok(updates) => registry.ingest(updates),
                Err(e) => debug!("dropping unreadable mDNS packet from {src}: {e}"),
            },
            Err(e) => {
                debug!("mDNS receive error: {e}");
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    debug!("mDNS receive loop stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
