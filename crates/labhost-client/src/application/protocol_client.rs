//! ProtocolClient: drives one connection to a LabHost host.
//!
//! # Connection lifecycle (for beginners)
//!
//! ```text
//! Uninitialized ──initialize()──► Initializing ──ok──► Ready ──stream end / close()──► Closed
//!                                      │
//!                                      └──bad handshake──► Closed
//! ```
//!
//! 1. The host speaks first.  Its first message must be `initialize` (who it
//!    is) and its second must be `state` (the full snapshot).  Anything else
//!    and the handshake is rejected with `invalid_protocol`.
//! 2. Once `Ready`, the controller sends `request` messages carrying a fresh
//!    numeric id.  The host answers each with a `response` carrying the same
//!    id, in any order.  [`ProtocolClient::request`] suspends until its own
//!    answer arrives.
//! 3. The running loop ([`ProtocolClient::run`]) reads everything the host
//!    sends after the handshake: responses wake the matching request, `state`
//!    messages update the cached snapshot.
//! 4. When the stream ends, every request still waiting fails with
//!    [`ClientError::Closed`].
//!
//! # Architecture
//!
//! The client depends only on the [`MessageChannel`] trait.  The transport
//! in `infrastructure::transport` implements it for real sockets; tests use a
//! scripted in-memory channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use labhost_core::protocol::framing::{encode_line, ChunkSource, FrameError, FrameReader, MalformedHook};
use labhost_core::protocol::messages::{ClientMessage, FailureReason, HostInfo, ServerMessage};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

// ── Channel abstraction ───────────────────────────────────────────────────────

/// A bidirectional byte pipe to one host.
///
/// Reading comes from the [`ChunkSource`] supertrait.  `send` is
/// fire-and-forget: write failures are logged by the implementation and
/// surface to the client as the stream ending.
#[async_trait]
pub trait MessageChannel: ChunkSource {
    /// Writes `bytes` to the peer.
    async fn send(&self, bytes: &[u8]);

    /// Gracefully shuts the pipe down and waits until it is closed.
    async fn close(&self);
}

#[async_trait]
impl<T: MessageChannel + ?Sized> MessageChannel for Arc<T> {
    async fn send(&self, bytes: &[u8]) {
        (**self).send(bytes).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// Connection state of a [`ProtocolClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    /// Terminal.
    Closed,
}

/// Outcome of [`ProtocolClient::initialize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    Accepted(HostInfo),
    /// The peer did not open with `initialize` then `state`.
    Rejected(FailureReason),
}

/// How a `state` update is combined with the cached snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateMergePolicy {
    /// Each top-level key of the update replaces the same key in the snapshot;
    /// keys absent from the update are kept.  Non-object updates replace.
    #[default]
    ShallowMerge,
    /// The update becomes the new snapshot.
    Replace,
}

/// Custom shutdown routine used by [`ProtocolClient::close`] instead of the
/// channel's own `close`.
pub type ShutdownRoutine = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Errors returned by the protocol client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection closed before the operation could complete.
    #[error("connection closed")]
    Closed,

    /// No response arrived in time; the request was forgotten.
    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },

    /// The operation is not allowed in the current lifecycle state.
    #[error("operation not allowed while {0:?}")]
    InvalidState(Lifecycle),

    /// The request payload could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(#[source] FrameError),

    /// The running loop stopped on an unparseable line or a read failure.
    #[error("could not read from host: {0}")]
    Frame(#[source] FrameError),
}

/// Construction-time options for a [`ProtocolClient`].
#[derive(Default)]
pub struct ClientOptions {
    pub merge_policy: StateMergePolicy,
    /// Decides whether an unparseable line is skipped (`true`) or fatal.
    pub on_malformed: Option<MalformedHook>,
    /// Timeout applied by [`ProtocolClient::request`].  `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub shutdown: Option<ShutdownRoutine>,
    /// Receives the merged snapshot after every `state` update.
    pub state_observer: Option<mpsc::UnboundedSender<Value>>,
}

impl ClientOptions {
    pub fn with_merge_policy(mut self, policy: StateMergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_malformed_hook(mut self, hook: MalformedHook) -> Self {
        self.on_malformed = Some(hook);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, routine: ShutdownRoutine) -> Self {
        self.shutdown = Some(routine);
        self
    }

    pub fn with_state_observer(mut self, observer: mpsc::UnboundedSender<Value>) -> Self {
        self.state_observer = Some(observer);
        self
    }
}

type ResponseSlot = oneshot::Sender<Result<Value, ClientError>>;

/// Requests waiting for their response.  Once `closed` is set no new slot
/// can be registered.
#[derive(Default)]
struct PendingTable {
    slots: HashMap<u64, ResponseSlot>,
    closed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Protocol client bound to one [`MessageChannel`].
pub struct ProtocolClient<C: MessageChannel + 'static> {
    channel: Arc<C>,
    reader: tokio::sync::Mutex<FrameReader<Arc<C>>>,
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    snapshot: Mutex<Value>,
    host_info: Mutex<Option<HostInfo>>,
    options: ClientOptions,
}

impl<C: MessageChannel + 'static> ProtocolClient<C> {
    /// Creates a client with default options.
    pub fn new(channel: C) -> Self {
        Self::with_options(channel, ClientOptions::default())
    }

    pub fn with_options(channel: C, options: ClientOptions) -> Self {
        let channel = Arc::new(channel);
        let reader =
            FrameReader::new(Arc::clone(&channel)).with_malformed_hook(options.on_malformed.clone());
        Self {
            channel,
            reader: tokio::sync::Mutex::new(reader),
            pending: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            snapshot: Mutex::new(Value::Null),
            host_info: Mutex::new(None),
            options,
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    /// The cached snapshot with every update applied so far.
    pub fn state(&self) -> Value {
        lock(&self.snapshot).clone()
    }

    /// Handshake information, once [`initialize`](Self::initialize) succeeded.
    pub fn host_info(&self) -> Option<HostInfo> {
        lock(&self.host_info).clone()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).slots.len()
    }

    /// Reads the first two messages and validates the handshake.
    ///
    /// A protocol violation is reported as `Handshake::Rejected`, not as an
    /// error, and leaves the client `Closed`.  The channel itself stays open
    /// until [`close`](Self::close) is called.
    pub async fn initialize(&self) -> Result<Handshake, ClientError> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle != Lifecycle::Uninitialized {
                return Err(ClientError::InvalidState(*lifecycle));
            }
            *lifecycle = Lifecycle::Initializing;
        }

        let mut reader = self.reader.lock().await;

        let (identifier, version, static_url) = match reader.next::<ServerMessage>().await {
            Some(Ok(ServerMessage::Initialize { identifier, version, static_url })) => {
                (identifier, version, static_url)
            }
            other => return Ok(self.reject_handshake("initialize", &other)),
        };

        let data = match reader.next::<ServerMessage>().await {
            Some(Ok(ServerMessage::State { data })) => data,
            other => return Ok(self.reject_handshake("state", &other)),
        };
        drop(reader);

        let info = HostInfo {
            identifier,
            name: data.get("name").and_then(Value::as_str).map(str::to_string),
            version,
            static_url,
        };

        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle != Lifecycle::Initializing {
                return Ok(Handshake::Rejected(FailureReason::InvalidProtocol));
            }
            *lock(&self.snapshot) = data;
            *lock(&self.host_info) = Some(info.clone());
            *lifecycle = Lifecycle::Ready;
        }

        info!(identifier = %info.identifier, version = info.version, "host handshake complete");
        Ok(Handshake::Accepted(info))
    }

    fn reject_handshake(
        &self,
        expected: &str,
        got: &Option<Result<ServerMessage, FrameError>>,
    ) -> Handshake {
        match got {
            Some(Ok(msg)) => warn!("handshake expected {expected}, host sent {}", msg.kind()),
            Some(Err(e)) => warn!("handshake expected {expected}, host sent garbage: {e}"),
            None => warn!("handshake expected {expected}, stream ended"),
        }
        self.mark_closed();
        Handshake::Rejected(FailureReason::InvalidProtocol)
    }

    /// Sends a request and waits for its response, applying the client-wide
    /// request timeout if one was configured.
    pub async fn request(&self, data: Value) -> Result<Value, ClientError> {
        self.request_with_timeout(data, self.options.request_timeout).await
    }

    /// Sends a request and waits at most `timeout` for its response.
    ///
    /// Fails with [`ClientError::InvalidState`] until the handshake has
    /// completed; nothing is written in that case.
    ///
    /// On timeout the pending entry is removed; a response arriving later is
    /// dropped by the running loop.
    pub async fn request_with_timeout(
        &self,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        match self.lifecycle() {
            Lifecycle::Ready => {}
            Lifecycle::Closed => return Err(ClientError::Closed),
            current => return Err(ClientError::InvalidState(current)),
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = encode_line(&ClientMessage::Request { id, data }).map_err(ClientError::Encode)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(ClientError::Closed);
            }
            pending.slots.insert(id, tx);
        }

        debug!(id, "sending request");
        self.channel.send(&bytes).await;

        let outcome = match timeout {
            None => rx.await,
            Some(limit) => match time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock(&self.pending).slots.remove(&id);
                    warn!(id, "request timed out after {limit:?}");
                    return Err(ClientError::Timeout { id, timeout: limit });
                }
            },
        };

        // A dropped sender means the table was cleared on close.
        outcome.unwrap_or(Err(ClientError::Closed))
    }

    /// Consumes inbound messages until the stream ends.
    ///
    /// Must be called after a successful handshake.  Returns `Ok(())` when
    /// the peer closed the stream and `Err(Frame)` when a line could not be
    /// parsed (and the malformed hook did not skip it) or the read failed.  Either way the
    /// client is `Closed` and every pending request has been rejected.
    pub async fn run(&self) -> Result<(), ClientError> {
        let current = self.lifecycle();
        if current != Lifecycle::Ready {
            return Err(ClientError::InvalidState(current));
        }

        let mut reader = self.reader.lock().await;
        let result = loop {
            match reader.next::<ServerMessage>().await {
                Some(Ok(msg)) => self.dispatch(msg),
                Some(Err(e)) => {
                    warn!("stopping running loop: {e}");
                    break Err(ClientError::Frame(e));
                }
                None => {
                    debug!("host stream ended");
                    break Ok(());
                }
            }
        };
        drop(reader);

        self.mark_closed();
        result
    }

    /// Runs [`run`](Self::run) on a new tokio task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<(), ClientError>> {
        tokio::spawn(async move { self.run().await })
    }

    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Response { id, data } => {
                let slot = lock(&self.pending).slots.remove(&id);
                match slot {
                    Some(tx) => {
                        // The requester may have given up; nothing to do then.
                        let _ = tx.send(Ok(data));
                    }
                    None => debug!(id, "dropping response for unknown request"),
                }
            }
            ServerMessage::State { data } => {
                let merged = {
                    let mut snapshot = lock(&self.snapshot);
                    apply_update(&mut snapshot, data, self.options.merge_policy);
                    snapshot.clone()
                };
                if let Some(observer) = &self.options.state_observer {
                    if observer.send(merged).is_err() {
                        debug!("state observer dropped");
                    }
                }
            }
            ServerMessage::Initialize { identifier, .. } => {
                warn!(%identifier, "ignoring initialize received after the handshake");
            }
        }
    }

    /// Closes the connection.
    ///
    /// Uses the custom shutdown routine when one was supplied, otherwise the
    /// channel's own `close`.  Afterwards the client is `Closed` and no
    /// request is left pending.
    pub async fn close(&self) {
        match &self.options.shutdown {
            Some(routine) => routine().await,
            None => self.channel.close().await,
        }
        self.mark_closed();
    }

    /// Moves to `Closed` and rejects every pending request.
    fn mark_closed(&self) {
        *lock(&self.lifecycle) = Lifecycle::Closed;

        let drained: Vec<ResponseSlot> = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            pending.slots.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "rejecting pending requests");
        }
        for tx in drained {
            let _ = tx.send(Err(ClientError::Closed));
        }
    }
}

/// Combines a `state` update with the snapshot according to `policy`.
pub fn apply_update(snapshot: &mut Value, update: Value, policy: StateMergePolicy) {
    match (policy, snapshot.as_object_mut(), update) {
        (StateMergePolicy::ShallowMerge, Some(target), Value::Object(fields)) => {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        (_, _, update) => *snapshot = update,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
