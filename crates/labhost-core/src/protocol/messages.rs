//! All LabHost protocol message types.
//!
//! Messages are JSON objects discriminated by a `"type"` field:
//!
//! ```text
//! Server → Client:
//!   {"type":"initialize","identifier":string,"version":number,"staticUrl":string|null}
//!   {"type":"state","data":<snapshot>}
//!   {"type":"response","id":number,"data":<any>}
//! Client → Server:
//!   {"type":"request","id":number,"data":<any>}
//! ```
//!
//! The two directions are separate closed enums so that the dispatch site in
//! the protocol client matches every server variant exhaustively.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

// ── Server → client ───────────────────────────────────────────────────────────

/// A message sent by a host to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection: who the host is.
    Initialize {
        /// Stable identifier of the logical host.
        identifier: String,
        /// Protocol version spoken by the host.  Integral floats such as
        /// `2.0` are accepted.
        #[serde(deserialize_with = "integral_version")]
        version: u32,
        /// Base URL of static assets served by the host, if any.
        #[serde(rename = "staticUrl", default)]
        static_url: Option<String>,
    },
    /// A full snapshot (second message) or a partial update (later messages).
    State {
        #[serde(default)]
        data: Value,
    },
    /// Reply to the request with the same `id`.
    Response {
        id: u64,
        #[serde(default)]
        data: Value,
    },
}

impl ServerMessage {
    /// Returns the wire name of the variant, for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Initialize { .. } => "initialize",
            ServerMessage::State { .. } => "state",
            ServerMessage::Response { .. } => "response",
        }
    }
}

/// Reads a JSON number that holds a whole value in `u32` range.
fn integral_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let number = Number::deserialize(deserializer)?;
    if let Some(whole) = number.as_u64() {
        return u32::try_from(whole).map_err(|_| D::Error::custom(format!("version {number} out of range")));
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&f) => Ok(f as u32),
        _ => Err(D::Error::custom(format!("version {number} is not a whole number"))),
    }
}

// ── Client → server ───────────────────────────────────────────────────────────

/// A message sent by the controller to a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// An application request; the host answers with a `response` carrying the same `id`.
    Request { id: u64, data: Value },
}

// ── Handshake and connection outcomes ─────────────────────────────────────────

/// Information recorded from a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub identifier: String,
    /// Display name taken from the initial snapshot's top-level `"name"` field.
    pub name: Option<String>,
    pub version: u32,
    pub static_url: Option<String>,
}

/// Typed reason for a recoverable connection failure.
///
/// These are reported as values, never raised, so that callers can offer a
/// specific remedy (try another bridge, ask the user to trust a certificate,
/// and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Nothing listens at the address, or the UNIX socket file is missing.
    Refused,
    /// The address itself is unusable (port 0, empty host, bad server name).
    InvalidParameters,
    /// TLS certificate check was requested and the chain is not trusted.
    UntrustedServer,
    /// The presented certificate does not match the pinned fingerprint.
    FingerprintMismatch,
    /// The peer did not open with `initialize` followed by `state`.
    InvalidProtocol,
}

impl FailureReason {
    /// Returns the snake_case wire name of the reason.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Refused => "refused",
            FailureReason::InvalidParameters => "invalid_parameters",
            FailureReason::UntrustedServer => "untrusted_server",
            FailureReason::FingerprintMismatch => "fingerprint_mismatch",
            FailureReason::InvalidProtocol => "invalid_protocol",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
