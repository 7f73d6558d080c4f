//! # labhost-core
//!
//! Shared library for LabHost containing the line-delimited JSON wire
//! protocol, its framing layer, and the plain data types produced by host
//! discovery.
//!
//! This crate is used by the client library and the `labhost` binary.
//! It has zero dependencies on OS APIs or network sockets: byte streams reach
//! the framing layer through the [`protocol::framing::ChunkSource`] trait.
//!
//! # Architecture overview
//!
//! A LabHost "host" is a long-running process that owns lab-automation state
//! and accepts commands.  A controller finds hosts (multicast DNS, saved
//! settings, UNIX sockets in a well-known directory) and talks to each of
//! them over a byte stream carrying newline-delimited JSON documents.
//!
//! - **`protocol`** – How documents travel over the stream.  Every message is
//!   one compact JSON object followed by a single `\n`; `framing` reassembles
//!   them from arbitrary chunk boundaries and `messages` defines the closed
//!   set of message variants.
//!
//! - **`domain`** – What discovery produces: advertised [`Service`]s, the
//!   [`Bridge`]s through which a host can be reached, and the aggregated
//!   [`HostEnvironment`] table entry.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `labhost_core::HostEnvironment` instead of the full module path.
pub use domain::host::{Bridge, BridgeSettings, HostEnvironment, HostSettings};
pub use domain::service::Service;
pub use protocol::framing::{encode_line, FrameError, FrameReader, LineDecoder};
pub use protocol::messages::{ClientMessage, FailureReason, HostInfo, ServerMessage};
