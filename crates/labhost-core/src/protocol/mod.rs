//! Protocol module containing message types and the newline-delimited JSON framing.

pub mod framing;
pub mod messages;

pub use framing::{encode_line, ChunkSource, FrameError, FrameReader, LineDecoder, MalformedHook};
pub use messages::*;
