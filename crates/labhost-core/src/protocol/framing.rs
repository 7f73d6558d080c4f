//! Newline-delimited JSON framing.
//!
//! Wire format:
//! ```text
//! <compact JSON document>\n<compact JSON document>\n...
//! ```
//! Standard JSON string escaping guarantees that a serialized document never
//! contains a raw line-feed, so `\n` is an unambiguous terminator.
//!
//! # Streaming input
//!
//! A byte stream delivers data in chunks whose boundaries have nothing to do
//! with document boundaries: one chunk may hold half a document, or three and
//! a half.  [`LineDecoder`] keeps the incomplete tail of the previous chunk
//! (the *carry-over*) and emits every complete line in arrival order.  It works
//! on bytes, so a multi-byte UTF-8 character split across two chunks is
//! reassembled before it is ever interpreted.
//!
//! [`FrameReader`] layers JSON decoding on top of a [`ChunkSource`] and yields
//! one document at a time.  It is forward-only: once a chunk is consumed it is
//! gone, so a new reader must start from a fresh connection.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while encoding or decoding framed documents.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A complete line was received but is not a valid document.
    ///
    /// Unless a [`MalformedHook`] elects to skip it, this is fatal for the
    /// connection that produced it.
    #[error("malformed document {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// An outbound document could not be serialized.
    #[error("failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),

    /// The underlying byte stream failed.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recovery hook for malformed lines: return `true` to skip the line and keep
/// reading, `false` to surface the error.
pub type MalformedHook = Arc<dyn Fn(&FrameError) -> bool + Send + Sync>;

/// A source of raw inbound byte chunks.
///
/// `Ok(None)` signals a clean end of stream.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Waits for the next chunk of bytes.
    async fn next_chunk(&self) -> std::io::Result<Option<Vec<u8>>>;
}

#[async_trait]
impl<T: ChunkSource + ?Sized> ChunkSource for Arc<T> {
    async fn next_chunk(&self) -> std::io::Result<Option<Vec<u8>>> {
        (**self).next_chunk().await
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Serializes `doc` as compact JSON followed by a single `\n`.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if `doc` cannot be represented as JSON
/// (for example a map with non-string keys).
///
/// # Examples
///
/// ```rust
/// use labhost_core::protocol::framing::encode_line;
/// use serde_json::json;
///
/// let bytes = encode_line(&json!({"type": "request", "id": 1, "data": null})).unwrap();
/// assert_eq!(bytes.last(), Some(&b'\n'));
/// assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
/// ```
pub fn encode_line<T: Serialize + ?Sized>(doc: &T) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(doc).map_err(FrameError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ── Inbound: line reassembly ──────────────────────────────────────────────────

/// Reassembles complete lines from arbitrarily sliced chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Bytes of the line currently being received (no `\n` seen yet).
    carry: Vec<u8>,
}

impl LineDecoder {
    /// Creates a decoder with an empty carry-over buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every line it completed, without the `\n`.
    ///
    /// Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.carry.extend_from_slice(&rest[..pos]);
            let line = std::mem::take(&mut self.carry);
            if !is_blank(&line) {
                lines.push(line);
            }
            rest = &rest[pos + 1..];
        }

        self.carry.extend_from_slice(rest);
        lines
    }

    /// Number of bytes held in the carry-over buffer.
    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    /// Ends the stream, returning the unterminated tail if it holds anything
    /// other than whitespace.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let tail = std::mem::take(&mut self.carry);
        (!is_blank(&tail)).then_some(tail)
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

// ── Inbound: document stream ──────────────────────────────────────────────────

/// Lazily decodes JSON documents from a [`ChunkSource`].
pub struct FrameReader<S> {
    source: S,
    decoder: LineDecoder,
    ready: VecDeque<Vec<u8>>,
    on_malformed: Option<MalformedHook>,
    finished: bool,
}

impl<S: ChunkSource> FrameReader<S> {
    /// Creates a reader with no recovery hook: malformed lines are fatal.
    pub fn new(source: S) -> Self {
        Self {
            source,
            decoder: LineDecoder::new(),
            ready: VecDeque::new(),
            on_malformed: None,
            finished: false,
        }
    }

    /// Installs a hook consulted for every malformed line.
    pub fn with_malformed_hook(mut self, hook: Option<MalformedHook>) -> Self {
        self.on_malformed = hook;
        self
    }

    /// Returns the next document, or `None` once the stream has ended and
    /// every complete line has been delivered.
    ///
    /// An unterminated tail left at end of stream is discarded.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Option<Result<T, FrameError>> {
        loop {
            while let Some(line) = self.ready.pop_front() {
                match serde_json::from_slice::<T>(&line) {
                    Ok(doc) => return Some(Ok(doc)),
                    Err(source) => {
                        let err = FrameError::Malformed {
                            line: String::from_utf8_lossy(&line).into_owned(),
                            source,
                        };
                        if self.on_malformed.as_ref().is_some_and(|hook| hook(&err)) {
                            warn!("skipping {err}");
                            continue;
                        }
                        return Some(Err(err));
                    }
                }
            }

            if self.finished {
                return None;
            }

            match self.source.next_chunk().await {
                Ok(Some(chunk)) => {
                    let lines = self.decoder.push(&chunk);
                    self.ready.extend(lines);
                }
                Ok(None) => {
                    self.finished = true;
                    if let Some(tail) = self.decoder.finish() {
                        debug!("discarding {} unterminated bytes at end of stream", tail.len());
                    }
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(FrameError::Io(e)));
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Replays a fixed list of chunks, then reports end of stream.
    struct ScriptedSource {
        chunks: Mutex<VecDeque<std::io::Result<Vec<u8>>>>,
    }

    impl ScriptedSource {
        fn new(chunks: Vec<&str>) -> Self {
            Self {
                chunks: Mutex::new(chunks.into_iter().map(|c| Ok(c.as_bytes().to_vec())).collect()),
            }
        }
    }

    #[async_trait]
    impl ChunkSource for ScriptedSource {
        async fn next_chunk(&self) -> std::io::Result<Option<Vec<u8>>> {
            match self.chunks.lock().unwrap().pop_front() {
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
    }

    // ── LineDecoder ───────────────────────────────────────────────────────────

    #[test]
    fn test_push_returns_complete_lines_only() {
        // Arrange
        let mut decoder = LineDecoder::new();

        // Act
        let lines = decoder.push(b"{\"a\":1}\n{\"b\":");

        // Assert
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec()]);
        assert_eq!(decoder.pending_len(), 5);
    }

    #[test]
    fn test_push_completes_line_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"b\"").is_empty());
        assert!(decoder.push(b":2").is_empty());
        let lines = decoder.push(b"}\n");
        assert_eq!(lines, vec![b"{\"b\":2}".to_vec()]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_push_reassembles_split_utf8_character() {
        // Arrange: "é" is 0xC3 0xA9; split between the two bytes
        let mut decoder = LineDecoder::new();

        // Act
        decoder.push(b"\"caf\xC3");
        let lines = decoder.push(b"\xA9\"\n");

        // Assert
        let text = String::from_utf8(lines[0].clone()).unwrap();
        assert_eq!(text, "\"café\"");
    }

    #[test]
    fn test_push_skips_blank_lines() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"\n  \n1\n\r\n2\n");
        assert_eq!(lines, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn test_finish_returns_non_blank_tail() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"1\n{\"partial\"");
        assert_eq!(decoder.finish(), Some(b"{\"partial\"".to_vec()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_encode_line_escapes_embedded_newlines() {
        // Arrange
        let doc = json!({"text": "line one\nline two"});

        // Act
        let bytes = encode_line(&doc).unwrap();

        // Assert: exactly one raw line-feed, at the very end
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }

    // ── FrameReader ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reader_yields_documents_in_order_then_none() {
        // Arrange
        let source = ScriptedSource::new(vec!["{\"n\":1}\n{\"n\"", ":2}\n{\"n\":3}\n"]);
        let mut reader = FrameReader::new(source);

        // Act
        let mut seen = Vec::new();
        while let Some(doc) = reader.next::<Value>().await {
            seen.push(doc.unwrap()["n"].as_u64().unwrap());
        }

        // Assert
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reader_without_hook_surfaces_malformed_line() {
        let source = ScriptedSource::new(vec!["not json\n{\"n\":1}\n"]);
        let mut reader = FrameReader::new(source);

        let first = reader.next::<Value>().await.unwrap();

        match first {
            Err(FrameError::Malformed { line, .. }) => assert_eq!(line, "not json"),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reader_hook_can_skip_malformed_line() {
        // Arrange
        let skipped = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&skipped);
        let hook: MalformedHook = Arc::new(move |_err| {
            *counter.lock().unwrap() += 1;
            true
        });
        let source = ScriptedSource::new(vec!["oops\n{\"n\":1}\n"]);
        let mut reader = FrameReader::new(source).with_malformed_hook(Some(hook));

        // Act
        let doc = reader.next::<Value>().await.unwrap().unwrap();

        // Assert
        assert_eq!(doc, json!({"n": 1}));
        assert_eq!(*skipped.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reader_hook_returning_false_keeps_error() {
        let hook: MalformedHook = Arc::new(|_err| false);
        let source = ScriptedSource::new(vec!["oops\n"]);
        let mut reader = FrameReader::new(source).with_malformed_hook(Some(hook));

        let result = reader.next::<Value>().await.unwrap();

        assert!(matches!(result, Err(FrameError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_reader_discards_unterminated_tail() {
        let source = ScriptedSource::new(vec!["{\"n\":1}\n{\"n\":2}"]);
        let mut reader = FrameReader::new(source);

        assert!(reader.next::<Value>().await.unwrap().is_ok());
        assert!(reader.next::<Value>().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_stream_error_then_ends() {
        // Arrange
        let source = ScriptedSource {
            chunks: Mutex::new(VecDeque::from(vec![Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))])),
        };
        let mut reader = FrameReader::new(source);

        // Act
        let first = reader.next::<Value>().await;
        let second = reader.next::<Value>().await;

        // Assert
        assert!(matches!(first, Some(Err(FrameError::Io(_)))));
        assert!(second.is_none());
    }
}
