//! LSP base-protocol framing.
//!
//! One frame is an ASCII header block terminated by `\r\n\r\n`, followed by a
//! UTF-8 JSON body of exactly `Content-Length` bytes:
//!
//! ```text
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of JSON>
//! ```
//!
//! The decoder is incremental: it accumulates arbitrary-sized reads and yields
//! complete messages as they become available, so it handles several messages
//! arriving in one read as well as a single frame split mid-header.

use serde_json::Value;
use thiserror::Error;

/// Upper bound on a frame body. A `Content-Length` beyond this is treated as
/// a corrupt header rather than an allocation request.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Serialize `msg` into a single framed byte vector.
pub fn encode(msg: &Value) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("frame body of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    Oversized(usize),

    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Streaming frame decoder.
///
/// Feed it raw bytes with [`feed`](Self::feed) and drain messages with
/// [`next_message`](Self::next_message) until it returns `Ok(None)`.
///
/// A malformed header discards the entire buffer: mid-stream there is no way
/// to find the next frame boundary, so the only safe recovery is to
/// resynchronize on whatever the server writes next.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Body length parsed from the current frame's header, if the header has
    /// been consumed already.
    body_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete message, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed. After an `Err` the decoder has
    /// already resynchronized and can keep being fed.
    pub fn next_message(&mut self) -> Result<Option<Value>, DecodeError> {
        loop {
            match self.body_len {
                None => {
                    let Some(end) = find(&self.buf, HEADER_TERMINATOR) else {
                        return Ok(None);
                    };
                    let header: Vec<u8> = self.buf.drain(..end + HEADER_TERMINATOR.len()).collect();
                    match parse_content_length(&header[..end]) {
                        Ok(len) if len <= MAX_MESSAGE_SIZE => self.body_len = Some(len),
                        Ok(len) => {
                            self.buf.clear();
                            return Err(DecodeError::Oversized(len));
                        }
                        Err(e) => {
                            self.buf.clear();
                            return Err(e);
                        }
                    }
                }
                Some(len) => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buf.drain(..len).collect();
                    self.body_len = None;
                    let text = String::from_utf8_lossy(&body);
                    return serde_json::from_str(&text)
                        .map(Some)
                        .map_err(DecodeError::from);
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract `Content-Length` from a CRLF-separated header block.
///
/// The field name is matched case-sensitively, as the LSP base protocol
/// specifies it. Other headers (`Content-Type` included) are ignored.
fn parse_content_length(header: &[u8]) -> Result<usize, DecodeError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| DecodeError::MalformedHeader("header is not ASCII".into()))?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name == "Content-Length" {
            return value.trim().parse().map_err(|_| {
                DecodeError::MalformedHeader(format!("bad Content-Length value: {value:?}"))
            });
        }
    }
    Err(DecodeError::MalformedHeader(
        "missing Content-Length".into(),
    ))
}
