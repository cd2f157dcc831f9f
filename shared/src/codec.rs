//! Stream codecs for the stdio bridge
//!
//! Two independent pieces live here:
//! - newline translation for console-style traffic, where the server expects
//!   `\r\n` line endings and the terminal expects `\n`
//! - a decoder for `Content-Length` framed protocol messages:
//! ```text
//! Content-Length: N\r\n
//! [other headers]\r\n
//! \r\n
//! [ N bytes: message body ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum message body size (10 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum size of a header block before its terminating blank line
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors that can occur while decoding frames
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Header block too large: {0} bytes without terminator (max: {MAX_HEADER_SIZE})")]
    HeaderTooLarge(usize),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Invalid Content-Length value: {0:?}")]
    InvalidLength(String),

    #[error("Header block has no Content-Length")]
    MissingContentLength,
}

/// Translates outbound `\n` into `\r\n`
///
/// A `\n` already preceded by `\r` is left alone, including when the `\r`
/// ended the previous chunk.
#[derive(Debug, Default)]
pub struct CrlfEncoder {
    had_cr: bool,
}

impl CrlfEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate `input`, appending the result to `out`
    pub fn encode(&mut self, input: &[u8], out: &mut BytesMut) {
        out.reserve(input.len() + input.len() / 8);
        for &byte in input {
            if byte == b'\n' && !self.had_cr {
                out.put_u8(b'\r');
            }
            self.had_cr = byte == b'\r';
            out.put_u8(byte);
        }
    }
}

/// Translates inbound `\r\n` into `\n`
///
/// A `\r` at the end of a chunk is held back until the next byte shows
/// whether it starts a `\r\n` pair.
#[derive(Debug, Default)]
pub struct CrlfDecoder {
    pending_cr: bool,
}

impl CrlfDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate `input`, appending the result to `out`
    pub fn decode(&mut self, input: &[u8], out: &mut BytesMut) {
        out.reserve(input.len());
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                if byte != b'\n' {
                    out.put_u8(b'\r');
                }
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.put_u8(byte);
            }
        }
    }

    /// Release a held-back `\r` at end of stream
    pub fn finish(&mut self, out: &mut BytesMut) {
        if std::mem::take(&mut self.pending_cr) {
            out.put_u8(b'\r');
        }
    }
}

/// Try to decode one `Content-Length` framed message body from a buffer
///
/// Returns:
/// - `Ok(Some(body))` if a complete message was decoded and consumed
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    let header_end = match find(buf, HEADER_TERMINATOR) {
        Some(pos) => pos,
        None if buf.len() > MAX_HEADER_SIZE => {
            return Err(CodecError::HeaderTooLarge(buf.len()));
        }
        None => return Ok(None),
    };

    let content_length = parse_content_length(&buf[..header_end])?;
    if content_length > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(content_length));
    }

    let body_start = header_end + HEADER_TERMINATOR.len();
    if buf.len() < body_start + content_length {
        return Ok(None);
    }

    buf.advance(body_start);
    Ok(Some(buf.split_to(content_length).freeze()))
}

fn parse_content_length(block: &[u8]) -> Result<usize, CodecError> {
    let text = String::from_utf8_lossy(block);
    let mut length = None;

    for line in text.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            let parsed = value
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidLength(value.to_string()))?;
            length = Some(parsed);
        }
    }

    length.ok_or(CodecError::MissingContentLength)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Drop buffered data, e.g. after a decode error
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
