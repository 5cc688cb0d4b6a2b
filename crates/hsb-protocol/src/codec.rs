//! Newline-delimited JSON codec.
//!
//! Outgoing values are serialized to one line each. Incoming bytes arrive in
//! arbitrary chunks; the decoder buffers an unterminated tail across chunks,
//! skips blank lines, and reports a malformed line as a per-line
//! [`DecodedLine::Malformed`] item so that decoding continues with the next
//! line instead of ending the stream.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted line length (1 MB), excluding the terminator.
pub const MAX_LINE_LENGTH: usize = 1_048_576;

/// How much of a malformed line is kept for diagnostics.
const PREVIEW_LEN: usize = 200;

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    /// A line that parsed as JSON
    Value(Value),
    /// A line that could not be decoded; the stream continues after it
    Malformed(LineError),
}

/// Per-line decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("invalid JSON ({reason}): {preview}")]
    InvalidJson { preview: String, reason: String },

    #[error("line exceeds {max} bytes")]
    TooLong { max: usize },
}

/// Stream-level codec errors. These end the stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Codec for one JSON value per `\n`-terminated line.
#[derive(Debug, Clone)]
pub struct JsonLineCodec {
    max_length: usize,
    /// Where to resume scanning for a terminator in the buffered tail
    next_index: usize,
    /// True while skipping the rest of an oversized line
    discarding: bool,
}

impl JsonLineCodec {
    /// Creates a codec with the default line limit.
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Creates a codec with a custom line limit.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    /// Returns the configured line limit.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Parses one complete line (terminator already removed).
    ///
    /// Returns `None` for blank lines.
    fn parse_line(line: &[u8]) -> Option<DecodedLine> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let decoded = match serde_json::from_slice::<Value>(line) {
            Ok(value) => DecodedLine::Value(value),
            Err(e) => {
                let text = String::from_utf8_lossy(line);
                let preview: String = text.chars().take(PREVIEW_LEN).collect();
                DecodedLine::Malformed(LineError::InvalidJson {
                    preview,
                    reason: e.to_string(),
                })
            }
        };
        Some(decoded)
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLineCodec {
    type Item = DecodedLine;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedLine>, CodecError> {
        loop {
            if self.discarding {
                match buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.discarding = false;
                        self.next_index = 0;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            let scan_end = buf.len().min(self.max_length.saturating_add(1));
            let terminator = buf
                .get(self.next_index..scan_end)
                .and_then(|window| window.iter().position(|b| *b == b'\n'));

            match terminator {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);

                    if let Some(decoded) = Self::parse_line(&line) {
                        return Ok(Some(decoded));
                    }
                }
                None if buf.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                    return Ok(Some(DecodedLine::Malformed(LineError::TooLong {
                        max: self.max_length,
                    })));
                }
                None => {
                    self.next_index = scan_end;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedLine>, CodecError> {
        if let Some(decoded) = self.decode(buf)? {
            return Ok(Some(decoded));
        }

        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }

        // Unterminated final line
        let rest = buf.split_to(buf.len());
        Ok(Self::parse_line(&rest))
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
