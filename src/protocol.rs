//! Wire protocol codec.
//!
//! Requests to the sandboxed process are length-prefixed frames: an ASCII
//! header line `"<kind> <byte-length>\n"` followed by exactly that many raw
//! payload bytes. The length prefix keeps the stream unambiguous when the
//! payload itself contains newlines. Multiple frames may be queued before
//! one flush (e.g. a language selector followed by an init event).
//!
//! Responses are not framed: the primary output stream is terminated by one
//! reserved control byte ([`RESPONSE_TERMINATOR`]) as its final byte. That
//! half of the protocol lives in [`crate::terminal`].

use crate::constants::{
    FRAME_KIND_INIT, FRAME_KIND_LANGUAGE, FRAME_KIND_MESSAGE, MAX_FRAME_PAYLOAD,
    RESPONSE_TERMINATOR,
};
use crate::error::{Error, Result};

// =============================================================================
// Frame
// =============================================================================

/// One outbound request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: String,
    payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame from a kind and raw payload bytes.
    ///
    /// # Errors
    ///
    /// Rejects an empty kind, a kind containing whitespace (it would
    /// corrupt the header line), and a payload above [`MAX_FRAME_PAYLOAD`].
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let kind = kind.into();
        let payload = payload.into();
        if kind.is_empty() {
            return Err(Error::Protocol("frame kind must be nonempty".to_string()));
        }
        if kind.chars().any(|c| c.is_ascii_whitespace()) || !kind.is_ascii() {
            return Err(Error::Protocol(format!(
                "frame kind '{kind}' must be ASCII without whitespace"
            )));
        }
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol(format!(
                "frame payload of {} bytes exceeds {MAX_FRAME_PAYLOAD}",
                payload.len()
            )));
        }
        Ok(Self { kind, payload })
    }

    /// Returns the frame kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encodes the frame: header line plus raw payload.
    pub fn encode(&self) -> Vec<u8> {
        let header = format!("{} {}\n", self.kind, self.payload.len());
        let mut buf = Vec::with_capacity(header.len() + self.payload.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed. This is the
    /// inverse of [`Frame::encode`]; the engine itself only encodes, but
    /// the decoder keeps the format honest and is what test doubles of the
    /// guest runner parse with.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] for a missing header newline, a malformed
    /// header, an oversized length, or a truncated payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let newline = buf
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::Protocol("frame header is missing newline".to_string()))?;
        let header = std::str::from_utf8(&buf[..newline])
            .map_err(|_| Error::Protocol("frame header is not UTF-8".to_string()))?;
        let (kind, len) = header
            .split_once(' ')
            .ok_or_else(|| Error::Protocol(format!("frame header '{header}' has no length")))?;
        let len: usize = len
            .parse()
            .map_err(|_| Error::Protocol(format!("frame length '{len}' is not a number")))?;
        if len > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol(format!(
                "frame length {len} exceeds {MAX_FRAME_PAYLOAD}"
            )));
        }
        let start = newline + 1;
        let end = start + len;
        if buf.len() < end {
            return Err(Error::Protocol(format!(
                "frame payload truncated: expected {len} bytes, have {}",
                buf.len() - start
            )));
        }
        Ok((Self::new(kind, &buf[start..end])?, end))
    }
}

// =============================================================================
// Runtime Events
// =============================================================================

/// An event delivered to a sandboxed program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// First event after compilation; runs the program's init handler.
    Init,
    /// One inbound message for the program's message handler.
    Message(String),
}

impl RuntimeEvent {
    /// Encodes the event as a wire frame.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if a message payload exceeds [`MAX_FRAME_PAYLOAD`].
    pub fn to_frame(&self) -> Result<Frame> {
        match self {
            Self::Init => Frame::new(FRAME_KIND_INIT, Vec::new()),
            Self::Message(text) => Frame::new(FRAME_KIND_MESSAGE, text.as_bytes()),
        }
    }
}

/// Encodes the language-selector frame sent ahead of the init event.
pub fn language_frame(language_name: &str) -> Result<Frame> {
    Frame::new(FRAME_KIND_LANGUAGE, language_name.as_bytes())
}

/// Returns true if `byte` is the reserved response terminator.
pub fn is_terminator(byte: u8) -> bool {
    byte == RESPONSE_TERMINATOR
}
