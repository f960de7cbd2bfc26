//! Session terminal.
//!
//! One [`SessionTerminal`] owns one attach stream for the duration of one
//! operation against a running instance. Outbound frames are queued with
//! [`issue_write`] and flushed in a single write by [`read_to_end`], which
//! then waits for the completion protocol: the sandboxed process writes the
//! reserved terminator byte as the final byte of its primary output once it
//! has finished responding to one event.
//!
//! A terminator observed anywhere but as the last byte of a received chunk
//! is a protocol violation and fails the whole operation — the terminal
//! never assumes a mid-chunk terminator is followed by more of the same
//! response. Diagnostic bytes accumulate independently, unterminated,
//! best-effort. The wait is bounded by a wall-clock timeout; on expiry the
//! failure carries whatever partial output was buffered.
//!
//! [`issue_write`]: SessionTerminal::issue_write
//! [`read_to_end`]: SessionTerminal::read_to_end

use crate::error::{Error, Result};
use crate::protocol::{is_terminator, Frame};
use crate::provider::AttachStream;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Read-buffer size for both stream halves.
const READ_CHUNK: usize = 4096;

// =============================================================================
// Exchange
// =============================================================================

/// The two output halves of one completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Primary output, terminator stripped.
    pub output: String,
    /// Diagnostic output, as much as arrived before completion.
    pub diagnostics: String,
}

// =============================================================================
// Session Terminal
// =============================================================================

/// Drives one request/response exchange over one attach stream.
pub struct SessionTerminal {
    stream: AttachStream,
    pending: Vec<u8>,
}

impl SessionTerminal {
    /// Wraps a freshly attached stream.
    pub fn new(stream: AttachStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    /// Queues one frame for the next flush.
    ///
    /// Multiple frames may be queued before one [`read_to_end`]; they are
    /// written back-to-back in queue order.
    ///
    /// [`read_to_end`]: SessionTerminal::read_to_end
    pub fn issue_write(&mut self, frame: &Frame) {
        self.pending.extend_from_slice(&frame.encode());
    }

    /// Flushes all queued frames, then awaits the completion terminator.
    ///
    /// Consumes the terminal: the stream is good for exactly one exchange.
    /// The write side is shut down on every exit path, success or failure,
    /// so the peer never waits on a half-open stream.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] for a mid-chunk terminator or an output stream
    /// that closes without one; [`Error::Timeout`] (carrying the partial
    /// output and diagnostics) when the window expires.
    pub async fn read_to_end(mut self, timeout: Duration) -> Result<Exchange> {
        let result = self.exchange(timeout).await;
        let _ = self.stream.writer.shutdown().await;
        result
    }

    async fn exchange(&mut self, timeout: Duration) -> Result<Exchange> {
        self.stream.writer.write_all(&self.pending).await?;
        self.stream.writer.flush().await?;

        let deadline = Instant::now() + timeout;
        let mut output: Vec<u8> = Vec::new();
        let mut diagnostics: Vec<u8> = Vec::new();
        let mut out_buf = [0u8; READ_CHUNK];
        let mut diag_buf = [0u8; READ_CHUNK];
        let mut diag_open = true;

        loop {
            tokio::select! {
                read = self.stream.output.read(&mut out_buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(Error::Protocol(
                            "output stream closed before terminator".to_string(),
                        ));
                    }
                    let chunk = &out_buf[..n];
                    match chunk.iter().position(|&b| is_terminator(b)) {
                        Some(pos) if pos == n - 1 => {
                            output.extend_from_slice(&chunk[..pos]);
                            if diag_open {
                                drain_buffered(&mut self.stream.diagnostic, &mut diagnostics)
                                    .await;
                            }
                            return Ok(Exchange {
                                output: into_text(output),
                                diagnostics: into_text(diagnostics),
                            });
                        }
                        Some(_) => {
                            return Err(Error::Protocol(
                                "terminator is not the final byte of its chunk".to_string(),
                            ));
                        }
                        None => output.extend_from_slice(chunk),
                    }
                }
                read = self.stream.diagnostic.read(&mut diag_buf), if diag_open => {
                    match read {
                        Ok(0) | Err(_) => diag_open = false,
                        Ok(n) => diagnostics.extend_from_slice(&diag_buf[..n]),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout {
                        duration: timeout,
                        output: into_text(output),
                        diagnostics: into_text(diagnostics),
                    });
                }
            }
        }
    }
}

/// Picks up diagnostic bytes that arrived before completion but were not
/// yet polled. Never waits: only already-buffered data is taken.
async fn drain_buffered<R: AsyncRead + Unpin>(diag: &mut R, into: &mut Vec<u8>) {
    let mut buf = [0u8; READ_CHUNK];
    while let Ok(Ok(n)) = tokio::time::timeout(Duration::ZERO, diag.read(&mut buf)).await {
        if n == 0 {
            break;
        }
        into.extend_from_slice(&buf[..n]);
    }
}

fn into_text(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}
