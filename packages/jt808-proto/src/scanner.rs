//! scanner.rs — buffering frame extractor for a TCP byte stream.
//!
//! Reads arrive in arbitrary chunks; the scanner accumulates them and yields
//! complete `0x7E … 0x7E` spans. Garbage before a frame start is discarded
//! with a warning, an incomplete suffix is retained for the next read, and a
//! buffer that grows past the cap without completing a frame kills the
//! session upstream.

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use crate::error::ScanError;
use crate::frame::FRAME_DELIMITER;

/// Hard cap on buffered bytes per connection.
pub const MAX_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: BytesMut,
    garbage_bytes: u64,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the socket.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), ScanError> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFER {
            return Err(ScanError::OversizeBuffer { max: MAX_BUFFER });
        }
        Ok(())
    }

    /// Pull the next complete frame span (delimiters included) out of the
    /// buffer, or `None` if more bytes are needed. Drain in a loop after
    /// each [`extend`](Self::extend).
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.buf.iter().position(|&b| b == FRAME_DELIMITER) {
                None => {
                    if !self.buf.is_empty() {
                        self.garbage_bytes += self.buf.len() as u64;
                        warn!(bytes = self.buf.len(), "discarding bytes with no frame start");
                        self.buf.clear();
                    }
                    return None;
                }
                Some(0) => {}
                Some(n) => {
                    self.garbage_bytes += n as u64;
                    warn!(bytes = n, "discarding garbage before frame start");
                    self.buf.advance(n);
                }
            }

            let end = self.buf[1..]
                .iter()
                .position(|&b| b == FRAME_DELIMITER)
                .map(|p| p + 1)?;

            if end == 1 {
                // empty 0x7E 0x7E run; the second delimiter may open a real frame
                self.buf.advance(1);
                continue;
            }
            return Some(self.buf.split_to(end + 1).freeze());
        }
    }

    /// Total garbage discarded over the connection's lifetime.
    pub fn garbage_bytes(&self) -> u64 {
        self.garbage_bytes
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
