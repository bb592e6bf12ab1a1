//! Line framing for agent process stdout.
//!
//! Splits the byte stream on `\n` into [`Frame`]s. A line longer than the
//! limit is dropped through its terminating newline and surfaces as
//! [`Frame::Oversized`] instead of a decode error: `FramedRead` stops
//! yielding after any decoder error, and one bad line must not end the
//! session.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::AppError;

/// Maximum line length accepted from an agent process: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One framed unit of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator, lossily decoded as UTF-8.
    Line(String),
    /// A line over the limit was discarded.
    Oversized {
        /// Bytes dropped, including the terminator when present.
        discarded: usize,
    },
}

/// Newline framer with a per-line length limit.
#[derive(Debug)]
pub struct StreamCodec {
    max_len: usize,
    /// Offset already scanned for a newline in the buffered partial line.
    scanned: usize,
    /// Bytes dropped so far from an oversized line; `Some` while discarding.
    discarding: Option<usize>,
}

impl StreamCodec {
    /// Codec with the [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec rejecting lines longer than `max_len` bytes.
    #[must_use]
    pub fn with_max_length(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
            discarding: None,
        }
    }

    fn take_line(&mut self, src: &mut BytesMut, len: usize) -> Frame {
        let raw = src.split_to(len);
        self.scanned = 0;
        let mut line: &[u8] = &raw;
        if let Some(stripped) = line.strip_suffix(b"\n") {
            line = stripped;
        }
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        Frame::Line(String::from_utf8_lossy(line).into_owned())
    }
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StreamCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AppError> {
        loop {
            if let Some(dropped) = self.discarding {
                return Ok(match src.iter().position(|b| *b == b'\n') {
                    Some(end) => {
                        src.advance(end + 1);
                        self.discarding = None;
                        Some(Frame::Oversized {
                            discarded: dropped + end + 1,
                        })
                    }
                    None => {
                        self.discarding = Some(dropped + src.len());
                        src.clear();
                        None
                    }
                });
            }

            // A newline past max_len means the line is already too long.
            let window = src.len().min(self.max_len.saturating_add(1));
            let newline = src[self.scanned.min(window)..window]
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| self.scanned + i);

            match newline {
                Some(end) => return Ok(Some(self.take_line(src, end + 1))),
                None if src.len() > self.max_len => {
                    self.scanned = 0;
                    self.discarding = Some(0);
                }
                None => {
                    self.scanned = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AppError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if let Some(discarded) = self.discarding.take() {
            return Ok(Some(Frame::Oversized { discarded }));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let len = src.len();
        Ok(Some(self.take_line(src, len)))
    }
}
