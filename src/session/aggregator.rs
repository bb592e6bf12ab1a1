//! Time-windowed aggregation of partial text fragments.
//!
//! Fragments append to one buffer. The first fragment into an empty buffer
//! arms a single deadline; the owner flushes when the deadline passes or
//! before emitting any structured event. A fragment of a different kind
//! flushes the buffer first so text and thinking never interleave.

use std::time::Duration;

use tokio::time::Instant;

/// What a buffered fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Assistant reply text.
    Text,
    /// Reasoning text.
    Thinking,
}

/// A flushed run of fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed {
    /// Kind shared by every fragment in the run.
    pub kind: FragmentKind,
    /// Concatenated fragments.
    pub content: String,
}

/// Buffers fragments for at most one window.
#[derive(Debug)]
pub struct TextAggregator {
    window: Duration,
    kind: FragmentKind,
    buffer: String,
    deadline: Option<Instant>,
}

impl TextAggregator {
    /// Create an aggregator that flushes `window` after the first fragment.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            kind: FragmentKind::Text,
            buffer: String::new(),
            deadline: None,
        }
    }

    /// Append a fragment.
    ///
    /// Returns the previous run when `kind` differs from the buffered kind.
    pub fn push(&mut self, kind: FragmentKind, fragment: &str) -> Option<Flushed> {
        if fragment.is_empty() {
            return None;
        }

        let previous = if self.kind == kind {
            None
        } else {
            self.flush()
        };

        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
        self.kind = kind;
        self.buffer.push_str(fragment);
        previous
    }

    /// Drain the buffer and disarm the deadline.
    pub fn flush(&mut self) -> Option<Flushed> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        Some(Flushed {
            kind: self.kind,
            content: std::mem::take(&mut self.buffer),
        })
    }

    /// When the buffered run must be flushed, if anything is buffered.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
