//! Supervised event delivery from a session to its subscriber.
//!
//! Every session owns one bounded queue drained by a single worker task.
//! The processing loop enqueues without waiting; the worker hands events to
//! the [`EventSink`] one at a time, so per-session order is kept. Each
//! delivery is caught individually, including panics, and consecutive
//! failures are counted as a health signal.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::event::{EventKind, SessionEvent};
use crate::{AppError, Result};

/// Queue depth per session.
pub const EMIT_QUEUE_CAPACITY: usize = 4096;

/// Receives every event a session emits.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Any error is counted as a delivery failure and otherwise ignored.
    fn deliver(&self, event: SessionEvent) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn deliver(&self, event: SessionEvent) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let sent = self
            .send(event)
            .map_err(|_| AppError::Internal("event subscriber dropped".into()));
        Box::pin(async move { sent })
    }
}

/// Enqueue side of a session's event queue.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    session_id: String,
    tx: mpsc::Sender<SessionEvent>,
}

impl EventEmitter {
    /// Start the delivery worker for `session_id`.
    ///
    /// The worker exits once every emitter clone is dropped and the queue
    /// is drained.
    #[must_use]
    pub fn spawn(
        session_id: impl Into<String>,
        sink: Arc<dyn EventSink>,
        failure_threshold: u32,
    ) -> (Self, JoinHandle<()>) {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::channel(EMIT_QUEUE_CAPACITY);
        let handle = tokio::spawn(run_worker(session_id.clone(), rx, sink, failure_threshold));
        (Self { session_id, tx }, handle)
    }

    /// Stamp and enqueue `kind` without waiting.
    pub fn emit(&self, kind: EventKind) {
        let event = SessionEvent::now(self.session_id.clone(), kind);
        if let Err(err) = self.tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(event) => warn!(
                    session_id = self.session_id,
                    event_type = event.kind.type_name(),
                    "event queue full, dropping event"
                ),
                mpsc::error::TrySendError::Closed(event) => debug!(
                    session_id = self.session_id,
                    event_type = event.kind.type_name(),
                    "event worker stopped, dropping event"
                ),
            }
        }
    }
}

async fn run_worker(
    session_id: String,
    mut rx: mpsc::Receiver<SessionEvent>,
    sink: Arc<dyn EventSink>,
    failure_threshold: u32,
) {
    let mut streak: u32 = 0;

    while let Some(event) = rx.recv().await {
        let event_type = event.kind.type_name();
        let outcome = AssertUnwindSafe(sink.deliver(event)).catch_unwind().await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some("subscriber panicked".to_owned()),
        };

        match failure {
            None => {
                if streak >= failure_threshold {
                    info!(session_id, failures = streak, "event delivery recovered");
                }
                streak = 0;
            }
            Some(reason) => {
                streak = streak.saturating_add(1);
                debug!(session_id, event_type, %reason, "event delivery failed");
                if streak == failure_threshold {
                    warn!(
                        session_id,
                        failures = streak,
                        %reason,
                        "event delivery failing repeatedly"
                    );
                }
            }
        }
    }

    debug!(session_id, "event worker drained, stopping");
}
