//! Pending question and permission broker.
//!
//! Each question or permission request raised by a session gets a
//! correlation id and a single-fire resolver with a fixed deadline. A waiter
//! task per request awaits the operator (or the deadline) and writes the
//! matching `control_response` back to the session's process. Resolving,
//! expiring, and force-rejecting all remove the entry exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::models::pending::{PendingKind, PendingSummary, PermissionDecision};
use crate::process::writer;
use crate::session::Session;
use crate::{AppError, Result};

/// Operator input that resolves a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Free-text answer to a question.
    Answer(String),
    /// Decision on a permission request.
    Decision(PermissionDecision),
}

#[derive(Debug)]
enum Outcome {
    Resolved(Resolution),
    Rejected(String),
}

/// Process-side details needed to answer a request.
#[derive(Debug, Clone)]
pub enum PendingRequest {
    /// An `AskUserQuestion` request.
    Question {
        /// Process control request id.
        request_id: String,
        /// Question text.
        question: String,
        /// Original tool input.
        input: Value,
    },
    /// A `can_use_tool` request for any other tool.
    Permission {
        /// Process control request id.
        request_id: String,
        /// Tool awaiting permission.
        tool_name: String,
        /// Tool input.
        tool_input: Value,
    },
}

impl PendingRequest {
    fn kind(&self) -> PendingKind {
        match self {
            Self::Question { .. } => PendingKind::Question,
            Self::Permission { .. } => PendingKind::Permission,
        }
    }

    fn subject(&self) -> &str {
        match self {
            Self::Question { question, .. } => question,
            Self::Permission { tool_name, .. } => tool_name,
        }
    }

    fn response(&self, outcome: &Outcome) -> Value {
        match (self, outcome) {
            (
                Self::Question {
                    request_id,
                    question,
                    input,
                },
                Outcome::Resolved(Resolution::Answer(answer)),
            ) => writer::answer_response(request_id, input, question, answer),
            (
                Self::Permission {
                    request_id,
                    tool_input,
                    ..
                },
                Outcome::Resolved(Resolution::Decision(decision)),
            ) if decision.is_allow() => writer::allow_response(request_id, tool_input.clone()),
            (Self::Question { request_id, .. } | Self::Permission { request_id, .. }, Outcome::Rejected(reason)) => {
                writer::deny_response(request_id, reason)
            }
            (Self::Question { request_id, .. } | Self::Permission { request_id, .. }, Outcome::Resolved(_)) => {
                writer::deny_response(request_id, "The operator denied this request.")
            }
        }
    }
}

/// A resolved entry, returned to the caller of [`PendingBroker::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    /// Owning session.
    pub session_id: String,
    /// Request kind.
    pub kind: PendingKind,
    /// Question text or tool name.
    pub subject: String,
}

#[derive(Debug)]
struct PendingEntry {
    session_id: String,
    kind: PendingKind,
    subject: String,
    deadline: Instant,
    expires_at: chrono::DateTime<Utc>,
    resolver: oneshot::Sender<Outcome>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingEntry>>>;

/// Registry of unresolved questions and permission requests.
#[derive(Debug, Clone)]
pub struct PendingBroker {
    entries: PendingMap,
    timeout: Duration,
}

impl PendingBroker {
    /// Create a broker whose requests expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Register `request` raised by `session` and return its correlation id.
    ///
    /// The response is written to the session once the request is resolved,
    /// expires, or is force-rejected.
    pub async fn register(&self, session: Arc<Session>, request: PendingRequest) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        let session_id = session.id().to_owned();

        self.entries.lock().await.insert(
            correlation_id.clone(),
            PendingEntry {
                session_id: session_id.clone(),
                kind: request.kind(),
                subject: request.subject().to_owned(),
                deadline: Instant::now() + self.timeout,
                expires_at: Utc::now()
                    + chrono::Duration::from_std(self.timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                resolver: tx,
            },
        );

        let entries = Arc::clone(&self.entries);
        let timeout = self.timeout;
        let id = correlation_id.clone();
        let span = info_span!("pending_request", session_id, correlation_id = %id);

        tokio::spawn(
            async move {
                let outcome = match tokio::time::timeout(timeout, &mut rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Outcome::Rejected("request abandoned".into()),
                    Err(_elapsed) => {
                        if entries.lock().await.remove(&id).is_some() {
                            info!("pending request expired");
                            Outcome::Rejected("No response from the operator in time.".into())
                        } else {
                            // Resolved concurrently with the deadline.
                            rx.await
                                .unwrap_or_else(|_| Outcome::Rejected("request abandoned".into()))
                        }
                    }
                };

                let response = request.response(&outcome);
                if let Err(err) = session.respond(response).await {
                    debug!(%err, "could not deliver pending response to process");
                }
            }
            .instrument(span),
        );

        correlation_id
    }

    /// Resolve the request `correlation_id` owned by `session_id`.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for unknown, expired, or already-resolved ids,
    ///   or ids owned by another session.
    /// - `AppError::StateConflict` when `resolution` does not fit the request
    ///   kind (an answer for a permission request or vice versa).
    pub async fn resolve(
        &self,
        session_id: &str,
        correlation_id: &str,
        resolution: Resolution,
    ) -> Result<ResolvedRequest> {
        let mut entries = self.entries.lock().await;

        let not_found = || AppError::NotFound(format!("no pending request {correlation_id}"));
        let (kind, deadline) = match entries.get(correlation_id) {
            Some(entry) if entry.session_id == session_id => (entry.kind, entry.deadline),
            _ => return Err(not_found()),
        };

        if deadline <= Instant::now() {
            if let Some(entry) = entries.remove(correlation_id) {
                let _ = entry
                    .resolver
                    .send(Outcome::Rejected("No response from the operator in time.".into()));
            }
            return Err(not_found());
        }

        match (kind, &resolution) {
            (PendingKind::Question, Resolution::Answer(_))
            | (PendingKind::Permission, Resolution::Decision(_)) => {}
            (PendingKind::Question, Resolution::Decision(_)) => {
                return Err(AppError::StateConflict(format!(
                    "{correlation_id} is a question; answer it with text"
                )));
            }
            (PendingKind::Permission, Resolution::Answer(_)) => {
                return Err(AppError::StateConflict(format!(
                    "{correlation_id} is a permission request; respond with a decision"
                )));
            }
        }

        let entry = entries.remove(correlation_id).ok_or_else(not_found)?;
        drop(entries);

        if entry.resolver.send(Outcome::Resolved(resolution)).is_err() {
            warn!(session_id, correlation_id, "pending waiter already gone");
        }
        info!(session_id, correlation_id, "pending request resolved");

        Ok(ResolvedRequest {
            session_id: entry.session_id,
            kind: entry.kind,
            subject: entry.subject,
        })
    }

    /// Force-reject every request owned by `session_id`.
    pub async fn reject_for_session(&self, session_id: &str) -> usize {
        let rejected: Vec<PendingEntry> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        Self::reject(rejected, "Session terminated.")
    }

    /// Force-reject every request.
    pub async fn reject_all(&self) -> usize {
        let rejected: Vec<PendingEntry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        Self::reject(rejected, "Orchestrator shutting down.")
    }

    /// Unresolved requests, optionally for one session, soonest expiry first.
    pub async fn list(&self, session_id: Option<&str>) -> Vec<PendingSummary> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut summaries: Vec<PendingSummary> = entries
            .iter()
            .filter(|(_, entry)| session_id.is_none_or(|sid| entry.session_id == sid))
            .map(|(id, entry)| PendingSummary {
                id: id.clone(),
                session_id: entry.session_id.clone(),
                kind: entry.kind,
                subject: entry.subject.clone(),
                expires_at: entry.expires_at,
                remaining_seconds: entry.deadline.saturating_duration_since(now).as_secs(),
            })
            .collect();
        summaries.sort_by_key(|summary| summary.expires_at);
        summaries
    }

    /// Number of unresolved requests.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no requests are unresolved.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn reject(entries: Vec<PendingEntry>, reason: &str) -> usize {
        let count = entries.len();
        for entry in entries {
            debug!(session_id = entry.session_id, "force-rejecting pending request");
            let _ = entry.resolver.send(Outcome::Rejected(reason.to_owned()));
        }
        count
    }
}
