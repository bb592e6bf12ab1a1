//! Bounded multi-session registry.
//!
//! [`SessionManager`] creates, drives, and terminates sessions; brokers
//! their questions and permission requests; mirrors the live session set
//! into the lock record after every registry mutation; keeps a bounded
//! output history per session; and forwards events to the webhook relay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::event::{EndReason, EventKind, SessionEvent};
use crate::models::lock::LockRecord;
use crate::models::pending::{PendingKind, PendingSummary, PermissionDecision};
use crate::models::session::{PermissionMode, SessionInfo, SessionStatus};
use crate::orchestrator::pending::{PendingBroker, PendingRequest, Resolution};
use crate::orchestrator::recovery::{self, RecoveryReport};
use crate::process::{writer, AgentLauncher, LaunchSpec};
use crate::session::emitter::EventSink;
use crate::session::{Session, SessionOptions};
use crate::webhook::{WebhookDeliveryService, WebhookEvent};
use crate::workspace::{self, FileContent, FileEntry, FileStat};
use crate::{AppError, Result};

/// Parameters of `create_session`.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    /// Working directory relative to the new workspace; `.` when absent.
    pub cwd: Option<String>,
    /// Tools the agent may run without asking; empty means unrestricted.
    pub execution_targets: Vec<String>,
    /// Initial permission mode.
    pub mode: PermissionMode,
}

/// A page of a session's output history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputPage {
    /// Index of the first returned entry.
    pub offset: usize,
    /// Entries from `offset` on.
    pub entries: Vec<String>,
    /// Offset to pass to read only newer entries.
    pub next_offset: usize,
    /// Entries before `offset` that were evicted from the history.
    pub dropped: usize,
}

/// Result of [`SessionManager::shutdown`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Sessions terminated cleanly.
    pub terminated: usize,
    /// Sessions that did not finish terminating in time.
    pub timed_out: usize,
    /// Pending requests force-rejected.
    pub rejected: usize,
}

#[derive(Debug)]
struct History {
    lines: VecDeque<String>,
    first_index: usize,
    limit: usize,
}

impl History {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            first_index: 0,
            limit: limit.max(1),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.limit {
            self.lines.pop_front();
            self.first_index += 1;
        }
        self.lines.push_back(line);
    }

    fn page(&self, offset: usize) -> OutputPage {
        let start = offset.max(self.first_index);
        let skip = start - self.first_index;
        OutputPage {
            offset: start,
            entries: self.lines.iter().skip(skip).cloned().collect(),
            next_offset: self.first_index + self.lines.len(),
            dropped: self.first_index.saturating_sub(offset),
        }
    }
}

struct ManagerInner {
    config: GlobalConfig,
    options: SessionOptions,
    launcher: Arc<dyn AgentLauncher>,
    webhook: WebhookDeliveryService,
    pending: PendingBroker,
    started_at: DateTime<Utc>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// Slots held by creates that are still launching; read under `sessions`.
    starting: AtomicUsize,
    history: Mutex<HashMap<String, History>>,
    grants: Mutex<HashSet<(String, String)>>,
    closing: AtomicBool,
    shutdown: OnceCell<ShutdownReport>,
}

/// A capacity slot claimed by an in-flight create; released on drop.
struct SlotReservation<'a> {
    starting: &'a AtomicUsize,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.starting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns every live session. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("workspace_root", &self.inner.config.workspace_root)
            .field("max_sessions", &self.inner.config.max_concurrent_sessions)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over `launcher`, relaying events to `webhook`.
    #[must_use]
    pub fn new(
        config: GlobalConfig,
        launcher: Arc<dyn AgentLauncher>,
        webhook: WebhookDeliveryService,
    ) -> Self {
        let options = SessionOptions::from_config(&config.stream);
        let pending = PendingBroker::new(config.question_timeout());
        Self {
            inner: Arc::new(ManagerInner {
                config,
                options,
                launcher,
                webhook,
                pending,
                started_at: Utc::now(),
                sessions: Mutex::new(HashMap::new()),
                starting: AtomicUsize::new(0),
                history: Mutex::new(HashMap::new()),
                grants: Mutex::new(HashSet::new()),
                closing: AtomicBool::new(false),
                shutdown: OnceCell::new(),
            }),
        }
    }

    /// Run orphan recovery for the workspace root. Call once before serving.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the root cannot be scanned or the fresh lock
    /// record cannot be written.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = recovery::recover_orphans(self.workspace_root())?;
        info!(
            previous_pid = report.previous_pid,
            owner_alive = report.owner_alive,
            removed = report.removed.len(),
            "orphan recovery complete"
        );
        Ok(report)
    }

    /// Workspace root all session workspaces live under.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        self.inner.config.workspace_root()
    }

    /// Webhook relay events are forwarded to.
    #[must_use]
    pub fn webhook(&self) -> &WebhookDeliveryService {
        &self.inner.webhook
    }

    /// Create a session in a fresh workspace and start its process.
    ///
    /// A capacity slot is reserved up front; the registry lock is not held
    /// while the process launches, so other commands proceed meanwhile.
    ///
    /// # Errors
    ///
    /// - `AppError::Capacity` once `max_concurrent_sessions` are live or
    ///   starting; the registry is left untouched.
    /// - `AppError::PathViolation` if `cwd` leaves the workspace.
    /// - `AppError::Process` if the process cannot be started.
    /// - `AppError::StateConflict` if shutdown began during the launch.
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionInfo> {
        self.ensure_open()?;
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("create_session", session_id);

        async {
            let _slot = self.reserve_slot().await?;

            let workspace = self.workspace_root().join(&session_id);
            tokio::fs::create_dir_all(&workspace).await?;
            let cwd = match prepare_cwd(&workspace, request.cwd.as_deref()).await {
                Ok(cwd) => cwd,
                Err(err) => {
                    discard_workspace(&workspace).await;
                    return Err(err);
                }
            };

            let spec = LaunchSpec {
                session_id: session_id.clone(),
                cwd,
                permission_mode: request.mode,
                allowed_tools: request.execution_targets,
            };
            let sink: Arc<dyn EventSink> = Arc::new(RelaySink {
                manager: self.clone(),
                session_id: session_id.clone(),
            });

            let session = match Session::start(
                &spec,
                workspace.clone(),
                self.inner.launcher.as_ref(),
                sink,
                &self.inner.options,
            )
            .await
            {
                Ok(session) => Arc::new(session),
                Err(err) => {
                    discard_workspace(&workspace).await;
                    return Err(err);
                }
            };

            let mut sessions = self.inner.sessions.lock().await;
            if self.ensure_open().is_err() {
                drop(sessions);
                warn!("shutdown began while the session was starting");
                if let Err(err) = session.terminate().await {
                    debug!(%err, "failed to stop unregistered session");
                }
                discard_workspace(&workspace).await;
                return Err(AppError::StateConflict("session manager is shutting down".into()));
            }

            self.inner
                .history
                .lock()
                .await
                .insert(session_id.clone(), History::new(self.inner.config.history_limit));
            sessions.insert(session_id.clone(), Arc::clone(&session));
            self.persist_lock(&sessions).await;

            info!(live = sessions.len(), "session created");
            drop(sessions);

            // Died before it was registered, so the relay could not retire it.
            if session.status().await == SessionStatus::Terminated {
                self.retire_failed(&session_id);
            }
            Ok(session.get_info().await)
        }
        .instrument(span)
        .await
    }

    /// Send a prompt to session `id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown ids, otherwise as [`Session::send_prompt`].
    pub async fn send_prompt(&self, id: &str, text: &str) -> Result<()> {
        let session = self.session(id).await?;
        session.send_prompt(text).await?;
        self.record(id, format!("[prompt] {text}")).await;
        Ok(())
    }

    /// Send a slash command to session `id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown ids, otherwise as
    /// [`Session::send_slash_command`].
    pub async fn send_slash_command(&self, id: &str, name: &str, args: Option<&str>) -> Result<()> {
        let session = self.session(id).await?;
        session.send_slash_command(name, args).await?;
        self.record(id, format!("[command] /{} {}", name.trim_start_matches('/'), args.unwrap_or_default()))
            .await;
        Ok(())
    }

    /// Interrupt the current turn of session `id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown ids, otherwise as [`Session::cancel`].
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.session(id).await?.cancel().await
    }

    /// Change the permission mode of session `id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown ids, otherwise as
    /// [`Session::set_permission_mode`].
    pub async fn set_mode(&self, id: &str, mode: PermissionMode) -> Result<()> {
        self.session(id).await?.set_permission_mode(mode).await
    }

    /// Answer question `question_id` raised by session `id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown, expired, or already-answered ids.
    pub async fn answer_question(&self, id: &str, question_id: &str, text: &str) -> Result<()> {
        self.inner
            .pending
            .resolve(id, question_id, Resolution::Answer(text.to_owned()))
            .await?;
        self.record(id, format!("[answer] {text}")).await;
        Ok(())
    }

    /// Decide permission request `permission_id` raised by session `id`.
    ///
    /// `allow_always` additionally records a standing grant: later requests
    /// for the same tool in this session are allowed without asking.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown, expired, or already-decided ids.
    pub async fn respond_permission(
        &self,
        id: &str,
        permission_id: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        let resolved = self
            .inner
            .pending
            .resolve(id, permission_id, Resolution::Decision(decision))
            .await?;

        if decision == PermissionDecision::AllowAlways && resolved.kind == PendingKind::Permission {
            info!(session_id = id, tool = resolved.subject, "standing grant recorded");
            self.inner
                .grants
                .lock()
                .await
                .insert((id.to_owned(), resolved.subject.clone()));
        }
        self.record(id, format!("[permission] {} {decision:?}", resolved.subject))
            .await;
        Ok(())
    }

    /// Terminate session `id`: remove it, reject its pending requests, and
    /// stop its process. The workspace directory is kept.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown or already-terminated ids.
    pub async fn terminate_session(&self, id: &str) -> Result<()> {
        let span = info_span!("terminate_session", session_id = id);

        async {
            let session = {
                let mut sessions = self.inner.sessions.lock().await;
                let session = sessions
                    .remove(id)
                    .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
                self.persist_lock(&sessions).await;
                session
            };

            let rejected = self.inner.pending.reject_for_session(id).await;
            self.inner.grants.lock().await.retain(|(sid, _)| sid != id);
            self.inner.history.lock().await.remove(id);

            match tokio::time::timeout(self.inner.config.terminate_timeout(), session.terminate()).await {
                Ok(result) => result?,
                Err(_elapsed) => warn!("session did not terminate in time"),
            }

            info!(rejected, "session removed");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Snapshots of every live session, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.get_info().await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Ids of every live session.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of session `id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown ids.
    pub async fn get_info(&self, id: &str) -> Result<SessionInfo> {
        Ok(self.session(id).await?.get_info().await)
    }

    /// Output history of session `id` from `offset` on.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown ids.
    pub async fn read_output(&self, id: &str, offset: Option<usize>) -> Result<OutputPage> {
        self.inner
            .history
            .lock()
            .await
            .get(id)
            .map(|history| history.page(offset.unwrap_or(0)))
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// Unresolved questions and permission requests, optionally for one session.
    pub async fn list_pending(&self, id: Option<&str>) -> Vec<PendingSummary> {
        self.inner.pending.list(id).await
    }

    /// Read a file in the workspace of session `id`.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` for unknown workspaces, otherwise as
    /// [`workspace::read_file`].
    pub async fn read_file(&self, id: &str, path: &str) -> Result<FileContent> {
        workspace::read_file(&self.workspace_of(id).await?, path).await
    }

    /// List a directory in the workspace of session `id`.
    ///
    /// # Errors
    ///
    /// As [`SessionManager::read_file`].
    pub async fn list_files(&self, id: &str, path: &str) -> Result<Vec<FileEntry>> {
        workspace::list_files(&self.workspace_of(id).await?, path).await
    }

    /// Stat a path in the workspace of session `id`.
    ///
    /// # Errors
    ///
    /// As [`SessionManager::read_file`].
    pub async fn stat_file(&self, id: &str, path: &str) -> Result<FileStat> {
        workspace::stat_file(&self.workspace_of(id).await?, path).await
    }

    /// Terminate idle sessions past the idle timeout, and sessions whose
    /// process already failed. Each termination is individually bounded.
    /// Returns the ids terminated.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_timeout = self.inner.config.idle_timeout();
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().await.values().cloned().collect();

        let mut candidates = Vec::new();
        for session in sessions {
            let reap = match session.status().await {
                SessionStatus::Idle => session.idle_for().await >= idle_timeout,
                SessionStatus::Terminated => true,
                SessionStatus::Active => false,
            };
            if reap {
                candidates.push(session.id().to_owned());
            }
        }

        let bound = self.inner.config.terminate_timeout() + Duration::from_secs(1);
        let results = join_all(candidates.iter().map(|id| async move {
            match tokio::time::timeout(bound, self.terminate_session(id)).await {
                Ok(Ok(())) => {
                    info!(session_id = id, "reaped idle session");
                    true
                }
                Ok(Err(err)) => {
                    debug!(session_id = id, %err, "idle session already gone");
                    false
                }
                Err(_elapsed) => {
                    warn!(session_id = id, "reaping session timed out");
                    false
                }
            }
        }))
        .await;

        candidates
            .into_iter()
            .zip(results)
            .filter_map(|(id, reaped)| reaped.then_some(id))
            .collect()
    }

    /// Terminate every session in parallel, reject all pending requests, and
    /// delete the lock record. Concurrent and repeated calls share one result.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner
            .shutdown
            .get_or_init(|| async {
                let span = info_span!("shutdown");
                async {
                    self.inner.closing.store(true, Ordering::SeqCst);

                    let sessions: Vec<Arc<Session>> = {
                        let mut sessions = self.inner.sessions.lock().await;
                        let drained = sessions.drain().map(|(_, s)| s).collect();
                        self.persist_lock(&sessions).await;
                        drained
                    };

                    let rejected = self.inner.pending.reject_all().await;
                    let bound = self.inner.config.terminate_timeout();
                    let outcomes = join_all(sessions.iter().map(|session| async move {
                        match tokio::time::timeout(bound, session.terminate()).await {
                            Ok(_) => true,
                            Err(_elapsed) => {
                                warn!(session_id = session.id(), "session did not terminate in time");
                                false
                            }
                        }
                    }))
                    .await;

                    self.inner.grants.lock().await.clear();
                    if let Err(err) = recovery::remove_lock(self.workspace_root()) {
                        warn!(%err, "failed to remove lock record");
                    }

                    let terminated = outcomes.iter().filter(|ok| **ok).count();
                    let report = ShutdownReport {
                        terminated,
                        timed_out: outcomes.len() - terminated,
                        rejected,
                    };
                    info!(
                        terminated = report.terminated,
                        timed_out = report.timed_out,
                        rejected = report.rejected,
                        "session manager shut down"
                    );
                    report
                }
                .instrument(span)
                .await
            })
            .await
            .clone()
    }

    async fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    async fn workspace_of(&self, id: &str) -> Result<PathBuf> {
        if let Some(session) = self.inner.sessions.lock().await.get(id) {
            return Ok(session.workspace().to_path_buf());
        }
        // Workspaces outlive their sessions.
        if Uuid::parse_str(id).is_ok() {
            let dir = self.workspace_root().join(id);
            if tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
                return Ok(dir);
            }
        }
        Err(AppError::NotFound(format!("workspace {id} not found")))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(AppError::StateConflict("session manager is shutting down".into()));
        }
        Ok(())
    }

    /// Claim a capacity slot, counting live sessions and in-flight creates.
    async fn reserve_slot(&self) -> Result<SlotReservation<'_>> {
        let sessions = self.inner.sessions.lock().await;
        let max = self.inner.config.max_concurrent_sessions;
        let starting = self.inner.starting.load(Ordering::SeqCst);
        if sessions.len() + starting >= max {
            warn!(live = sessions.len(), starting, max, "session capacity reached");
            return Err(AppError::Capacity(format!(
                "maximum concurrent sessions ({max}) reached"
            )));
        }
        self.inner.starting.fetch_add(1, Ordering::SeqCst);
        Ok(SlotReservation {
            starting: &self.inner.starting,
        })
    }

    /// Mirror `sessions` into the lock record. Callers hold the registry
    /// lock, so writes land in mutation order. The file I/O runs on the
    /// blocking pool. Failures are logged; the next mutation rewrites the
    /// record in full.
    async fn persist_lock(&self, sessions: &HashMap<String, Arc<Session>>) {
        let mut session_ids: Vec<String> = sessions.keys().cloned().collect();
        session_ids.sort();
        let record = LockRecord {
            pid: std::process::id(),
            started_at: self.inner.started_at,
            session_ids,
        };
        let root = self.workspace_root().to_path_buf();
        match tokio::task::spawn_blocking(move || recovery::write_lock(&root, &record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "failed to persist lock record"),
            Err(err) => warn!(%err, "lock record writer task failed"),
        }
    }

    /// Deregister a session whose process failed, off the event path.
    fn retire_failed(&self, session_id: &str) {
        let manager = self.clone();
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            match manager.terminate_session(&session_id).await {
                Ok(()) => info!(session_id, "failed session deregistered"),
                Err(err) => debug!(session_id, %err, "failed session already removed"),
            }
        });
    }

    async fn record(&self, id: &str, line: String) {
        if let Some(history) = self.inner.history.lock().await.get_mut(id) {
            history.push(line);
        }
    }

    async fn relay(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        if let Some(line) = event.kind.history_text() {
            self.record(session_id, line).await;
        }

        let correlation_id = match &event.kind {
            EventKind::Question {
                request_id,
                question,
                input,
                ..
            } => {
                let session = self.session(session_id).await?;
                let request = PendingRequest::Question {
                    request_id: request_id.clone(),
                    question: question.clone(),
                    input: input.clone(),
                };
                let id = self.inner.pending.register(session, request).await;
                self.record(session_id, format!("[question {id}] {question}")).await;
                Some(id)
            }
            EventKind::PermissionRequest {
                request_id,
                tool_name,
                tool_input,
                ..
            } => {
                let session = self.session(session_id).await?;
                let granted = self
                    .inner
                    .grants
                    .lock()
                    .await
                    .contains(&(session_id.to_owned(), tool_name.clone()));
                if granted {
                    debug!(session_id, tool = tool_name, "standing grant applied");
                    self.record(session_id, format!("[permission] {tool_name} auto-allowed"))
                        .await;
                    return session
                        .respond(writer::allow_response(request_id, tool_input.clone()))
                        .await;
                }
                let request = PendingRequest::Permission {
                    request_id: request_id.clone(),
                    tool_name: tool_name.clone(),
                    tool_input: tool_input.clone(),
                };
                let id = self.inner.pending.register(session, request).await;
                self.record(session_id, format!("[permission {id}] {tool_name}")).await;
                Some(id)
            }
            _ => None,
        };

        self.inner
            .webhook
            .enqueue(WebhookEvent::from_session_event(&event, correlation_id.as_deref()))
            .await;

        // A failed turn leaves the session Idle; only a dead process marks it Terminated.
        if matches!(event.kind, EventKind::SessionEnded { reason: EndReason::Error }) {
            let dead = match self.session(session_id).await {
                Ok(session) => session.status().await == SessionStatus::Terminated,
                Err(_) => false,
            };
            if dead {
                self.retire_failed(session_id);
            }
        }
        Ok(())
    }
}

async fn prepare_cwd(workspace: &Path, cwd: Option<&str>) -> Result<PathBuf> {
    let cwd = workspace::validate_path(workspace, cwd.unwrap_or("."))?;
    tokio::fs::create_dir_all(&cwd).await?;
    Ok(cwd)
}

async fn discard_workspace(workspace: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(workspace).await {
        debug!(%err, "failed to remove workspace of unstarted session");
    }
}

/// Routes one session's events through its manager.
struct RelaySink {
    manager: SessionManager,
    session_id: String,
}

impl EventSink for RelaySink {
    fn deliver(
        &self,
        event: SessionEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.manager.relay(&self.session_id, event))
    }
}
