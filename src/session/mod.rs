//! One managed conversation with an agent execution process.
//!
//! A [`Session`] owns the process handle, its input channel, and a single
//! processing task that turns raw process output into [`EventKind`]s. Text
//! fragments are aggregated per window ([`aggregator`]), tool calls are
//! correlated with their results ([`tool_tracker`]), and events reach the
//! subscriber through a supervised queue ([`emitter`]).
//!
//! Status transitions:
//!
//! ```text
//! idle --prompt/slash--> active --result--> idle
//! active --cancel--> idle
//! any --terminate/fatal error--> terminated
//! ```

pub mod aggregator;
pub mod emitter;
pub mod tool_tracker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::StreamConfig;
use crate::models::event::{
    EndReason, EventKind, PermissionOption, PlanEntry, QuestionOption, ASK_QUESTION_TOOL,
    ENTER_PLAN_TOOL, EXIT_PLAN_TOOL, PLAN_TOOL,
};
use crate::models::session::{PermissionMode, SessionInfo, SessionStatus};
use crate::process::{reader, writer, AgentLauncher, AgentProcess, LaunchSpec, ProcessMessage};
use crate::{AppError, Result};

use self::aggregator::{FragmentKind, Flushed, TextAggregator};
use self::emitter::{EventEmitter, EventSink};
use self::tool_tracker::ToolCorrelator;

const INPUT_CAPACITY: usize = 64;
const MESSAGE_CAPACITY: usize = 256;

/// Stream-handling knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Text aggregation window.
    pub text_flush: Duration,
    /// Lifetime of an uncorrelated tool call.
    pub tool_ttl: Duration,
    /// Consecutive delivery failures before a health warning.
    pub failure_threshold: u32,
}

impl SessionOptions {
    /// Options from the `[stream]` config section.
    #[must_use]
    pub fn from_config(stream: &StreamConfig) -> Self {
        Self {
            text_flush: Duration::from_millis(stream.text_flush_ms),
            tool_ttl: Duration::from_secs(stream.tool_ttl_seconds),
            failure_threshold: stream.failure_threshold,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    permission_mode: PermissionMode,
    in_plan_mode: bool,
    last_activity: DateTime<Utc>,
    idle_since: Instant,
}

impl SessionState {
    fn new(permission_mode: PermissionMode) -> Self {
        Self {
            status: SessionStatus::Idle,
            permission_mode,
            in_plan_mode: permission_mode == PermissionMode::PlanOnly,
            last_activity: Utc::now(),
            idle_since: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.idle_since = Instant::now();
    }

    fn ensure_live(&self) -> Result<()> {
        if self.status == SessionStatus::Terminated {
            return Err(AppError::StateConflict("session is terminated".into()));
        }
        Ok(())
    }
}

/// A live agent conversation.
#[derive(Debug)]
pub struct Session {
    id: String,
    workspace: PathBuf,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    state: Arc<Mutex<SessionState>>,
    input: Mutex<Option<mpsc::Sender<Value>>>,
    notices: mpsc::UnboundedSender<EventKind>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl Session {
    /// Launch the process described by `spec` and start processing its output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the launcher fails.
    pub async fn start(
        spec: &LaunchSpec,
        workspace: PathBuf,
        launcher: &dyn AgentLauncher,
        sink: Arc<dyn EventSink>,
        options: &SessionOptions,
    ) -> Result<Self> {
        let AgentProcess {
            child,
            stdin,
            stdout,
        } = launcher.launch(spec).await?;

        let session_id = spec.session_id.clone();
        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let writer_id = session_id.clone();
        let writer_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = writer::run_writer(writer_id.clone(), stdin, input_rx, writer_cancel).await {
                warn!(session_id = writer_id, %err, "process writer stopped");
            }
        });

        let reader_id = session_id.clone();
        let reader_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = reader::run_reader(reader_id.clone(), stdout, message_tx, reader_cancel).await {
                warn!(session_id = reader_id, %err, "process reader stopped");
            }
        });

        let (emitter, _worker) =
            EventEmitter::spawn(session_id.clone(), sink, options.failure_threshold);
        let state = Arc::new(Mutex::new(SessionState::new(spec.permission_mode)));

        let processor = Processor {
            session_id: session_id.clone(),
            state: Arc::clone(&state),
            emitter,
            aggregator: TextAggregator::new(options.text_flush),
            tools: ToolCorrelator::new(options.tool_ttl),
            saw_partial_text: false,
        };
        let span = info_span!("session_loop", session_id = %session_id);
        let task = tokio::spawn(
            processor
                .run(message_rx, notice_rx, cancel.clone())
                .instrument(span),
        );

        info!(
            session_id,
            cwd = %spec.cwd.display(),
            mode = spec.permission_mode.as_cli_value(),
            "session started"
        );

        Ok(Self {
            id: session_id,
            workspace,
            cwd: spec.cwd.clone(),
            created_at: Utc::now(),
            state,
            input: Mutex::new(Some(input_tx)),
            notices: notice_tx,
            cancel,
            task: Mutex::new(Some(task)),
            child: Mutex::new(child),
        })
    }

    /// Unique session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Isolated workspace directory of this session.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Start a turn with `text`.
    ///
    /// # Errors
    ///
    /// `AppError::StateConflict` once terminated; `AppError::Process` if the
    /// process input is gone.
    pub async fn send_prompt(&self, text: &str) -> Result<()> {
        self.begin_turn().await?;
        self.send_input(writer::user_message(text)).await
    }

    /// Start a turn with the slash command `/name args`.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send_prompt`].
    pub async fn send_slash_command(&self, name: &str, args: Option<&str>) -> Result<()> {
        self.begin_turn().await?;
        self.send_input(writer::slash_command(name, args)).await
    }

    /// Interrupt the current turn and return to idle without waiting for the
    /// process to settle.
    ///
    /// # Errors
    ///
    /// `AppError::StateConflict` when no turn is in progress.
    pub async fn cancel(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.ensure_live()?;
            if state.status != SessionStatus::Active {
                return Err(AppError::StateConflict("no turn in progress".into()));
            }
            state.status = SessionStatus::Idle;
            state.touch();
        }

        info!(session_id = self.id, "cancelling turn");
        self.send_input(writer::interrupt_request()).await?;
        self.notify(EventKind::SessionEnded {
            reason: EndReason::Cancelled,
        });
        Ok(())
    }

    /// Switch the process permission mode. Entering plan-only mode sets the
    /// plan-mode flag; leaving it clears the flag.
    ///
    /// # Errors
    ///
    /// `AppError::StateConflict` once terminated.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        self.state.lock().await.ensure_live()?;
        self.send_input(writer::set_mode_request(mode.as_cli_value()))
            .await?;

        let changed = {
            let mut state = self.state.lock().await;
            state.permission_mode = mode;
            state.touch();
            let in_plan = mode == PermissionMode::PlanOnly;
            let changed = state.in_plan_mode != in_plan;
            state.in_plan_mode = in_plan;
            changed
        };

        info!(session_id = self.id, mode = mode.as_cli_value(), "permission mode changed");
        if changed {
            self.notify(EventKind::PlanModeChange {
                in_plan_mode: mode == PermissionMode::PlanOnly,
            });
        }
        Ok(())
    }

    /// Write a `control_response` (or any raw message) to the process.
    ///
    /// # Errors
    ///
    /// `AppError::StateConflict` once the input channel is closed.
    pub async fn respond(&self, message: Value) -> Result<()> {
        self.send_input(message).await
    }

    /// Snapshot of the session.
    pub async fn get_info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            id: self.id.clone(),
            status: state.status,
            permission_mode: state.permission_mode,
            in_plan_mode: state.in_plan_mode,
            workspace: self.workspace.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity,
        }
    }

    /// Current status.
    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    /// How long the session has been without activity.
    pub async fn idle_for(&self) -> Duration {
        self.state.lock().await.idle_since.elapsed()
    }

    /// Close the input channel, stop the process, and wait for the processing
    /// task to end. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for launcher cleanup.
    pub async fn terminate(&self) -> Result<()> {
        self.state.lock().await.status = SessionStatus::Terminated;
        self.input.lock().await.take();
        self.cancel.cancel();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(session_id = self.id, %err, "agent process already gone");
            }
        }

        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(session_id = self.id, %err, "processing task ended abnormally");
            }
        }

        info!(session_id = self.id, "session terminated");
        Ok(())
    }

    async fn begin_turn(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_live()?;
        if state.status.can_transition_to(SessionStatus::Active) {
            state.status = SessionStatus::Active;
        }
        state.touch();
        Ok(())
    }

    async fn send_input(&self, message: Value) -> Result<()> {
        let sender = self
            .input
            .lock()
            .await
            .clone()
            .ok_or_else(|| AppError::StateConflict("session input is closed".into()))?;
        sender
            .send(message)
            .await
            .map_err(|_| AppError::Process("process input closed".into()))
    }

    fn notify(&self, kind: EventKind) {
        if self.notices.send(kind).is_err() {
            debug!(session_id = self.id, "processing task gone, dropping notice");
        }
    }
}

/// State owned by the processing task.
struct Processor {
    session_id: String,
    state: Arc<Mutex<SessionState>>,
    emitter: EventEmitter,
    aggregator: TextAggregator,
    tools: ToolCorrelator,
    saw_partial_text: bool,
}

impl Processor {
    async fn run(
        mut self,
        mut messages: mpsc::Receiver<ProcessMessage>,
        mut notices: mpsc::UnboundedReceiver<EventKind>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.aggregator.deadline();

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    self.flush_text();
                    break;
                }

                Some(kind) = notices.recv() => {
                    self.emit(kind);
                }

                msg = messages.recv() => {
                    let outcome = match msg {
                        Some(message) => self.handle(message).await,
                        None => Err(AppError::Process("process output closed".into())),
                    };
                    if let Err(err) = outcome {
                        if cancel.is_cancelled() {
                            self.flush_text();
                        } else {
                            self.fail(&err).await;
                            cancel.cancel();
                        }
                        break;
                    }
                }

                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_text();
                }
            }
        }

        debug!("processing loop stopped");
    }

    async fn handle(&mut self, message: ProcessMessage) -> Result<()> {
        self.state.lock().await.touch();

        match message {
            ProcessMessage::Init => debug!("agent process initialised"),
            ProcessMessage::TextDelta(text) => {
                self.saw_partial_text = true;
                self.push_fragment(FragmentKind::Text, &text);
            }
            ProcessMessage::ThinkingDelta(text) => {
                self.push_fragment(FragmentKind::Thinking, &text);
            }
            ProcessMessage::AssistantText(text) => {
                if !self.saw_partial_text {
                    self.push_fragment(FragmentKind::Text, &text);
                }
            }
            ProcessMessage::ToolUse { id, name, input } => {
                self.on_tool_use(id, name, input).await;
            }
            ProcessMessage::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let tool_name = self.tools.resolve(&tool_use_id);
                self.emit(EventKind::ToolResult {
                    tool_call_id: tool_use_id,
                    tool_name,
                    result: content,
                    is_error,
                });
            }
            ProcessMessage::TurnResult { is_error, detail } => {
                self.on_turn_result(is_error, &detail).await;
            }
            ProcessMessage::CanUseTool {
                request_id,
                tool_name,
                input,
            } => {
                let kind = if tool_name == ASK_QUESTION_TOOL {
                    question_event(request_id, input)
                } else {
                    EventKind::PermissionRequest {
                        request_id,
                        tool_name,
                        tool_input: input,
                        options: PermissionOption::defaults(),
                    }
                };
                self.emit(kind);
            }
            ProcessMessage::Closed { reason } | ProcessMessage::Failed { reason } => {
                return Err(AppError::Process(reason));
            }
        }
        Ok(())
    }

    async fn on_tool_use(&mut self, id: String, name: String, input: Value) {
        self.tools.record(&id, &name);

        let plan = (name == PLAN_TOOL).then(|| plan_entries(&input));
        let plan_flag = match name.as_str() {
            ENTER_PLAN_TOOL => Some(true),
            EXIT_PLAN_TOOL => Some(false),
            _ => None,
        };

        self.emit(EventKind::ToolCall {
            tool_call_id: id,
            tool_name: name,
            tool_input: input,
        });

        if let Some(entries) = plan {
            self.emit(EventKind::PlanUpdate { entries });
        }

        if let Some(in_plan_mode) = plan_flag {
            let changed = {
                let mut state = self.state.lock().await;
                let changed = state.in_plan_mode != in_plan_mode;
                state.in_plan_mode = in_plan_mode;
                changed
            };
            if changed {
                self.emit(EventKind::PlanModeChange { in_plan_mode });
            }
        }
    }

    async fn on_turn_result(&mut self, is_error: bool, detail: &str) {
        self.saw_partial_text = false;

        let was_active = {
            let mut state = self.state.lock().await;
            if state.status == SessionStatus::Active {
                state.status = SessionStatus::Idle;
                true
            } else {
                false
            }
        };

        // A cancelled turn already reported its end.
        if !was_active {
            self.flush_text();
            debug!(detail, "ignoring result for a turn that is no longer active");
            return;
        }

        let reason = if is_error {
            warn!(detail, "turn ended with an error");
            EndReason::Error
        } else {
            EndReason::Completed
        };
        self.emit(EventKind::SessionEnded { reason });
    }

    async fn fail(&mut self, err: &AppError) {
        warn!(%err, "session processing failed");
        self.state.lock().await.status = SessionStatus::Terminated;
        self.emit(EventKind::Error {
            message: err.to_string(),
        });
        self.emit(EventKind::SessionEnded {
            reason: EndReason::Error,
        });
    }

    fn push_fragment(&mut self, kind: FragmentKind, text: &str) {
        if let Some(previous) = self.aggregator.push(kind, text) {
            self.emit_flushed(previous);
        }
    }

    fn flush_text(&mut self) {
        if let Some(flushed) = self.aggregator.flush() {
            self.emit_flushed(flushed);
        }
    }

    fn emit_flushed(&self, flushed: Flushed) {
        let kind = match flushed.kind {
            FragmentKind::Text => EventKind::MessageChunk {
                content: flushed.content,
            },
            FragmentKind::Thinking => EventKind::Thinking {
                content: flushed.content,
            },
        };
        self.emitter.emit(kind);
    }

    /// Emit a structured event, flushing buffered text first.
    fn emit(&mut self, kind: EventKind) {
        self.flush_text();
        debug!(session_id = self.session_id, event_type = kind.type_name(), "event emitted");
        self.emitter.emit(kind);
    }
}

fn plan_entries(input: &Value) -> Vec<PlanEntry> {
    let todos = input.get("todos").cloned().unwrap_or(Value::Null);
    serde_json::from_value(todos).unwrap_or_else(|err| {
        warn!(%err, "plan input has no readable todos");
        Vec::new()
    })
}

fn question_event(request_id: String, input: Value) -> EventKind {
    let first = input
        .get("questions")
        .and_then(Value::as_array)
        .and_then(|questions| questions.first())
        .unwrap_or(&input);

    let question = first
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let options: Vec<QuestionOption> = first
        .get("options")
        .cloned()
        .and_then(|raw| serde_json::from_value(raw).ok())
        .unwrap_or_default();
    let multi_select = first
        .get("multiSelect")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    EventKind::Question {
        request_id,
        question,
        options,
        multi_select,
        input,
    }
}
