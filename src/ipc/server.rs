//! Local command server for `agent-relay-ctl` and other local controllers.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands and
//! answers each with one JSON line.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "create", "cwd": "app", "mode": "plan"}
//! {"command": "prompt", "id": "…", "text": "fix the failing test"}
//! {"command": "respond", "id": "…", "permission_id": "…", "decision": "allow_always"}
//! {"command": "batch_info", "ids": ["…", "…"]}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { … }}
//! {"ok": false, "error": {"code": "not_found", "message": "session … not found"}}
//! ```

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::pending::PermissionDecision;
use crate::models::session::PermissionMode;
use crate::orchestrator::{CreateSessionRequest, SessionManager};
use crate::{AppError, Result};

/// Largest number of ids a batch command accepts.
pub const MAX_BATCH_SIZE: usize = 10;

/// Inbound command.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Create a session.
    Create {
        /// Working directory relative to the new workspace.
        #[serde(default)]
        cwd: Option<String>,
        /// Tools the agent may run without asking.
        #[serde(default)]
        execution_targets: Vec<String>,
        /// Initial permission mode (`bypass` or `plan`).
        #[serde(default)]
        mode: Option<String>,
    },
    /// Send a prompt.
    Prompt {
        /// Session id.
        id: String,
        /// Prompt text.
        text: String,
    },
    /// Send a slash command.
    Slash {
        /// Session id.
        id: String,
        /// Command name, with or without the leading `/`.
        name: String,
        /// Command arguments.
        #[serde(default)]
        args: Option<String>,
    },
    /// Interrupt the current turn.
    Cancel {
        /// Session id.
        id: String,
    },
    /// Change permission mode.
    Mode {
        /// Session id.
        id: String,
        /// Target mode.
        mode: String,
    },
    /// Answer a question.
    Answer {
        /// Session id.
        id: String,
        /// Correlation id from the question update.
        question_id: String,
        /// Answer text.
        text: String,
    },
    /// Decide a permission request.
    Respond {
        /// Session id.
        id: String,
        /// Correlation id from the permission update.
        permission_id: String,
        /// `allow`, `allow_always`, or `deny`.
        decision: String,
    },
    /// Terminate a session.
    Terminate {
        /// Session id.
        id: String,
    },
    /// List live sessions.
    List,
    /// Describe one session.
    Info {
        /// Session id.
        id: String,
    },
    /// Read output history.
    Output {
        /// Session id.
        id: String,
        /// First history index to return.
        #[serde(default)]
        offset: Option<usize>,
    },
    /// List unresolved questions and permission requests.
    Pending {
        /// Restrict to one session.
        #[serde(default)]
        id: Option<String>,
    },
    /// Describe several sessions.
    BatchInfo {
        /// Session ids.
        ids: Vec<String>,
    },
    /// Terminate several sessions.
    BatchTerminate {
        /// Session ids.
        ids: Vec<String>,
    },
    /// Send one prompt to several sessions.
    BatchPrompt {
        /// Session ids.
        ids: Vec<String>,
        /// Prompt text.
        text: String,
    },
    /// Read a workspace file.
    ReadFile {
        /// Session id.
        id: String,
        /// Path relative to the workspace.
        path: String,
    },
    /// List a workspace directory.
    ListFiles {
        /// Session id.
        id: String,
        /// Path relative to the workspace; the workspace itself when absent.
        #[serde(default)]
        path: Option<String>,
    },
    /// Stat a workspace path.
    StatFile {
        /// Session id.
        id: String,
        /// Path relative to the workspace.
        path: String,
    },
}

impl IpcRequest {
    /// Command verb, for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Prompt { .. } => "prompt",
            Self::Slash { .. } => "slash",
            Self::Cancel { .. } => "cancel",
            Self::Mode { .. } => "mode",
            Self::Answer { .. } => "answer",
            Self::Respond { .. } => "respond",
            Self::Terminate { .. } => "terminate",
            Self::List => "list",
            Self::Info { .. } => "info",
            Self::Output { .. } => "output",
            Self::Pending { .. } => "pending",
            Self::BatchInfo { .. } => "batch_info",
            Self::BatchTerminate { .. } => "batch_terminate",
            Self::BatchPrompt { .. } => "batch_prompt",
            Self::ReadFile { .. } => "read_file",
            Self::ListFiles { .. } => "list_files",
            Self::StatFile { .. } => "stat_file",
        }
    }
}

/// Structured failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpcError {
    /// Stable machine code (see [`AppError::code`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&AppError> for IpcError {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}

/// Outbound response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl IpcResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(err: &AppError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(IpcError::from(err)),
        }
    }

    fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }
}

/// Spawn the command server task.
///
/// # Errors
///
/// Returns `AppError::Config` if the socket name is invalid, or
/// `AppError::Io` if the listener cannot be created.
pub fn spawn_ipc_server(
    manager: SessionManager,
    name: String,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Config(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Io(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "command server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("command server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, manager.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "ipc accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, manager: SessionManager) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = handle_line(&manager, trimmed).await;
                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":{"code":"internal","message":"serialization failed"}}"#
                            .to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        debug!("ipc connection closed");
    }
    .instrument(span)
    .await;
}

/// Parse and execute one request line.
pub async fn handle_line(manager: &SessionManager, line: &str) -> IpcResponse {
    match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => dispatch(manager, request).await,
        Err(err) => IpcResponse::failure(&AppError::StateConflict(format!("invalid request: {err}"))),
    }
}

/// Execute one request. Every failure, including a panic inside a handler,
/// becomes a structured error response.
pub async fn dispatch(manager: &SessionManager, request: IpcRequest) -> IpcResponse {
    let command = request.name();
    let span = info_span!("ipc_command", command);

    let outcome = AssertUnwindSafe(execute(manager, request).instrument(span))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(data)) => IpcResponse::success(data),
        Ok(Err(err)) => {
            if err.is_client_error() {
                debug!(command, %err, "command rejected");
            } else {
                warn!(command, %err, "command failed");
            }
            IpcResponse::failure(&err)
        }
        Err(_) => {
            warn!(command, "command handler panicked");
            IpcResponse::failure(&AppError::Internal(format!("command {command} failed unexpectedly")))
        }
    }
}

async fn execute(manager: &SessionManager, request: IpcRequest) -> Result<Value> {
    match request {
        IpcRequest::Create {
            cwd,
            execution_targets,
            mode,
        } => {
            let mode = mode.as_deref().map(PermissionMode::parse).transpose()?.unwrap_or_default();
            let info = manager
                .create_session(CreateSessionRequest {
                    cwd,
                    execution_targets,
                    mode,
                })
                .await?;
            to_value(&info)
        }
        IpcRequest::Prompt { id, text } => {
            manager.send_prompt(&id, &text).await?;
            Ok(json!({ "id": id }))
        }
        IpcRequest::Slash { id, name, args } => {
            manager.send_slash_command(&id, &name, args.as_deref()).await?;
            Ok(json!({ "id": id }))
        }
        IpcRequest::Cancel { id } => {
            manager.cancel(&id).await?;
            Ok(json!({ "id": id }))
        }
        IpcRequest::Mode { id, mode } => {
            let mode = PermissionMode::parse(&mode)?;
            manager.set_mode(&id, mode).await?;
            Ok(json!({ "id": id, "mode": mode }))
        }
        IpcRequest::Answer {
            id,
            question_id,
            text,
        } => {
            manager.answer_question(&id, &question_id, &text).await?;
            Ok(json!({ "id": id, "questionId": question_id }))
        }
        IpcRequest::Respond {
            id,
            permission_id,
            decision,
        } => {
            let decision = PermissionDecision::parse(&decision)?;
            manager.respond_permission(&id, &permission_id, decision).await?;
            Ok(json!({ "id": id, "permissionId": permission_id, "decision": decision }))
        }
        IpcRequest::Terminate { id } => {
            manager.terminate_session(&id).await?;
            Ok(json!({ "id": id }))
        }
        IpcRequest::List => Ok(json!({ "sessions": manager.list_sessions().await })),
        IpcRequest::Info { id } => to_value(&manager.get_info(&id).await?),
        IpcRequest::Output { id, offset } => to_value(&manager.read_output(&id, offset).await?),
        IpcRequest::Pending { id } => Ok(json!({ "pending": manager.list_pending(id.as_deref()).await })),
        IpcRequest::BatchInfo { ids } => {
            check_batch(&ids)?;
            let mut results = Vec::with_capacity(ids.len());
            for id in ids {
                let result = manager.get_info(&id).await.and_then(|info| to_value(&info));
                results.push(batch_item(id, result));
            }
            Ok(json!({ "results": results }))
        }
        IpcRequest::BatchTerminate { ids } => {
            check_batch(&ids)?;
            let mut results = Vec::with_capacity(ids.len());
            for id in ids {
                let result = manager.terminate_session(&id).await.map(|()| Value::Null);
                results.push(batch_item(id, result));
            }
            Ok(json!({ "results": results }))
        }
        IpcRequest::BatchPrompt { ids, text } => {
            check_batch(&ids)?;
            let mut results = Vec::with_capacity(ids.len());
            for id in ids {
                let result = manager.send_prompt(&id, &text).await.map(|()| Value::Null);
                results.push(batch_item(id, result));
            }
            Ok(json!({ "results": results }))
        }
        IpcRequest::ReadFile { id, path } => to_value(&manager.read_file(&id, &path).await?),
        IpcRequest::ListFiles { id, path } => {
            let entries = manager.list_files(&id, path.as_deref().unwrap_or(".")).await?;
            Ok(json!({ "entries": entries }))
        }
        IpcRequest::StatFile { id, path } => to_value(&manager.stat_file(&id, &path).await?),
    }
}

fn check_batch(ids: &[String]) -> Result<()> {
    if ids.is_empty() {
        return Err(AppError::StateConflict("batch needs at least one id".into()));
    }
    if ids.len() > MAX_BATCH_SIZE {
        return Err(AppError::StateConflict(format!(
            "batch of {} exceeds the limit of {MAX_BATCH_SIZE}",
            ids.len()
        )));
    }
    Ok(())
}

fn batch_item(id: String, result: Result<Value>) -> Value {
    let response = IpcResponse::from_result(result);
    json!({
        "id": id,
        "ok": response.ok,
        "data": response.data,
        "error": response.error,
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
