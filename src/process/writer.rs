//! Agent process writer task and outbound message builders.
//!
//! Receives outbound JSON messages from a tokio [`mpsc`] channel, serialises
//! each value to a single-line JSON string, and writes the NDJSON line to the
//! agent's stdin. Closing every sender ends the task and, with it, the
//! process input stream.

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AppError, Result};

/// Writer task: serialises outbound JSON messages and writes them to `stdin`.
///
/// The task exits cleanly when `cancel` is triggered or when `msg_rx` is
/// closed. In both cases stdin is shut down so the process observes EOF.
///
/// # Errors
///
/// - [`AppError::Process`]`("failed to serialise outbound message: …")`.
/// - [`AppError::Process`]`("write failed: …")` when the process has gone
///   away.
pub async fn run_writer<W>(
    session_id: String,
    mut stdin: W,
    mut msg_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "process writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(session_id, "process writer: message channel closed, stopping");
                    break;
                };

                let mut bytes = serde_json::to_vec(&value).map_err(|e| {
                    AppError::Process(format!("failed to serialise outbound message: {e}"))
                })?;
                bytes.push(b'\n');

                if let Err(e) = write_line(&mut stdin, &bytes).await {
                    warn!(session_id, error = %e, "process writer: write to stdin failed");
                    return Err(AppError::Process(format!("write failed: {e}")));
                }
            }
        }
    }

    if let Err(e) = stdin.shutdown().await {
        debug!(session_id, error = %e, "process writer: stdin shutdown failed");
    }
    Ok(())
}

async fn write_line<W>(stdin: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

/// A user turn carrying `text`.
#[must_use]
pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": text,
        },
    })
}

/// A slash command expressed as a user turn `"/name args"`.
#[must_use]
pub fn slash_command(name: &str, args: Option<&str>) -> Value {
    let name = name.trim_start_matches('/');
    let text = match args.map(str::trim).filter(|a| !a.is_empty()) {
        Some(args) => format!("/{name} {args}"),
        None => format!("/{name}"),
    };
    user_message(&text)
}

fn control_request(request: Value) -> Value {
    json!({
        "type": "control_request",
        "request_id": Uuid::new_v4().to_string(),
        "request": request,
    })
}

/// Ask the process to interrupt the current turn.
#[must_use]
pub fn interrupt_request() -> Value {
    control_request(json!({ "subtype": "interrupt" }))
}

/// Ask the process to switch permission mode (`bypassPermissions`, `plan`).
#[must_use]
pub fn set_mode_request(mode: &str) -> Value {
    control_request(json!({ "subtype": "set_permission_mode", "mode": mode }))
}

fn control_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    })
}

/// Allow a pending `can_use_tool` request, optionally rewriting its input.
#[must_use]
pub fn allow_response(request_id: &str, updated_input: Value) -> Value {
    control_response(
        request_id,
        json!({ "behavior": "allow", "updatedInput": updated_input }),
    )
}

/// Deny a pending `can_use_tool` request with `message` shown to the agent.
#[must_use]
pub fn deny_response(request_id: &str, message: &str) -> Value {
    control_response(
        request_id,
        json!({ "behavior": "deny", "message": message }),
    )
}

/// Answer an `AskUserQuestion` request: the original input plus the operator's
/// answer keyed by question text.
#[must_use]
pub fn answer_response(request_id: &str, input: &Value, question: &str, answer: &str) -> Value {
    let mut updated = match input {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    updated.insert("answers".into(), json!({ question: answer }));
    allow_response(request_id, Value::Object(updated))
}
