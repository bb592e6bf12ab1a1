//! Agent process reader task.
//!
//! Reads newline-delimited JSON from an agent's stdout, parses each line
//! into zero or more [`ProcessMessage`]s, and forwards them through a tokio
//! [`mpsc`] channel to the owning session's processing loop.
//!
//! # Known inbound message types
//!
//! | `type`            | Maps to                                              |
//! |-------------------|------------------------------------------------------|
//! | `system`          | [`ProcessMessage::Init`] for `subtype: init`         |
//! | `stream_event`    | [`ProcessMessage::TextDelta`] / `ThinkingDelta`      |
//! | `assistant`       | `AssistantText` and `ToolUse` per content block      |
//! | `user`            | [`ProcessMessage::ToolResult`] per `tool_result`     |
//! | `result`          | [`ProcessMessage::TurnResult`]                       |
//! | `control_request` | [`ProcessMessage::CanUseTool`] for `can_use_tool`    |
//! | *(any other)*     | Skipped; logged at `DEBUG`                           |

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::process::codec::{Frame, StreamCodec, MAX_LINE_BYTES};
use crate::{AppError, Result};

/// A message decoded from the agent process stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessMessage {
    /// The process finished initialising.
    Init,
    /// Partial assistant text.
    TextDelta(String),
    /// Partial reasoning text.
    ThinkingDelta(String),
    /// A complete assistant text block.
    AssistantText(String),
    /// The agent invoked a tool.
    ToolUse {
        /// Invocation identifier.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input.
        input: Value,
    },
    /// A tool produced its result.
    ToolResult {
        /// Identifier of the originating invocation.
        tool_use_id: String,
        /// Raw result content.
        content: Value,
        /// Whether the tool failed.
        is_error: bool,
    },
    /// The current turn finished.
    TurnResult {
        /// Whether the turn failed.
        is_error: bool,
        /// Result subtype or failure detail.
        detail: String,
    },
    /// The agent asks whether it may run a tool.
    CanUseTool {
        /// Control request identifier to answer.
        request_id: String,
        /// Tool awaiting permission.
        tool_name: String,
        /// Tool input.
        input: Value,
    },
    /// The stream reached EOF.
    Closed {
        /// Human-readable reason.
        reason: String,
    },
    /// The stream failed with an unrecoverable I/O error.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    StreamEvent {
        event: Value,
    },
    Assistant {
        message: ContentMessage,
    },
    User {
        message: ContentMessage,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentMessage {
    #[serde(default)]
    content: Value,
}

/// Parse a single NDJSON line from an agent stream.
///
/// Returns an empty vector for blank lines and message types that carry
/// nothing the session needs.
///
/// # Errors
///
/// - [`AppError::Process`]`("malformed json: …")` when the line is not a
///   JSON object with a `type` tag.
/// - [`AppError::Process`]`("missing required field: …")` when a
///   `can_use_tool` request has no `tool_name`.
pub fn parse_inbound_line(line: &str) -> Result<Vec<ProcessMessage>> {
    if line.trim().is_empty() {
        return Ok(Vec::new());
    }

    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| AppError::Process(format!("malformed json: {e}")))?;

    let messages = match envelope {
        Envelope::System { subtype } => {
            if subtype.as_deref() == Some("init") {
                vec![ProcessMessage::Init]
            } else {
                Vec::new()
            }
        }
        Envelope::StreamEvent { event } => parse_stream_event(&event).into_iter().collect(),
        Envelope::Assistant { message } => parse_assistant_blocks(&message.content),
        Envelope::User { message } => parse_tool_results(&message.content),
        Envelope::Result {
            subtype,
            is_error,
            result,
        } => {
            let is_error = is_error || subtype.starts_with("error");
            let detail = if is_error {
                result.unwrap_or_else(|| subtype.clone())
            } else {
                subtype
            };
            vec![ProcessMessage::TurnResult { is_error, detail }]
        }
        Envelope::ControlRequest {
            request_id,
            request,
        } => parse_control_request(request_id, &request)?
            .into_iter()
            .collect(),
        Envelope::Other => {
            debug!("process reader: skipping unknown message type");
            Vec::new()
        }
    };

    Ok(messages)
}

/// Reader task: reads NDJSON lines from `stdout` and forwards messages.
///
/// On clean EOF sends [`ProcessMessage::Closed`]; on an unrecoverable I/O
/// error sends [`ProcessMessage::Failed`]. Malformed lines are logged and
/// skipped. When `cancel` fires the task exits without a closing message.
///
/// # Errors
///
/// Always returns `Ok(())`; failures are reported through `message_tx`.
pub async fn run_reader<R>(
    session_id: String,
    stdout: R,
    message_tx: mpsc::Sender<ProcessMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, StreamCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "process reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(session_id, "process reader: EOF detected");
                        send_final(&message_tx, &session_id, ProcessMessage::Closed {
                            reason: "process output closed".into(),
                        })
                        .await;
                        break;
                    }

                    Some(Ok(Frame::Oversized { discarded })) => {
                        warn!(
                            session_id,
                            discarded,
                            limit = MAX_LINE_BYTES,
                            "process reader: line too long, skipping"
                        );
                    }

                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "process reader: IO error, stopping");
                        send_final(&message_tx, &session_id, ProcessMessage::Failed {
                            reason: format!("stream error: {e}"),
                        })
                        .await;
                        break;
                    }

                    Some(Ok(Frame::Line(line))) => match parse_inbound_line(&line) {
                        Ok(messages) => {
                            for message in messages {
                                if message_tx.send(message).await.is_err() {
                                    debug!(session_id, "process reader: receiver closed, stopping");
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                session_id,
                                error = %e,
                                raw_line = %line,
                                "process reader: parse error, skipping line"
                            );
                        }
                    },
                }
            }
        }
    }

    Ok(())
}

fn parse_stream_event(event: &Value) -> Option<ProcessMessage> {
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    match delta.get("type").and_then(Value::as_str)? {
        "text_delta" => delta
            .get("text")
            .and_then(Value::as_str)
            .map(|text| ProcessMessage::TextDelta(text.to_owned())),
        "thinking_delta" => delta
            .get("thinking")
            .and_then(Value::as_str)
            .map(|text| ProcessMessage::ThinkingDelta(text.to_owned())),
        _ => None,
    }
}

fn content_blocks(content: &Value) -> &[Value] {
    content.as_array().map_or(&[], Vec::as_slice)
}

fn parse_assistant_blocks(content: &Value) -> Vec<ProcessMessage> {
    if let Some(text) = content.as_str() {
        return vec![ProcessMessage::AssistantText(text.to_owned())];
    }

    content_blocks(content)
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str)? {
            "text" => block
                .get("text")
                .and_then(Value::as_str)
                .map(|text| ProcessMessage::AssistantText(text.to_owned())),
            "tool_use" => Some(ProcessMessage::ToolUse {
                id: block.get("id").and_then(Value::as_str)?.to_owned(),
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        })
        .collect()
}

fn parse_tool_results(content: &Value) -> Vec<ProcessMessage> {
    content_blocks(content)
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .filter_map(|block| {
            Some(ProcessMessage::ToolResult {
                tool_use_id: block.get("tool_use_id").and_then(Value::as_str)?.to_owned(),
                content: block.get("content").cloned().unwrap_or(Value::Null),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

fn parse_control_request(request_id: String, request: &Value) -> Result<Option<ProcessMessage>> {
    if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
        debug!(request_id, "process reader: skipping unsupported control request");
        return Ok(None);
    }

    let tool_name = request
        .get("tool_name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AppError::Process("missing required field: `tool_name` in can_use_tool".into())
        })?
        .to_owned();

    Ok(Some(ProcessMessage::CanUseTool {
        request_id,
        tool_name,
        input: request.get("input").cloned().unwrap_or(Value::Null),
    }))
}

async fn send_final(message_tx: &mpsc::Sender<ProcessMessage>, session_id: &str, message: ProcessMessage) {
    if message_tx.send(message).await.is_err() {
        debug!(
            session_id,
            "process reader: receiver closed before final message could be delivered"
        );
    }
}
