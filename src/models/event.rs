//! Normalized event vocabulary emitted by a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool name the agent uses to ask the operator a question.
pub const ASK_QUESTION_TOOL: &str = "AskUserQuestion";

/// Tool name whose input carries the agent's task plan.
pub const PLAN_TOOL: &str = "TodoWrite";

/// Tool name the agent uses to enter plan mode.
pub const ENTER_PLAN_TOOL: &str = "EnterPlanMode";

/// Tool name the agent uses to leave plan mode.
pub const EXIT_PLAN_TOOL: &str = "ExitPlanMode";

/// Why a turn or session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The agent finished its turn.
    Completed,
    /// The operator interrupted the turn.
    Cancelled,
    /// The turn or the session failed.
    Error,
}

/// One entry of the agent's task plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanEntry {
    /// Entry description.
    pub content: String,
    /// Entry status (`pending`, `in_progress`, `completed`).
    pub status: String,
}

/// A selectable answer offered with a question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionOption {
    /// Short answer label.
    pub label: String,
    /// Longer explanation of the option.
    #[serde(default)]
    pub description: String,
}

/// A decision offered with a permission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionOption {
    /// Decision identifier (`allow`, `allow_always`, `deny`).
    pub id: String,
    /// Human-readable label.
    pub label: String,
}

impl PermissionOption {
    /// The three decisions every permission request offers.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                id: "allow".into(),
                label: "Allow".into(),
            },
            Self {
                id: "allow_always".into(),
                label: "Always allow".into(),
            },
            Self {
                id: "deny".into(),
                label: "Deny".into(),
            },
        ]
    }
}

/// Kind-specific payload of a [`SessionEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Aggregated assistant text.
    MessageChunk {
        /// Concatenated text fragments.
        content: String,
    },
    /// Aggregated reasoning text.
    Thinking {
        /// Concatenated thinking fragments.
        content: String,
    },
    /// The agent invoked a tool.
    ToolCall {
        /// Tool invocation identifier.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Raw tool input.
        tool_input: Value,
    },
    /// A tool invocation produced its result.
    ToolResult {
        /// Tool invocation identifier.
        tool_call_id: String,
        /// Correlated tool name, `unknown` when the call was never seen or evicted.
        tool_name: String,
        /// Raw result content.
        result: Value,
        /// Whether the tool reported failure.
        is_error: bool,
    },
    /// The agent replaced its task plan.
    PlanUpdate {
        /// Full plan.
        entries: Vec<PlanEntry>,
    },
    /// Plan mode was entered or left.
    PlanModeChange {
        /// New plan-mode flag.
        in_plan_mode: bool,
    },
    /// The agent asked the operator a question.
    Question {
        /// Process-side control request identifier.
        request_id: String,
        /// Question text.
        question: String,
        /// Offered answers.
        options: Vec<QuestionOption>,
        /// Whether several options may be chosen.
        multi_select: bool,
        /// Original tool input, echoed back with the answer.
        input: Value,
    },
    /// The agent asked for permission to run a tool.
    PermissionRequest {
        /// Process-side control request identifier.
        request_id: String,
        /// Tool awaiting permission.
        tool_name: String,
        /// Tool input.
        tool_input: Value,
        /// Offered decisions.
        options: Vec<PermissionOption>,
    },
    /// A turn or the session ended.
    SessionEnded {
        /// End reason.
        reason: EndReason,
    },
    /// A session-level failure.
    Error {
        /// Failure description.
        message: String,
    },
}

impl EventKind {
    /// Wire-format `type` tag for this kind.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MessageChunk { .. } => "message_chunk",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::PlanUpdate { .. } => "plan_update",
            Self::PlanModeChange { .. } => "plan_mode_change",
            Self::Question { .. } => "question",
            Self::PermissionRequest { .. } => "permission_request",
            Self::SessionEnded { .. } => "session_ended",
            Self::Error { .. } => "error",
        }
    }

    /// Plain-text rendering kept in the session output history, if any.
    #[must_use]
    pub fn history_text(&self) -> Option<String> {
        match self {
            Self::MessageChunk { content } => Some(content.clone()),
            Self::Thinking { content } => Some(format!("[thinking] {content}")),
            Self::ToolCall {
                tool_name,
                tool_input,
                ..
            } => Some(format!("[tool_call] {tool_name} {tool_input}")),
            Self::ToolResult {
                tool_name,
                result,
                is_error,
                ..
            } => {
                let marker = if *is_error { "tool_error" } else { "tool_result" };
                let body = result
                    .as_str()
                    .map_or_else(|| result.to_string(), str::to_owned);
                Some(format!("[{marker}] {tool_name} {body}"))
            }
            Self::Error { message } => Some(format!("[error] {message}")),
            _ => None,
        }
    }
}

/// An event emitted by one session, stamped at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Emitting session.
    pub session_id: String,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub kind: EventKind,
}

impl SessionEvent {
    /// Stamp `kind` for `session_id` with the current time.
    #[must_use]
    pub fn now(session_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}
