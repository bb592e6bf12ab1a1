//! Outbound webhook wire format.
//!
//! One request carries every queued update:
//!
//! ```json
//! {"message": "{\"updates\":[{\"sessionId\":\"…\",\"type\":\"question\",…}]}"}
//! ```
//!
//! The inner document is serialised to a string so receivers that expect a
//! single text field can forward it unchanged.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::event::{
    EndReason, EventKind, PermissionOption, PlanEntry, QuestionOption, SessionEvent,
};
use crate::Result;

/// Kind-specific fields of one update, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    /// Aggregated assistant text.
    MessageChunk {
        /// Text.
        content: String,
    },
    /// Aggregated reasoning text.
    Thinking {
        /// Text.
        content: String,
    },
    /// Tool invocation.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        /// Invocation id.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Tool input.
        tool_input: Value,
    },
    /// Correlated tool result.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        /// Invocation id.
        tool_call_id: String,
        /// Tool name or `unknown`.
        tool_name: String,
        /// Raw result.
        result: Value,
        /// Whether the tool failed.
        is_error: bool,
    },
    /// Replacement task plan.
    PlanUpdate {
        /// Full plan.
        entries: Vec<PlanEntry>,
    },
    /// Plan mode entered or left.
    #[serde(rename_all = "camelCase")]
    PlanModeChange {
        /// New flag.
        in_plan_mode: bool,
    },
    /// Question awaiting an operator answer.
    #[serde(rename_all = "camelCase")]
    Question {
        /// Correlation id to answer with.
        question_id: String,
        /// Question text.
        question: String,
        /// Offered answers.
        options: Vec<QuestionOption>,
        /// Whether several options may be chosen.
        multi_select: bool,
    },
    /// Tool invocation awaiting an operator decision.
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        /// Correlation id to respond with.
        permission_id: String,
        /// Tool name.
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
    /// Session-level failure.
    Error {
        /// Failure description.
        message: String,
    },
}

impl Update {
    /// Whether the update needs remote action or signals an important state.
    ///
    /// Text, thinking, tool traffic, and plan contents stay local and are
    /// read back through the session output history instead.
    #[must_use]
    pub fn is_relevant(&self) -> bool {
        matches!(
            self,
            Self::Question { .. }
                | Self::PermissionRequest { .. }
                | Self::PlanModeChange { .. }
                | Self::SessionEnded { .. }
                | Self::Error { .. }
        )
    }
}

/// One update as sent to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Emitting session.
    pub session_id: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific fields, including `type`.
    #[serde(flatten)]
    pub update: Update,
}

impl WebhookEvent {
    /// Convert a session event. `correlation_id` is the broker-assigned id of
    /// a question or permission request; the process request id is used when
    /// none was assigned.
    #[must_use]
    pub fn from_session_event(event: &SessionEvent, correlation_id: Option<&str>) -> Self {
        let update = match &event.kind {
            EventKind::MessageChunk { content } => Update::MessageChunk {
                content: content.clone(),
            },
            EventKind::Thinking { content } => Update::Thinking {
                content: content.clone(),
            },
            EventKind::ToolCall {
                tool_call_id,
                tool_name,
                tool_input,
            } => Update::ToolCall {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                tool_input: tool_input.clone(),
            },
            EventKind::ToolResult {
                tool_call_id,
                tool_name,
                result,
                is_error,
            } => Update::ToolResult {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                result: result.clone(),
                is_error: *is_error,
            },
            EventKind::PlanUpdate { entries } => Update::PlanUpdate {
                entries: entries.clone(),
            },
            EventKind::PlanModeChange { in_plan_mode } => Update::PlanModeChange {
                in_plan_mode: *in_plan_mode,
            },
            EventKind::Question {
                request_id,
                question,
                options,
                multi_select,
                ..
            } => Update::Question {
                question_id: correlation_id.unwrap_or(request_id).to_owned(),
                question: question.clone(),
                options: options.clone(),
                multi_select: *multi_select,
            },
            EventKind::PermissionRequest {
                request_id,
                tool_name,
                tool_input,
                options,
            } => Update::PermissionRequest {
                permission_id: correlation_id.unwrap_or(request_id).to_owned(),
                tool_name: tool_name.clone(),
                tool_input: tool_input.clone(),
                options: options.clone(),
            },
            EventKind::SessionEnded { reason } => Update::SessionEnded { reason: *reason },
            EventKind::Error { message } => Update::Error {
                message: message.clone(),
            },
        };

        Self {
            session_id: event.session_id.clone(),
            timestamp: event.timestamp,
            update,
        }
    }
}

#[derive(Serialize)]
struct UpdateBatch<'a> {
    updates: &'a [WebhookEvent],
}

/// Request body: a single string field holding the serialised batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookBody {
    /// Serialised `{"updates": [...]}` document.
    pub message: String,
}

impl WebhookBody {
    /// Serialise `events` into one request body.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if serialisation fails.
    pub fn from_events(events: &[WebhookEvent]) -> Result<Self> {
        let message = serde_json::to_string(&UpdateBatch { updates: events })?;
        Ok(Self { message })
    }
}
