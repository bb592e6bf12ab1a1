//! Pending question and permission request models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Operator decision on a permission request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    /// Allow this invocation.
    Allow,
    /// Allow this invocation and every later request for the same tool in
    /// the same session.
    AllowAlways,
    /// Refuse this invocation.
    Deny,
}

impl PermissionDecision {
    /// Parse a command-surface decision string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StateConflict` for an unknown decision.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "allow" => Ok(Self::Allow),
            "allow_always" => Ok(Self::AllowAlways),
            "deny" => Ok(Self::Deny),
            other => Err(AppError::StateConflict(format!(
                "unknown permission decision: {other}"
            ))),
        }
    }

    /// Whether the tool is allowed to run.
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Self::Allow | Self::AllowAlways)
    }
}

/// What kind of operator input a pending request awaits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    /// A free-text answer to a question.
    Question,
    /// An allow/deny decision on a tool invocation.
    Permission,
}

/// Read-only view of a pending request for listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    /// Correlation identifier (question id or permission id).
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Request kind.
    pub kind: PendingKind,
    /// Question text or tool name.
    pub subject: String,
    /// When the request auto-rejects.
    pub expires_at: DateTime<Utc>,
    /// Whole seconds left before `expires_at`.
    pub remaining_seconds: u64,
}
