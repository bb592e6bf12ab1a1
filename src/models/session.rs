//! Session model and lifecycle helpers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Lifecycle status for an agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for the next prompt.
    Idle,
    /// A turn is in progress.
    Active,
    /// Process released; absorbing state.
    Terminated,
}

impl SessionStatus {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Active)
                | (Self::Active, Self::Idle)
                | (Self::Idle | Self::Active, Self::Terminated)
        )
    }

    /// Lowercase label used in logs and command responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Terminated => "terminated",
        }
    }
}

/// Tool permission policy the agent process runs under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Tools run without asking, except those that always require a prompt.
    #[default]
    Bypass,
    /// The agent may only plan; execution requires leaving plan mode.
    #[serde(alias = "plan")]
    PlanOnly,
}

impl PermissionMode {
    /// Value understood by the agent CLI's `--permission-mode` flag.
    #[must_use]
    pub fn as_cli_value(self) -> &'static str {
        match self {
            Self::Bypass => "bypassPermissions",
            Self::PlanOnly => "plan",
        }
    }

    /// Parse a command-surface mode string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StateConflict` for an unknown mode.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "bypass" | "bypassPermissions" => Ok(Self::Bypass),
            "plan" | "plan_only" => Ok(Self::PlanOnly),
            other => Err(AppError::StateConflict(format!(
                "unknown permission mode: {other}"
            ))),
        }
    }
}

/// Point-in-time snapshot of a session returned by `get_info`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Permission mode the process runs under.
    pub permission_mode: PermissionMode,
    /// Whether the agent is currently in plan mode.
    pub in_plan_mode: bool,
    /// Isolated workspace directory allocated to this session.
    pub workspace: PathBuf,
    /// Working directory of the agent process (inside the workspace).
    pub cwd: PathBuf,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent prompt, command, or process output.
    pub last_activity: DateTime<Utc>,
}
