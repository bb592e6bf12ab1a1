//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Requested session, question, permission, or workspace does not exist.
    NotFound(String),
    /// The configured concurrent session limit has been reached.
    Capacity(String),
    /// Operation is invalid for the current session status or mode.
    StateConflict(String),
    /// File system path failed validation against the workspace root.
    PathViolation(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Webhook delivery failure.
    Transport(String),
    /// Execution process stream, codec, or spawn failure.
    Process(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// Unexpected failure caught at the command boundary.
    Internal(String),
}

impl AppError {
    /// Stable machine-readable error code surfaced to command callers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Capacity(_) => "capacity",
            Self::StateConflict(_) => "state_conflict",
            Self::PathViolation(_) => "path_violation",
            Self::Io(_) => "io",
            Self::Transport(_) => "transport",
            Self::Process(_) => "process",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the failure is a client-class error that retrying cannot fix.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Capacity(_) | Self::StateConflict(_) | Self::PathViolation(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Capacity(msg) => write!(f, "capacity: {msg}"),
            Self::StateConflict(msg) => write!(f, "state conflict: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
