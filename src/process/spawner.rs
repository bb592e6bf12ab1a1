//! Agent process launcher.
//!
//! Spawns headless agent processes with:
//! - `kill_on_drop(true)` so processes are cleaned up with their session.
//! - `env_clear()` + a variable allowlist so the webhook token and other
//!   secrets never reach the child's environment.
//! - The permission mode and allowed tools passed as CLI flags.
//!
//! The [`AgentLauncher`] trait is the seam sessions are built over; tests
//! substitute an in-memory process.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::info;

use crate::models::session::PermissionMode;
use crate::{AppError, Result};

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable from the server's environment is stripped via
/// `env_clear()` before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "RUST_LOG",
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Everything needed to start one session's process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Owning session.
    pub session_id: String,
    /// Working directory of the process.
    pub cwd: PathBuf,
    /// Initial permission mode.
    pub permission_mode: PermissionMode,
    /// Tools the process may use without asking; empty means no restriction.
    pub allowed_tools: Vec<String>,
}

/// A running agent process and its stdio streams.
pub struct AgentProcess {
    /// Child handle, kept alive so `kill_on_drop` works. `None` for
    /// in-memory processes.
    pub child: Option<Child>,
    /// Process input.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Process output.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProcess")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

/// Starts agent processes for sessions.
pub trait AgentLauncher: Send + Sync {
    /// Start a process for `spec`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the process cannot be started.
    fn launch<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + 'a>>;
}

/// Launches the host agent CLI as a child process.
#[derive(Debug, Clone)]
pub struct CliLauncher {
    /// Host CLI binary (e.g. `claude`).
    pub host_cli: String,
    /// Arguments passed before the per-session flags.
    pub host_cli_args: Vec<String>,
}

impl CliLauncher {
    /// Create a launcher for `host_cli` with its default arguments.
    #[must_use]
    pub fn new(host_cli: impl Into<String>, host_cli_args: Vec<String>) -> Self {
        Self {
            host_cli: host_cli.into(),
            host_cli_args,
        }
    }

    /// Build the command for `spec` without spawning it.
    #[must_use]
    pub fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&self.host_cli);
        cmd.args(&self.host_cli_args);
        cmd.arg("--permission-mode")
            .arg(spec.permission_mode.as_cli_value());
        if !spec.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(spec.allowed_tools.join(","));
        }

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env("AGENT_RELAY_SESSION_ID", &spec.session_id);

        cmd.current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl AgentLauncher for CliLauncher {
    fn launch<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + 'a>> {
        Box::pin(async move {
            let mut child = self
                .command(spec)
                .spawn()
                .map_err(|err| AppError::Process(format!("failed to spawn agent: {err}")))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Process("failed to capture agent stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Process("failed to capture agent stdout".into()))?;

            info!(
                session_id = spec.session_id,
                pid = child.id(),
                cwd = %spec.cwd.display(),
                "agent process spawned"
            );

            Ok(AgentProcess {
                child: Some(child),
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
            })
        })
    }
}
