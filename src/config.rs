//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{AppError, Result};

/// Environment variable holding the optional webhook bearer token.
pub const WEBHOOK_TOKEN_ENV: &str = "AGENT_RELAY_WEBHOOK_TOKEN";

/// Configurable timeout values (seconds) for session and request lifecycles.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for an unanswered question or permission request.
    #[serde(default = "default_question_seconds")]
    pub question_seconds: u64,
    /// Idle time after which an idle session is reaped.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    /// Interval between idle-reaper sweeps.
    #[serde(default = "default_reap_interval_seconds")]
    pub reap_interval_seconds: u64,
    /// Upper bound on a single session termination during reap or shutdown.
    #[serde(default = "default_terminate_seconds")]
    pub terminate_seconds: u64,
}

fn default_question_seconds() -> u64 {
    300
}

fn default_idle_seconds() -> u64 {
    1800
}

fn default_reap_interval_seconds() -> u64 {
    60
}

fn default_terminate_seconds() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            question_seconds: default_question_seconds(),
            idle_seconds: default_idle_seconds(),
            reap_interval_seconds: default_reap_interval_seconds(),
            terminate_seconds: default_terminate_seconds(),
        }
    }
}

/// Event stream shaping for a single session.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Aggregation window for partial text fragments.
    #[serde(default = "default_text_flush_ms")]
    pub text_flush_ms: u64,
    /// How long a tool invocation waits for its result before eviction.
    #[serde(default = "default_tool_ttl_seconds")]
    pub tool_ttl_seconds: u64,
    /// Consecutive callback failures before a health warning is logged.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_text_flush_ms() -> u64 {
    500
}

fn default_tool_ttl_seconds() -> u64 {
    600
}

fn default_failure_threshold() -> u32 {
    5
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            text_flush_ms: default_text_flush_ms(),
            tool_ttl_seconds: default_tool_ttl_seconds(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Outbound webhook delivery settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WebhookConfig {
    /// Target URL; delivery is disabled when absent.
    #[serde(default)]
    pub url: Option<String>,
    /// Batching window before queued updates are flushed.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// Total delivery attempts for a retryable failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles on each subsequent retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum number of persistent connections to the webhook host.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Bearer token (populated at runtime from the environment).
    #[serde(skip)]
    pub auth_token: Option<String>,
}

fn default_batch_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_pool_size() -> usize {
    4
}

fn default_request_timeout_seconds() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            batch_interval_ms: default_batch_interval_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            pool_size: default_pool_size(),
            request_timeout_seconds: default_request_timeout_seconds(),
            auth_token: None,
        }
    }
}

impl WebhookConfig {
    /// Batching window as a [`Duration`].
    #[must_use]
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Initial retry backoff as a [`Duration`].
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Per-request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_max_concurrent_sessions() -> usize {
    5
}

fn default_host_cli() -> String {
    "claude".into()
}

fn default_host_cli_args() -> Vec<String> {
    [
        "--print",
        "--verbose",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--include-partial-messages",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_ipc_name() -> String {
    "agent-relay".into()
}

fn default_history_limit() -> usize {
    1000
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory under which every session workspace and the lock file live.
    pub workspace_root: PathBuf,
    /// Maximum concurrent agent sessions.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Agent CLI binary.
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Arguments passed to the agent CLI before per-session flags.
    #[serde(default = "default_host_cli_args")]
    pub host_cli_args: Vec<String>,
    /// Named pipe / Unix socket identifier for the command server.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Retained output history entries per session.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Per-session stream shaping.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Outbound webhook delivery.
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `workspace_root` with every other value defaulted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the workspace root cannot be created.
    pub fn with_workspace_root(workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self {
            workspace_root: workspace_root.into(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            host_cli: default_host_cli(),
            host_cli_args: default_host_cli_args(),
            ipc_name: default_ipc_name(),
            history_limit: default_history_limit(),
            timeouts: TimeoutConfig::default(),
            stream: StreamConfig::default(),
            webhook: WebhookConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the workspace root and re-validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the new root cannot be created.
    pub fn override_workspace_root(&mut self, workspace_root: impl Into<PathBuf>) -> Result<()> {
        self.workspace_root = workspace_root.into();
        self.validate()
    }

    /// Pick up the webhook bearer token from the environment, if set.
    pub fn load_credentials(&mut self) {
        match env::var(WEBHOOK_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => self.webhook.auth_token = Some(token),
            _ => debug!(var = WEBHOOK_TOKEN_ENV, "no webhook token in environment"),
        }
    }

    /// Absolute path to the workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Deadline for unanswered questions and permission requests.
    #[must_use]
    pub fn question_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.question_seconds)
    }

    /// Idle time after which a session is reaped.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.idle_seconds)
    }

    /// Interval between reaper sweeps.
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts.reap_interval_seconds)
    }

    /// Bound on a single session termination.
    #[must_use]
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.terminate_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }

        if self.webhook.max_attempts == 0 {
            return Err(AppError::Config(
                "webhook.max_attempts must be greater than zero".into(),
            ));
        }

        if self.webhook.pool_size == 0 {
            return Err(AppError::Config(
                "webhook.pool_size must be greater than zero".into(),
            ));
        }

        if self.timeouts.reap_interval_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.reap_interval_seconds must be greater than zero".into(),
            ));
        }

        fs::create_dir_all(&self.workspace_root)
            .map_err(|err| AppError::Config(format!("workspace_root not creatable: {err}")))?;
        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
