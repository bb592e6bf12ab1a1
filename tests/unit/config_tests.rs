use std::time::Duration;

use agent_relay::config::{GlobalConfig, WEBHOOK_TOKEN_ENV};
use agent_relay::AppError;
use serial_test::serial;

fn sample_toml(workspace: &str) -> String {
    format!(
        r#"
workspace_root = '{workspace}'
max_concurrent_sessions = 3
host_cli = "claude"
host_cli_args = ["--print", "--output-format", "stream-json"]
ipc_name = "relay-test"
history_limit = 50

[timeouts]
question_seconds = 120
idle_seconds = 600
reap_interval_seconds = 30
terminate_seconds = 5

[stream]
text_flush_ms = 250
tool_ttl_seconds = 90
failure_threshold = 4

[webhook]
url = "https://controller.example/hook"
batch_interval_ms = 750
max_attempts = 4
base_delay_ms = 200
pool_size = 2
request_timeout_seconds = 15
"#
    )
}

fn minimal_toml(workspace: &str) -> String {
    format!("workspace_root = '{workspace}'\n")
}

#[test]
fn parses_valid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"));

    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");

    assert_eq!(config.max_concurrent_sessions, 3);
    assert_eq!(config.ipc_name, "relay-test");
    assert_eq!(config.history_limit, 50);
    assert_eq!(config.host_cli_args.len(), 3);
    assert_eq!(config.question_timeout(), Duration::from_secs(120));
    assert_eq!(config.idle_timeout(), Duration::from_secs(600));
    assert_eq!(config.reap_interval(), Duration::from_secs(30));
    assert_eq!(config.terminate_timeout(), Duration::from_secs(5));
    assert_eq!(config.stream.text_flush_ms, 250);
    assert_eq!(config.stream.failure_threshold, 4);
    assert_eq!(
        config.webhook.url.as_deref(),
        Some("https://controller.example/hook")
    );
    assert_eq!(config.webhook.batch_interval(), Duration::from_millis(750));
    assert_eq!(config.webhook.base_delay(), Duration::from_millis(200));
    assert_eq!(config.webhook.request_timeout(), Duration::from_secs(15));
    assert!(
        config.webhook.auth_token.is_none(),
        "the token is never read from the file"
    );
}

#[test]
fn minimal_config_uses_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::from_toml_str(&minimal_toml(temp.path().to_str().expect("utf8")))
        .expect("config parses");

    assert_eq!(config.max_concurrent_sessions, 5);
    assert_eq!(config.host_cli, "claude");
    assert!(config.host_cli_args.contains(&"stream-json".to_owned()));
    assert_eq!(config.ipc_name, "agent-relay");
    assert_eq!(config.question_timeout(), Duration::from_secs(300));
    assert_eq!(config.webhook.max_attempts, 3);
    assert!(config.webhook.url.is_none());
}

#[test]
fn workspace_root_is_created_and_canonicalized() {
    let temp = tempfile::tempdir().expect("tempdir");
    let nested = temp.path().join("a").join("..").join("root");

    let config = GlobalConfig::with_workspace_root(&nested).expect("valid config");

    assert!(config.workspace_root().is_dir());
    assert!(config.workspace_root().is_absolute());
    assert_eq!(
        config.workspace_root(),
        temp.path().join("root").canonicalize().expect("canonical")
    );
}

#[test]
fn override_replaces_the_workspace_root() {
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig::with_workspace_root(first.path()).expect("valid config");

    config
        .override_workspace_root(second.path())
        .expect("override succeeds");

    assert_eq!(
        config.workspace_root(),
        second.path().canonicalize().expect("canonical")
    );
}

#[test]
fn zero_session_limit_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        "workspace_root = '{}'\nmax_concurrent_sessions = 0\n",
        temp.path().to_str().expect("utf8")
    );

    let err = GlobalConfig::from_toml_str(&toml).expect_err("zero limit rejected");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_webhook_attempts_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        "workspace_root = '{}'\n[webhook]\nmax_attempts = 0\n",
        temp.path().to_str().expect("utf8")
    );

    let err = GlobalConfig::from_toml_str(&toml).expect_err("zero attempts rejected");
    assert!(err.to_string().contains("max_attempts"));
}

#[test]
fn missing_workspace_root_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("max_concurrent_sessions = 2\n").expect_err("missing root");
    assert_eq!(err.code(), "config");
}

#[test]
fn unreadable_file_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(temp.path().join("missing.toml"))
        .expect_err("missing file");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn loads_from_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        sample_toml(temp.path().join("ws").to_str().expect("utf8")),
    )
    .expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.webhook.pool_size, 2);
}

#[test]
#[serial]
fn credentials_come_from_environment() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig::with_workspace_root(temp.path()).expect("valid config");

    std::env::set_var(WEBHOOK_TOKEN_ENV, "secret-token");
    config.load_credentials();
    std::env::remove_var(WEBHOOK_TOKEN_ENV);

    assert_eq!(config.webhook.auth_token.as_deref(), Some("secret-token"));
}

#[test]
#[serial]
fn empty_token_is_ignored() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig::with_workspace_root(temp.path()).expect("valid config");

    std::env::set_var(WEBHOOK_TOKEN_ENV, "");
    config.load_credentials();
    std::env::remove_var(WEBHOOK_TOKEN_ENV);

    assert!(config.webhook.auth_token.is_none());
}
