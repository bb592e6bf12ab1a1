//! Question and permission brokering between the process and the operator.

use serde_json::json;

use agent_relay::models::pending::{PendingKind, PendingSummary, PermissionDecision};
use agent_relay::orchestrator::{CreateSessionRequest, SessionManager};
use agent_relay::AppError;

use super::test_helpers::{eventually, next_agent, test_config, test_manager, FakeAgent};

async fn session(manager: &SessionManager, agents: &mut tokio::sync::mpsc::UnboundedReceiver<FakeAgent>) -> (String, FakeAgent) {
    let info = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    (info.id, next_agent(agents).await)
}

async fn wait_pending(manager: &SessionManager, id: &str, count: usize) -> Vec<PendingSummary> {
    eventually(|| async { manager.list_pending(Some(id)).await.len() == count }).await;
    manager.list_pending(Some(id)).await
}

#[tokio::test]
async fn answered_question_is_delivered_to_the_process() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let (id, mut agent) = session(&manager, &mut agents).await;

    agent.ask_question("req-q1", "Ship it?").await;
    let pending = wait_pending(&manager, &id, 1).await;
    assert_eq!(pending[0].kind, PendingKind::Question);
    assert_eq!(pending[0].subject, "Ship it?");
    assert!(pending[0].remaining_seconds > 0);

    manager
        .answer_question(&id, &pending[0].id, "Yes")
        .await
        .expect("answer");

    let response = agent.recv().await;
    assert_eq!(response["type"], "control_response");
    assert_eq!(response["response"]["request_id"], "req-q1");
    let inner = &response["response"]["response"];
    assert_eq!(inner["behavior"], "allow");
    assert_eq!(inner["updatedInput"]["answers"]["Ship it?"], "Yes");
    assert!(inner["updatedInput"]["questions"].is_array());

    assert!(manager.list_pending(Some(&id)).await.is_empty());
    assert!(matches!(
        manager.answer_question(&id, &pending[0].id, "again").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn unanswered_question_expires_with_a_deny() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.timeouts.question_seconds = 1;
    let (manager, _launcher, mut agents) = test_manager(config);
    let (id, mut agent) = session(&manager, &mut agents).await;

    agent.ask_question("req-late", "Still there?").await;
    let pending = wait_pending(&manager, &id, 1).await;

    let response = agent.recv().await;
    assert_eq!(response["response"]["request_id"], "req-late");
    assert_eq!(response["response"]["response"]["behavior"], "deny");

    assert!(manager.list_pending(None).await.is_empty());
    assert!(matches!(
        manager.answer_question(&id, &pending[0].id, "too late").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn permission_decisions_map_to_allow_and_deny() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let (id, mut agent) = session(&manager, &mut agents).await;

    agent
        .ask_permission("req-p1", "Bash", json!({"command": "ls"}))
        .await;
    let pending = wait_pending(&manager, &id, 1).await;
    assert_eq!(pending[0].kind, PendingKind::Permission);
    assert_eq!(pending[0].subject, "Bash");

    manager
        .respond_permission(&id, &pending[0].id, PermissionDecision::Allow)
        .await
        .expect("allow");
    let allowed = agent.recv().await;
    assert_eq!(allowed["response"]["response"]["behavior"], "allow");
    assert_eq!(
        allowed["response"]["response"]["updatedInput"]["command"],
        "ls"
    );

    agent
        .ask_permission("req-p2", "Bash", json!({"command": "rm -rf /"}))
        .await;
    let pending = wait_pending(&manager, &id, 1).await;
    manager
        .respond_permission(&id, &pending[0].id, PermissionDecision::Deny)
        .await
        .expect("deny");
    let denied = agent.recv().await;
    assert_eq!(denied["response"]["request_id"], "req-p2");
    assert_eq!(denied["response"]["response"]["behavior"], "deny");
}

#[tokio::test]
async fn allow_always_grants_later_requests_for_the_same_tool() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let (id, mut agent) = session(&manager, &mut agents).await;

    agent.ask_permission("req-1", "Edit", json!({"file": "a"})).await;
    let pending = wait_pending(&manager, &id, 1).await;
    manager
        .respond_permission(&id, &pending[0].id, PermissionDecision::AllowAlways)
        .await
        .expect("allow always");
    assert_eq!(agent.recv().await["response"]["request_id"], "req-1");

    agent.ask_permission("req-2", "Edit", json!({"file": "b"})).await;
    let auto = agent.recv().await;
    assert_eq!(auto["response"]["request_id"], "req-2");
    assert_eq!(auto["response"]["response"]["behavior"], "allow");
    assert!(manager.list_pending(Some(&id)).await.is_empty());

    agent.ask_permission("req-3", "Bash", json!({"command": "make"})).await;
    let pending = wait_pending(&manager, &id, 1).await;
    assert_eq!(pending[0].subject, "Bash");
}

#[tokio::test]
async fn grants_do_not_cross_sessions() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let (first, mut first_agent) = session(&manager, &mut agents).await;
    let (second, mut second_agent) = session(&manager, &mut agents).await;

    first_agent.ask_permission("req-a", "Write", json!({})).await;
    let pending = wait_pending(&manager, &first, 1).await;
    manager
        .respond_permission(&first, &pending[0].id, PermissionDecision::AllowAlways)
        .await
        .expect("allow always");
    first_agent.recv().await;

    second_agent.ask_permission("req-b", "Write", json!({})).await;
    let pending = wait_pending(&manager, &second, 1).await;
    assert_eq!(pending[0].session_id, second);
}

#[tokio::test]
async fn mismatched_resolutions_are_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let (id, mut agent) = session(&manager, &mut agents).await;
    let (other, _other_agent) = session(&manager, &mut agents).await;

    agent.ask_permission("req-x", "Bash", json!({})).await;
    let permission = wait_pending(&manager, &id, 1).await.remove(0);

    assert!(matches!(
        manager.answer_question(&id, &permission.id, "text").await,
        Err(AppError::StateConflict(_))
    ));
    assert!(matches!(
        manager
            .respond_permission(&other, &permission.id, PermissionDecision::Allow)
            .await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        manager
            .respond_permission(&id, "unknown-id", PermissionDecision::Allow)
            .await,
        Err(AppError::NotFound(_))
    ));

    agent.ask_question("req-y", "Which?").await;
    let pending = wait_pending(&manager, &id, 2).await;
    let question = pending
        .iter()
        .find(|p| p.kind == PendingKind::Question)
        .expect("question pending");
    assert!(matches!(
        manager
            .respond_permission(&id, &question.id, PermissionDecision::Allow)
            .await,
        Err(AppError::StateConflict(_))
    ));
    assert_eq!(manager.list_pending(Some(&id)).await.len(), 2);
}

#[tokio::test]
async fn terminate_rejects_outstanding_requests() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let (id, mut agent) = session(&manager, &mut agents).await;
    let (other, mut other_agent) = session(&manager, &mut agents).await;

    agent.ask_question("req-1", "One?").await;
    other_agent.ask_question("req-2", "Two?").await;
    let pending = wait_pending(&manager, &id, 1).await;
    wait_pending(&manager, &other, 1).await;

    manager.terminate_session(&id).await.expect("terminate");

    assert!(manager.list_pending(Some(&id)).await.is_empty());
    assert_eq!(manager.list_pending(None).await.len(), 1);
    assert!(matches!(
        manager.answer_question(&id, &pending[0].id, "late").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn shutdown_rejects_everything() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let (id, mut agent) = session(&manager, &mut agents).await;

    agent.ask_permission("req-1", "Bash", json!({})).await;
    agent.ask_question("req-2", "Why?").await;
    wait_pending(&manager, &id, 2).await;

    let report = manager.shutdown().await;

    assert_eq!(report.rejected, 2);
    assert!(manager.list_pending(None).await.is_empty());
}
