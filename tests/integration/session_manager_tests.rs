//! Registry, capacity, lock mirroring, workspace access, reaping, shutdown.

use std::collections::HashSet;
use std::time::Duration;

use agent_relay::models::session::{PermissionMode, SessionStatus};
use agent_relay::orchestrator::recovery::read_lock;
use agent_relay::orchestrator::CreateSessionRequest;
use agent_relay::workspace::EntryKind;
use agent_relay::AppError;

use super::test_helpers::{eventually, next_agent, test_config, test_manager};

fn lock_ids(root: &std::path::Path) -> HashSet<String> {
    read_lock(root)
        .expect("lock record present")
        .session_ids
        .into_iter()
        .collect()
}

#[tokio::test]
async fn create_allocates_isolated_workspaces() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));

    let a = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create a");
    let b = manager
        .create_session(CreateSessionRequest {
            cwd: Some("app/src".into()),
            execution_targets: vec!["Read".into()],
            mode: PermissionMode::PlanOnly,
        })
        .await
        .expect("create b");
    let _agent_a = next_agent(&mut agents).await;
    let agent_b = next_agent(&mut agents).await;

    assert_ne!(a.id, b.id);
    assert_ne!(a.workspace, b.workspace);
    assert!(a.workspace.starts_with(manager.workspace_root()));
    assert!(b.cwd.ends_with("app/src"));
    assert!(b.cwd.is_dir());
    assert_eq!(agent_b.cwd, b.cwd);
    assert_eq!(b.permission_mode, PermissionMode::PlanOnly);
    assert!(b.in_plan_mode);
    assert_eq!(a.status, SessionStatus::Idle);
}

#[tokio::test]
async fn capacity_is_enforced_without_touching_the_registry() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.max_concurrent_sessions = 2;
    let (manager, _launcher, mut agents) = test_manager(config);

    let mut live = Vec::new();
    for _ in 0..2 {
        manager
            .create_session(CreateSessionRequest::default())
            .await
            .expect("within capacity");
        live.push(next_agent(&mut agents).await);
    }

    let err = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect_err("over capacity");

    assert!(matches!(err, AppError::Capacity(_)));
    assert_eq!(manager.list_sessions().await.len(), 2);
    assert_eq!(lock_ids(manager.workspace_root()).len(), 2);
}

#[tokio::test]
async fn lock_record_mirrors_registry_after_every_mutation() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    manager.recover().expect("recover");
    assert!(lock_ids(manager.workspace_root()).is_empty());

    let first = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let _a1 = next_agent(&mut agents).await;
    let second = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let _a2 = next_agent(&mut agents).await;

    let expected: HashSet<String> = manager.session_ids().await.into_iter().collect();
    assert_eq!(lock_ids(manager.workspace_root()), expected);

    manager.terminate_session(&first.id).await.expect("terminate");
    assert_eq!(
        lock_ids(manager.workspace_root()),
        HashSet::from([second.id.clone()])
    );

    let record = read_lock(manager.workspace_root()).expect("lock");
    assert_eq!(record.pid, std::process::id());
}

#[tokio::test]
async fn terminating_twice_is_not_found() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let info = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let mut agent = next_agent(&mut agents).await;

    manager.terminate_session(&info.id).await.expect("first terminate");

    assert!(matches!(
        manager.terminate_session(&info.id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        manager.terminate_session("no-such-session").await,
        Err(AppError::NotFound(_))
    ));
    assert!(agent.input_closed().await);
    assert!(info.workspace.is_dir(), "workspace is kept after termination");
    assert!(matches!(
        manager.send_prompt(&info.id, "late").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn cwd_outside_workspace_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, _agents) = test_manager(test_config(root.path()));

    let err = manager
        .create_session(CreateSessionRequest {
            cwd: Some("../../etc".into()),
            ..CreateSessionRequest::default()
        })
        .await
        .expect_err("escape rejected");

    assert!(matches!(err, AppError::PathViolation(_)));
    assert!(manager.list_sessions().await.is_empty());
    let leftovers = std::fs::read_dir(manager.workspace_root())
        .expect("read root")
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .count();
    assert_eq!(leftovers, 0, "the unused workspace is removed");
}

#[tokio::test]
async fn launch_failure_leaves_no_session() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, launcher, _agents) = test_manager(test_config(root.path()));
    launcher.fail_launches();

    let err = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect_err("launch fails");

    assert_eq!(err.code(), "process");
    assert!(manager.session_ids().await.is_empty());
}

#[tokio::test]
async fn output_history_records_prompts_and_text() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let info = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let mut agent = next_agent(&mut agents).await;

    manager.send_prompt(&info.id, "hello").await.expect("prompt");
    agent.recv().await;
    agent.text_delta("Hi there").await;
    agent.result("success").await;

    eventually(|| async {
        manager
            .get_info(&info.id)
            .await
            .is_ok_and(|i| i.status == SessionStatus::Idle)
    })
    .await;
    eventually(|| async {
        manager
            .read_output(&info.id, None)
            .await
            .is_ok_and(|page| page.entries.len() >= 2)
    })
    .await;

    let page = manager.read_output(&info.id, None).await.expect("output");
    assert_eq!(page.entries, ["[prompt] hello", "Hi there"]);
    assert_eq!(page.next_offset, 2);

    let tail = manager.read_output(&info.id, Some(1)).await.expect("tail");
    assert_eq!(tail.entries, ["Hi there"]);
    assert!(manager.read_output("ghost", None).await.is_err());
}

#[tokio::test]
async fn history_is_bounded() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.history_limit = 2;
    let (manager, _launcher, mut agents) = test_manager(config);
    let info = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let _agent = next_agent(&mut agents).await;

    for text in ["one", "two", "three"] {
        manager.send_prompt(&info.id, text).await.expect("prompt");
    }

    let page = manager.read_output(&info.id, None).await.expect("output");
    assert_eq!(page.entries, ["[prompt] two", "[prompt] three"]);
    assert_eq!(page.offset, 1);
    assert_eq!(page.dropped, 1);
}

#[tokio::test]
async fn workspace_files_are_readable_within_bounds() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let info = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let _agent = next_agent(&mut agents).await;

    std::fs::create_dir_all(info.workspace.join("src")).expect("mkdir");
    std::fs::write(info.workspace.join("src/main.rs"), "fn main() {}\n").expect("write");

    let file = manager.read_file(&info.id, "src/main.rs").await.expect("read");
    assert_eq!(file.content, "fn main() {}\n");
    assert!(!file.truncated);

    let entries = manager.list_files(&info.id, ".").await.expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "src");
    assert_eq!(entries[0].kind, EntryKind::Directory);

    let stat = manager.stat_file(&info.id, "src/main.rs").await.expect("stat");
    assert_eq!(stat.size, 13);
    assert_eq!(stat.kind, EntryKind::File);

    assert!(matches!(
        manager.read_file(&info.id, "../other/secret").await,
        Err(AppError::PathViolation(_))
    ));
    assert!(matches!(
        manager.read_file(&info.id, "missing.txt").await,
        Err(AppError::NotFound(_))
    ));

    manager.terminate_session(&info.id).await.expect("terminate");
    let after = manager
        .read_file(&info.id, "src/main.rs")
        .await
        .expect("retained workspace is still readable");
    assert_eq!(after.size, 13);
    assert!(matches!(
        manager.read_file("not-a-session", "x").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn reaper_terminates_only_idle_sessions_past_timeout() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.timeouts.idle_seconds = 0;
    let (manager, _launcher, mut agents) = test_manager(config);

    let idle = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let _idle_agent = next_agent(&mut agents).await;
    let busy = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let mut busy_agent = next_agent(&mut agents).await;
    manager.send_prompt(&busy.id, "work").await.expect("prompt");
    busy_agent.recv().await;

    let reaped = manager.reap_idle().await;

    assert_eq!(reaped, [idle.id.clone()]);
    assert_eq!(manager.session_ids().await, [busy.id.clone()]);
}

#[tokio::test]
async fn dead_sessions_are_deregistered_without_the_reaper() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.max_concurrent_sessions = 1;
    let (manager, _launcher, mut agents) = test_manager(config);
    let dead = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    drop(next_agent(&mut agents).await);

    eventually(|| async { manager.session_ids().await.is_empty() }).await;
    assert!(!lock_ids(manager.workspace_root()).contains(&dead.id));

    let replacement = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("the dead session no longer holds the only slot");
    let _agent = next_agent(&mut agents).await;
    assert_eq!(
        lock_ids(manager.workspace_root()),
        HashSet::from([replacement.id.clone()])
    );
    assert!(manager.reap_idle().await.is_empty());
}

#[tokio::test]
async fn dead_sessions_release_their_pending_requests() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let info = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let mut agent = next_agent(&mut agents).await;

    agent.ask_question("req-1", "Which database?").await;
    eventually(|| async { manager.list_pending(Some(&info.id)).await.len() == 1 }).await;

    drop(agent);

    eventually(|| async { manager.list_pending(None).await.is_empty() }).await;
    assert!(manager.session_ids().await.is_empty());
}

#[tokio::test]
async fn slow_launch_does_not_block_the_registry() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.max_concurrent_sessions = 1;
    let (manager, launcher, mut agents) = test_manager(config);
    launcher.hold_launches();

    let creating = tokio::spawn({
        let manager = manager.clone();
        async move { manager.create_session(CreateSessionRequest::default()).await }
    });
    eventually(|| async { launcher.launches_started() == 1 }).await;

    // Registry reads complete while the launch is parked.
    let ids = tokio::time::timeout(Duration::from_secs(1), manager.session_ids())
        .await
        .expect("registry lock is free during launch");
    assert!(ids.is_empty());

    // The in-flight create holds the only slot.
    assert!(matches!(
        manager.create_session(CreateSessionRequest::default()).await,
        Err(AppError::Capacity(_))
    ));
    assert_eq!(launcher.launches_started(), 1);

    launcher.release_launches();
    let info = creating.await.expect("join").expect("create");
    let _agent = next_agent(&mut agents).await;
    assert_eq!(manager.session_ids().await, [info.id.clone()]);
    assert_eq!(lock_ids(manager.workspace_root()), HashSet::from([info.id]));
}

#[tokio::test]
async fn failed_launch_releases_its_slot() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.max_concurrent_sessions = 1;
    let (manager, launcher, mut agents) = test_manager(config);

    launcher.fail_launches();
    assert!(manager
        .create_session(CreateSessionRequest::default())
        .await
        .is_err());

    launcher.allow_launches();
    manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("slot released after the failed launch");
    let _agent = next_agent(&mut agents).await;
    assert_eq!(manager.session_ids().await.len(), 1);
}

#[tokio::test]
async fn shutdown_terminates_everything_and_removes_lock() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    manager.recover().expect("recover");

    for _ in 0..2 {
        manager
            .create_session(CreateSessionRequest::default())
            .await
            .expect("create");
    }
    let mut first = next_agent(&mut agents).await;
    let mut second = next_agent(&mut agents).await;

    let (report, again) = tokio::join!(manager.shutdown(), manager.shutdown());

    assert_eq!(report.terminated, 2);
    assert_eq!(report.timed_out, 0);
    assert_eq!(report, again, "concurrent calls share one result");
    assert!(first.input_closed().await);
    assert!(second.input_closed().await);
    assert!(read_lock(manager.workspace_root()).is_none());
    assert!(matches!(
        manager.create_session(CreateSessionRequest::default()).await,
        Err(AppError::StateConflict(_))
    ));
    assert_eq!(manager.shutdown().await, report);
}

#[tokio::test]
async fn mode_change_and_cancel_through_manager() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let info = manager
        .create_session(CreateSessionRequest::default())
        .await
        .expect("create");
    let mut agent = next_agent(&mut agents).await;

    manager
        .set_mode(&info.id, PermissionMode::PlanOnly)
        .await
        .expect("mode");
    assert_eq!(agent.recv().await["request"]["mode"], "plan");
    assert!(manager.get_info(&info.id).await.expect("info").in_plan_mode);

    assert!(matches!(
        manager.cancel(&info.id).await,
        Err(AppError::StateConflict(_))
    ));
    manager
        .send_slash_command(&info.id, "/review", None)
        .await
        .expect("slash");
    assert_eq!(agent.recv().await["message"]["content"], "/review");
    manager.cancel(&info.id).await.expect("cancel");
    assert_eq!(agent.recv().await["request"]["subtype"], "interrupt");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        manager.get_info(&info.id).await.expect("info").status,
        SessionStatus::Idle
    );
}
