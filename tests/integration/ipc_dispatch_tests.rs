//! Command dispatch: request parsing, payloads, and structured errors.

use serde_json::{json, Value};

use agent_relay::ipc::{dispatch, handle_line, IpcRequest, IpcResponse};
use agent_relay::orchestrator::SessionManager;

use super::test_helpers::{eventually, next_agent, test_config, test_manager};

async fn send(manager: &SessionManager, request: Value) -> IpcResponse {
    handle_line(manager, &request.to_string()).await
}

fn error_code(response: &IpcResponse) -> &str {
    assert!(!response.ok, "expected failure, got {response:?}");
    &response.error.as_ref().expect("error payload").code
}

fn data(response: IpcResponse) -> Value {
    assert!(response.ok, "expected success, got {response:?}");
    response.data.expect("data payload")
}

#[tokio::test]
async fn create_list_and_info() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));

    let created = data(send(&manager, json!({"command": "create", "cwd": "repo", "mode": "plan"})).await);
    let _agent = next_agent(&mut agents).await;
    let id = created["id"].as_str().expect("id").to_owned();
    assert_eq!(created["status"], "idle");
    assert_eq!(created["permissionMode"], "plan_only");
    assert_eq!(created["inPlanMode"], true);

    let listed = data(send(&manager, json!({"command": "list"})).await);
    assert_eq!(listed["sessions"].as_array().expect("sessions").len(), 1);
    assert_eq!(listed["sessions"][0]["id"], id.as_str());

    let info = data(send(&manager, json!({"command": "info", "id": id})).await);
    assert_eq!(info["id"], id.as_str());
    assert!(info["cwd"].as_str().expect("cwd").ends_with("repo"));
}

#[tokio::test]
async fn malformed_requests_are_state_conflicts() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, _agents) = test_manager(test_config(root.path()));

    assert_eq!(error_code(&handle_line(&manager, "not json").await), "state_conflict");
    assert_eq!(
        error_code(&send(&manager, json!({"command": "explode"})).await),
        "state_conflict"
    );
    assert_eq!(
        error_code(&send(&manager, json!({"command": "create", "mode": "yolo"})).await),
        "state_conflict"
    );
    assert!(manager.session_ids().await.is_empty());
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, _agents) = test_manager(test_config(root.path()));

    for request in [
        json!({"command": "info", "id": "ghost"}),
        json!({"command": "prompt", "id": "ghost", "text": "hi"}),
        json!({"command": "terminate", "id": "ghost"}),
        json!({"command": "output", "id": "ghost"}),
        json!({"command": "read_file", "id": "ghost", "path": "a"}),
    ] {
        let response = send(&manager, request.clone()).await;
        assert_eq!(error_code(&response), "not_found", "{request}");
    }
}

#[tokio::test]
async fn capacity_and_path_errors_carry_codes() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.max_concurrent_sessions = 1;
    let (manager, _launcher, mut agents) = test_manager(config);

    assert_eq!(
        error_code(&send(&manager, json!({"command": "create", "cwd": "../up"})).await),
        "path_violation"
    );
    data(send(&manager, json!({"command": "create"})).await);
    let _agent = next_agent(&mut agents).await;
    assert_eq!(
        error_code(&send(&manager, json!({"command": "create"})).await),
        "capacity"
    );
}

#[tokio::test]
async fn batch_commands_report_per_item_results() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let id = data(send(&manager, json!({"command": "create"})).await)["id"]
        .as_str()
        .expect("id")
        .to_owned();
    let _agent = next_agent(&mut agents).await;

    let info = data(send(&manager, json!({"command": "batch_info", "ids": [id, "ghost"]})).await);
    let results = info["results"].as_array().expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[0]["data"]["id"], id.as_str());
    assert_eq!(results[1]["ok"], false);
    assert_eq!(results[1]["error"]["code"], "not_found");

    let terminated =
        data(send(&manager, json!({"command": "batch_terminate", "ids": [id, "ghost"]})).await);
    assert_eq!(terminated["results"][0]["ok"], true);
    assert_eq!(terminated["results"][1]["ok"], false);
    assert!(manager.session_ids().await.is_empty());
}

#[tokio::test]
async fn batch_size_is_bounded() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, _agents) = test_manager(test_config(root.path()));

    let ids: Vec<String> = (0..11).map(|i| format!("s{i}")).collect();
    assert_eq!(
        error_code(&send(&manager, json!({"command": "batch_info", "ids": ids})).await),
        "state_conflict"
    );
    assert_eq!(
        error_code(&send(&manager, json!({"command": "batch_prompt", "ids": [], "text": "x"})).await),
        "state_conflict"
    );
}

#[tokio::test]
async fn respond_rejects_unknown_decisions() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let id = data(send(&manager, json!({"command": "create"})).await)["id"]
        .as_str()
        .expect("id")
        .to_owned();
    let mut agent = next_agent(&mut agents).await;

    agent
        .ask_permission("req-1", "Bash", json!({"command": "ls"}))
        .await;
    eventually(|| async { manager.list_pending(Some(&id)).await.len() == 1 }).await;

    let pending = data(send(&manager, json!({"command": "pending", "id": id})).await);
    let permission_id = pending["pending"][0]["id"].as_str().expect("id").to_owned();
    assert_eq!(pending["pending"][0]["kind"], "permission");
    assert!(pending["pending"][0]["remainingSeconds"].as_u64().is_some());

    assert_eq!(
        error_code(
            &send(
                &manager,
                json!({"command": "respond", "id": id, "permission_id": permission_id, "decision": "maybe"})
            )
            .await
        ),
        "state_conflict"
    );

    let ok = data(
        send(
            &manager,
            json!({"command": "respond", "id": id, "permission_id": permission_id, "decision": "allow_always"}),
        )
        .await,
    );
    assert_eq!(ok["decision"], "allow_always");
    assert_eq!(agent.recv().await["response"]["response"]["behavior"], "allow");
}

#[tokio::test]
async fn prompt_output_and_files_round_trip() {
    let root = tempfile::tempdir().expect("tempdir");
    let (manager, _launcher, mut agents) = test_manager(test_config(root.path()));
    let created = data(send(&manager, json!({"command": "create"})).await);
    let id = created["id"].as_str().expect("id").to_owned();
    let workspace = created["workspace"].as_str().expect("workspace").to_owned();
    let mut agent = next_agent(&mut agents).await;

    data(dispatch(&manager, IpcRequest::Prompt { id: id.clone(), text: "build".into() }).await);
    assert_eq!(agent.recv().await["message"]["content"], "build");

    let output = data(send(&manager, json!({"command": "output", "id": id, "offset": 0})).await);
    assert_eq!(output["entries"], json!(["[prompt] build"]));
    assert_eq!(output["nextOffset"], 1);

    std::fs::write(std::path::Path::new(&workspace).join("notes.md"), "# notes").expect("write");
    let file = data(send(&manager, json!({"command": "read_file", "id": id, "path": "notes.md"})).await);
    assert_eq!(file["content"], "# notes");
    let listing = data(send(&manager, json!({"command": "list_files", "id": id})).await);
    assert_eq!(listing["entries"][0]["name"], "notes.md");
    assert_eq!(listing["entries"][0]["kind"], "file");
    let stat = data(send(&manager, json!({"command": "stat_file", "id": id, "path": "notes.md"})).await);
    assert_eq!(stat["size"], 7);
    assert_eq!(
        error_code(&send(&manager, json!({"command": "stat_file", "id": id, "path": "../.."})).await),
        "path_violation"
    );
}
