use serde_json::json;

use agent_relay::ipc::IpcRequest;

fn parse(value: serde_json::Value) -> IpcRequest {
    serde_json::from_value(value).expect("valid request")
}

#[test]
fn create_defaults_are_optional() {
    assert_eq!(
        parse(json!({"command": "create"})),
        IpcRequest::Create {
            cwd: None,
            execution_targets: Vec::new(),
            mode: None,
        }
    );
    assert_eq!(
        parse(json!({"command": "create", "cwd": "app", "execution_targets": ["Read"], "mode": "plan"})),
        IpcRequest::Create {
            cwd: Some("app".into()),
            execution_targets: vec!["Read".into()],
            mode: Some("plan".into()),
        }
    );
}

#[test]
fn commands_are_snake_case() {
    let request = parse(json!({"command": "batch_prompt", "ids": ["a", "b"], "text": "go"}));
    assert_eq!(request.name(), "batch_prompt");

    let request = parse(json!({"command": "respond", "id": "s", "permission_id": "p", "decision": "deny"}));
    assert_eq!(request.name(), "respond");

    assert_eq!(parse(json!({"command": "list"})), IpcRequest::List);
    assert_eq!(
        parse(json!({"command": "pending"})),
        IpcRequest::Pending { id: None }
    );
}

#[test]
fn null_optionals_are_accepted() {
    assert_eq!(
        parse(json!({"command": "output", "id": "s", "offset": null})),
        IpcRequest::Output {
            id: "s".into(),
            offset: None,
        }
    );
    assert_eq!(
        parse(json!({"command": "slash", "id": "s", "name": "compact", "args": null})),
        IpcRequest::Slash {
            id: "s".into(),
            name: "compact".into(),
            args: None,
        }
    );
}

#[test]
fn unknown_commands_and_missing_fields_are_rejected() {
    assert!(serde_json::from_value::<IpcRequest>(json!({"command": "reboot"})).is_err());
    assert!(serde_json::from_value::<IpcRequest>(json!({"command": "prompt", "id": "s"})).is_err());
}
