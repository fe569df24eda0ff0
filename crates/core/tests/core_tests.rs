//! Wire-shape tests for the dashboard contract.

use clickup_orchestrator_core::api::{
    ServerMessage, SessionClientMessage, TaskLogsResponse, TaskResponse, TerminalClientMessage,
};
use clickup_orchestrator_core::model::{
    AgentKind, LogEntry, LogEventType, LogRead, Task, TaskStatus,
};
use serde_json::json;

fn sample_task() -> Task {
    Task {
        id: 5,
        clickup_task_id: "86abc".into(),
        clickup_list_id: Some("901".into()),
        name: "Add dark mode".into(),
        description: None,
        priority: Some(2),
        status: TaskStatus::InProgress,
        worktree_path: Some("/repo/worktrees/task-5-add-dark-mode".into()),
        branch_name: Some("task/86abc-add-dark-mode".into()),
        time_spent_ms: 1200,
        started_at_ms: Some(0),
        completed_at_ms: None,
        created_at_ms: 0,
        updated_at_ms: 0,
    }
}

#[test]
fn test_task_status_serde() {
    let serialized = serde_json::to_string(&TaskStatus::InProgress).unwrap();
    assert_eq!(serialized, r#""in_progress""#);
    let deserialized: TaskStatus = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized, TaskStatus::InProgress);
    for status in TaskStatus::ALL {
        assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
    }
    assert!("running".parse::<TaskStatus>().is_err());
}

#[test]
fn test_task_response_fields() {
    let value = serde_json::to_value(TaskResponse::from_task(sample_task(), true)).unwrap();
    assert_eq!(
        value,
        json!({
            "id": 5,
            "clickup_task_id": "86abc",
            "name": "Add dark mode",
            "description": null,
            "priority": 2,
            "status": "in_progress",
            "worktree_path": "/repo/worktrees/task-5-add-dark-mode",
            "time_spent_ms": 1200,
            "started_at": "1970-01-01T00:00:00+00:00",
            "completed_at": null,
            "is_running": true
        })
    );
}

#[test]
fn test_logs_response_variants() {
    let entry = LogEntry {
        id: 1,
        task_id: 5,
        event_type: LogEventType::Output,
        message: "hello".into(),
        is_stderr: Some(false),
        created_at_ms: 0,
    };
    let structured = serde_json::to_value(TaskLogsResponse::from(LogRead::Structured(vec![entry]))).unwrap();
    assert_eq!(
        structured,
        json!({"logs": [{
            "id": 1, "task_id": 5, "event_type": "output", "message": "hello",
            "is_stderr": false, "created_at": "1970-01-01T00:00:00+00:00"
        }]})
    );

    let legacy = serde_json::to_value(TaskLogsResponse::from(LogRead::Legacy("old".into()))).unwrap();
    assert_eq!(legacy, json!({"logs": [], "legacy_output_log": "old"}));
}

#[test]
fn test_server_message_shapes() {
    let connected = ServerMessage::Connected {
        task_id: Some(5),
        session_id: None,
        is_running: true,
    };
    assert_eq!(
        serde_json::to_value(&connected).unwrap(),
        json!({"type": "connected", "task_id": 5, "is_running": true})
    );
    let output = ServerMessage::Output {
        line: "x".into(),
        is_stderr: true,
    };
    assert_eq!(
        serde_json::to_value(&output).unwrap(),
        json!({"type": "output", "line": "x", "is_stderr": true})
    );
    assert_eq!(
        serde_json::to_value(ServerMessage::Spawned { pid: 42 }).unwrap(),
        json!({"type": "spawned", "pid": 42})
    );
}

#[test]
fn test_client_messages_parse() {
    let input: TerminalClientMessage = serde_json::from_str(r#"{"type":"input","data":"y\n"}"#).unwrap();
    assert_eq!(input, TerminalClientMessage::Input { data: "y\n".into() });
    let kill: TerminalClientMessage = serde_json::from_str(r#"{"type":"kill"}"#).unwrap();
    assert_eq!(kill, TerminalClientMessage::Kill);

    let spawn: SessionClientMessage = serde_json::from_str(
        r#"{"type":"spawn","prompt":"make it blue","agent":"codex","worktree_path":"/tmp/x"}"#,
    )
    .unwrap();
    assert_eq!(
        spawn,
        SessionClientMessage::Spawn {
            prompt: "make it blue".into(),
            agent: AgentKind::Codex,
            worktree_path: "/tmp/x".into(),
        }
    );
}
