mod common;

use std::time::Duration;

use clickup_orchestrator_core::model::{settings, LogEventType, LogRead, NewTask, TaskStatus, UnitId};
use clickup_orchestrator_daemon::error::ApiError;
use common::{harness, sh_agent};

fn messages(read: LogRead) -> Vec<(LogEventType, String)> {
    match read {
        LogRead::Structured(entries) => entries.into_iter().map(|e| (e.event_type, e.message)).collect(),
        LogRead::Legacy(blob) => panic!("unexpected legacy log: {blob}"),
    }
}

#[tokio::test]
async fn admits_by_priority_within_the_limit() {
    let h = harness(sh_agent("sleep 30"));
    h.tracker.push("low", "Low priority", Some(3));
    h.tracker.push("urgent", "Urgent fix", Some(1));
    h.tracker.push("none", "No priority", None);

    let report = h.state.tasks.poll_once().await.unwrap();
    assert_eq!(report.ingested, 3);
    let urgent = h.task_by_clickup("urgent");
    assert_eq!(report.admitted, vec![urgent.id]);
    assert_eq!(h.task(urgent.id).status, TaskStatus::InProgress);
    assert!(h.state.supervisor.is_running(&UnitId::Task(urgent.id)).await);
    assert_eq!(h.task_by_clickup("low").status, TaskStatus::Queued);
    assert_eq!(
        h.tracker.status_updates.lock().clone(),
        vec![("urgent".to_string(), "In Development".to_string())]
    );

    // Re-polling neither duplicates tasks nor exceeds the limit.
    let report = h.state.tasks.poll_once().await.unwrap();
    assert_eq!(report.ingested, 0);
    assert!(report.admitted.is_empty());

    h.state.tasks.stop(urgent.id).await.unwrap();
    assert_eq!(h.task(urgent.id).status, TaskStatus::Stopped);

    let report = h.state.tasks.poll_once().await.unwrap();
    let low = h.task_by_clickup("low");
    assert_eq!(report.admitted, vec![low.id], "priority 3 before unset");

    h.state.tasks.stop(low.id).await.unwrap();
    h.state.supervisor.kill_all().await;
}

#[tokio::test]
async fn parallel_limit_is_never_exceeded() {
    let h = harness(sh_agent("sleep 30"));
    h.set(settings::PARALLEL_LIMIT, "2");
    for n in 0..5 {
        h.tracker.push(&format!("t{n}"), &format!("Task {n}"), Some(2));
    }

    let (a, b) = tokio::join!(h.state.tasks.poll_once(), h.state.tasks.poll_once());
    let admitted = a.unwrap().admitted.len() + b.unwrap().admitted.len();
    assert_eq!(admitted, 2);
    let stats = h.state.tasks.stats().await.unwrap();
    assert_eq!(stats.in_progress, 2);
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.running_processes, 2);

    h.state.supervisor.kill_all().await;
}

#[tokio::test]
async fn successful_run_completes_and_logs() {
    let h = harness(sh_agent("echo \"$ORCHESTRATOR_PROMPT\" | head -1; exit 0"));
    h.tracker.push("abc", "Fix login page", Some(2));

    // Terminal clients connected before the run see the exit line once.
    let mut sub = h.state.gateway.subscribe(&UnitId::Task(1));

    let report = h.state.tasks.poll_once().await.unwrap();
    assert_eq!(report.admitted, vec![1]);
    let task = h.wait_status(1, TaskStatus::Completed).await;

    let worktree = task.worktree_path.clone().expect("worktree recorded");
    assert!(worktree.ends_with("worktrees/task-1-fix-login-page"));
    assert!(std::path::Path::new(&worktree).is_dir());
    assert_eq!(task.branch_name.as_deref(), Some("task/abc-fix-login-page"));
    assert!(task.completed_at_ms.is_some());

    let mut streamed = Vec::new();
    while let Ok(Some(line)) =
        tokio::time::timeout(Duration::from_millis(200), sub.live.recv()).await
    {
        streamed.push(line.line);
    }
    assert_eq!(streamed.first().map(String::as_str), Some("## Task"));
    assert_eq!(
        streamed.iter().filter(|l| l.contains("[Process exited")).count(),
        1
    );

    let log = messages(h.state.logs.read(1).await.unwrap());
    assert_eq!(log[0], (LogEventType::System, "Task created from ClickUp".to_string()));
    assert!(log.contains(&(LogEventType::Output, "## Task".to_string())));
    assert!(log
        .iter()
        .any(|(t, m)| *t == LogEventType::System && m.starts_with("Agent spawned (PID: ")));
    assert!(log.contains(&(
        LogEventType::Status,
        "Status changed: in_progress -> completed (exit code 0)".to_string()
    )));

    for _ in 0..100 {
        if !h.tracker.time_entries.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.tracker.time_entries.lock().clone(), vec!["abc".to_string()]);

    let runs = h.db().process_sessions(1).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].1, Some(0), "session closed with the exit code");

    h.state.tasks.delete(1).await.unwrap();
    assert!(h.db().get_task(1).unwrap().is_none());
    assert!(!std::path::Path::new(&worktree).exists());
    assert!(matches!(h.state.tasks.get(1).await, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn failed_run_can_be_restarted() {
    let h = harness(sh_agent("echo boom >&2; exit 2"));
    h.tracker.push("f1", "Flaky", Some(1));

    h.state.tasks.poll_once().await.unwrap();
    h.wait_status(1, TaskStatus::Failed).await;

    let log = messages(h.state.logs.read(1).await.unwrap());
    assert!(log.contains(&(
        LogEventType::Status,
        "Status changed: in_progress -> failed (exit code 2)".to_string()
    )));
    assert!(h.tracker.time_entries.lock().is_empty());

    // Restarting reuses the recorded worktree.
    let before = h.task(1).worktree_path;
    let restarted = h.state.tasks.restart(1).await.unwrap();
    assert!(matches!(
        restarted.status,
        TaskStatus::InProgress | TaskStatus::Failed
    ));
    let task = h.wait_status(1, TaskStatus::Failed).await;
    assert_eq!(task.worktree_path, before);
}

#[tokio::test]
async fn restart_queues_when_no_slot_is_free() {
    let h = harness(sh_agent("sleep 30"));
    h.tracker.push("a", "First", Some(1));
    h.tracker.push("b", "Second", Some(2));
    h.state.tasks.poll_once().await.unwrap();

    let first = h.task_by_clickup("a");
    let second = h.task_by_clickup("b");
    h.state.tasks.stop(first.id).await.unwrap();
    h.state.tasks.poll_once().await.unwrap();
    assert_eq!(h.task(second.id).status, TaskStatus::InProgress);

    let resp = h.state.tasks.restart(first.id).await.unwrap();
    assert_eq!(resp.status, TaskStatus::Queued);
    assert!(!resp.is_running);

    h.state.supervisor.kill_all().await;
}

#[tokio::test]
async fn invalid_actions_are_rejected() {
    let h = harness(sh_agent("sleep 30"));
    h.tracker.push("x", "Busy", Some(1));
    h.state.tasks.poll_once().await.unwrap();

    let err = h.state.tasks.delete(1).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{err}");
    let err = h.state.tasks.restart(1).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation(_) | ApiError::Conflict(_)), "{err}");
    assert!(matches!(h.state.tasks.stop(42).await, Err(ApiError::NotFound(_))));

    let resp = h.state.tasks.complete(1).await.unwrap();
    assert_eq!(resp.status, TaskStatus::Completed);
    h.state.supervisor.wait_exit(&UnitId::Task(1)).await;
    // The kill that followed does not override the manual completion.
    assert_eq!(h.task(1).status, TaskStatus::Completed);
}

#[tokio::test]
async fn launch_failure_marks_task_failed() {
    let h = harness(sh_agent("exit 0"));
    h.set(settings::DEV_BRANCH, "no-such-branch");
    h.tracker.push("w", "Needs worktree", None);

    let report = h.state.tasks.poll_once().await.unwrap();
    assert_eq!(report.admitted, vec![1]);
    assert_eq!(h.task(1).status, TaskStatus::Failed);
    let log = messages(h.state.logs.read(1).await.unwrap());
    assert!(log
        .iter()
        .any(|(t, m)| *t == LogEventType::System && m.starts_with("Failed to create worktree")));
}

#[tokio::test]
async fn tracker_outage_does_not_block_admission() {
    let h = harness(sh_agent("sleep 30"));
    *h.tracker.fail_listing.lock() = true;
    let task = h
        .db()
        .insert_task(&NewTask {
            clickup_task_id: "local".into(),
            clickup_list_id: Some("L1".into()),
            name: "Already known".into(),
            description: None,
            priority: Some(2),
        })
        .unwrap()
        .unwrap();

    let report = h.state.tasks.poll_once().await.unwrap();
    assert_eq!(report.ingested, 0);
    assert_eq!(report.admitted, vec![task.id]);

    h.state.supervisor.kill_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_during_launch_leaves_no_process_behind() {
    let h = harness(sh_agent("sleep 30"));
    h.tracker.push("s", "Stopped early", Some(1));

    let tasks = h.state.tasks.clone();
    let poll = tokio::spawn(async move { tasks.poll_once().await });
    for _ in 0..5_000 {
        if h.db().get_task(1).unwrap().map(|t| t.status) == Some(TaskStatus::InProgress) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let resp = h.state.tasks.stop(1).await.unwrap();
    assert_eq!(resp.status, TaskStatus::Stopped);
    poll.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.task(1).status, TaskStatus::Stopped);
    assert!(!h.state.supervisor.is_running(&UnitId::Task(1)).await);
    assert!(h.state.supervisor.running().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_restarts_launch_once() {
    let h = harness(sh_agent("sleep 30"));
    h.tracker.push("r", "Restart me", Some(1));
    h.state.tasks.poll_once().await.unwrap();
    h.state.tasks.stop(1).await.unwrap();
    assert_eq!(h.task(1).status, TaskStatus::Stopped);

    let (a, b) = (h.state.tasks.clone(), h.state.tasks.clone());
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.restart(1).await }),
        tokio::spawn(async move { b.restart(1).await }),
    );
    let results = [ra.unwrap(), rb.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(ApiError::Conflict(_)) | Err(ApiError::Validation(_))
    )));

    assert_eq!(h.task(1).status, TaskStatus::InProgress);
    assert!(h.state.supervisor.is_running(&UnitId::Task(1)).await);
    h.state.logs.flush().await;
    assert_eq!(h.db().process_sessions(1).unwrap().len(), 2, "one session per run");

    h.state.supervisor.kill_all().await;
}
