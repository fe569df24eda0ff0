use anyhow::Result;
use clickup_orchestrator_core::model::{status_change_message, LogEventType, LogRead, TaskStatus};
use clickup_orchestrator_core::now_ms;
use tokio::sync::{mpsc, oneshot};

use crate::db::Db;

enum LogCommand {
    Append {
        task_id: i64,
        event_type: LogEventType,
        message: String,
        is_stderr: Option<bool>,
    },
    /// Opens the process session row and logs the spawn.
    ProcessStarted { task_id: i64, pid: u32 },
    Flush(oneshot::Sender<()>),
}

/// Append-only per-task event log.
///
/// Appends are fire-and-forget and go through one writer task, so entries
/// land in exactly the order they were submitted and timestamps never go
/// backwards even if the wall clock does.
#[derive(Clone)]
pub struct LogStore {
    db: Db,
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl LogStore {
    /// Starts the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(db: Db) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(db.clone(), rx));
        Self { db, tx }
    }

    pub fn append(
        &self,
        task_id: i64,
        event_type: LogEventType,
        message: impl Into<String>,
        is_stderr: Option<bool>,
    ) {
        let cmd = LogCommand::Append {
            task_id,
            event_type,
            message: message.into(),
            is_stderr,
        };
        if self.tx.send(cmd).is_err() {
            tracing::warn!(task_id, "log writer stopped; dropping entry");
        }
    }

    pub fn system(&self, task_id: i64, message: impl Into<String>) {
        self.append(task_id, LogEventType::System, message, None);
    }

    pub fn clickup(&self, task_id: i64, message: impl Into<String>) {
        self.append(task_id, LogEventType::Clickup, message, None);
    }

    pub fn output(&self, task_id: i64, line: impl Into<String>, is_stderr: bool) {
        self.append(task_id, LogEventType::Output, line, Some(is_stderr));
    }

    pub fn status_change(&self, task_id: i64, from: TaskStatus, to: TaskStatus, note: Option<&str>) {
        self.append(
            task_id,
            LogEventType::Status,
            status_change_message(from, to, note),
            None,
        );
    }

    /// Records a spawned agent process. Runs on the writer task, so callers on
    /// the supervisor never touch the database.
    pub fn process_started(&self, task_id: i64, pid: u32) {
        if self.tx.send(LogCommand::ProcessStarted { task_id, pid }).is_err() {
            tracing::warn!(task_id, pid, "log writer stopped; process session not recorded");
        }
    }

    /// Resolves once everything appended before this call is persisted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Ordered entries for `task_id`, or the legacy blob for older tasks.
    pub async fn read(&self, task_id: i64) -> Result<LogRead> {
        self.flush().await;
        let entries = self.db.list_logs(task_id)?;
        let legacy = if entries.is_empty() {
            self.db.legacy_output(task_id)?
        } else {
            None
        };
        Ok(LogRead::resolve(entries, legacy))
    }
}

async fn writer_loop(db: Db, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
    let mut last_ts = 0i64;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCommand::Append {
                task_id,
                event_type,
                message,
                is_stderr,
            } => {
                let ts = now_ms().max(last_ts);
                last_ts = ts;
                if let Err(e) = db.insert_log(task_id, event_type, &message, is_stderr, ts) {
                    tracing::warn!(task_id, error = %e, "failed to persist task log entry");
                }
            }
            LogCommand::ProcessStarted { task_id, pid } => {
                let ts = now_ms().max(last_ts);
                last_ts = ts;
                if let Err(e) = db.open_process_session(task_id, pid, ts) {
                    tracing::warn!(task_id, pid, error = %e, "failed to record process session");
                }
                let message = format!("Agent spawned (PID: {pid})");
                if let Err(e) = db.insert_log(task_id, LogEventType::System, &message, None, ts) {
                    tracing::warn!(task_id, error = %e, "failed to persist task log entry");
                }
            }
            LogCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clickup_orchestrator_core::model::NewTask;

    #[tokio::test]
    async fn preserves_submission_order() {
        let db = Db::open_in_memory().unwrap();
        let task = db
            .insert_task(&NewTask {
                clickup_task_id: "x".into(),
                clickup_list_id: None,
                name: "x".into(),
                description: None,
                priority: None,
            })
            .unwrap()
            .unwrap();
        let logs = LogStore::spawn(db.clone());

        logs.status_change(task.id, TaskStatus::Queued, TaskStatus::InProgress, None);
        for i in 0..50 {
            logs.output(task.id, format!("line {i}"), i % 3 == 0);
        }

        let LogRead::Structured(entries) = logs.read(task.id).await.unwrap() else {
            panic!("expected structured log");
        };
        assert_eq!(entries.len(), 51);
        assert_eq!(entries[0].message, "Status changed: queued -> in_progress");
        assert_eq!(entries[0].is_stderr, None);
        for (i, e) in entries[1..].iter().enumerate() {
            assert_eq!(e.message, format!("line {i}"));
            assert_eq!(e.is_stderr, Some(i % 3 == 0));
        }
        assert!(entries.windows(2).all(|w| w[0].created_at_ms <= w[1].created_at_ms));
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn process_start_is_recorded_in_order() {
        let db = Db::open_in_memory().unwrap();
        let task = db
            .insert_task(&NewTask {
                clickup_task_id: "p".into(),
                clickup_list_id: None,
                name: "p".into(),
                description: None,
                priority: None,
            })
            .unwrap()
            .unwrap();
        let logs = LogStore::spawn(db.clone());

        logs.process_started(task.id, 4242);
        logs.output(task.id, "hello", false);
        logs.flush().await;

        assert_eq!(db.process_sessions(task.id).unwrap(), vec![(4242, None)]);
        let LogRead::Structured(entries) = logs.read(task.id).await.unwrap() else {
            panic!("expected structured log");
        };
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["Agent spawned (PID: 4242)", "hello"]);
    }

    #[tokio::test]
    async fn legacy_blob_when_no_entries() {
        let db = Db::open_in_memory().unwrap();
        let task = db
            .insert_task(&NewTask {
                clickup_task_id: "old".into(),
                clickup_list_id: None,
                name: "old".into(),
                description: None,
                priority: None,
            })
            .unwrap()
            .unwrap();
        db.set_legacy_output(task.id, "captured output").unwrap();
        let logs = LogStore::spawn(db);
        assert_eq!(
            logs.read(task.id).await.unwrap(),
            LogRead::Legacy("captured output".into())
        );
    }
}
