use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clickup_orchestrator_core::model::{
    settings, LogEntry, LogEventType, NewTask, Task, TaskStatus,
};
use clickup_orchestrator_core::now_ms;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Embedded SQLite store for tasks, logs, process sessions and settings.
///
/// Statements are short; callers hold the lock only for one statement or one
/// transaction.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

const TASK_COLUMNS: &str = "id, clickup_task_id, clickup_list_id, name, description, priority, \
     status, worktree_path, branch_name, time_spent_ms, started_at_ms, completed_at_ms, \
     created_at_ms, updated_at_ms";

impl Db {
    /// Opens (creating if needed) the database at `path` and bootstraps the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create db dir {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite db {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(include_str!("../migrations/0001_init.sql"))
            .context("apply schema")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.seed_settings()?;
        db.check_integrity()?;
        Ok(db)
    }

    fn seed_settings(&self) -> Result<()> {
        let conn = self.conn.lock();
        let now = now_ms();
        for (key, value) in settings::DEFAULTS {
            conn.execute(
                "INSERT OR IGNORE INTO settings(key, value, updated_at_ms) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )?;
        }
        Ok(())
    }

    /// Rejects databases holding statuses this build cannot interpret.
    fn check_integrity(&self) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT status FROM tasks")?;
        let statuses = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for s in statuses {
            s.parse::<TaskStatus>()
                .with_context(|| "tasks table holds an unknown status")?;
        }
        Ok(())
    }

    // ---- settings ----

    pub fn all_settings(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    /// Upserts every pair in one transaction.
    pub fn put_settings(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_ms();
        for (key, value) in values {
            tx.execute(
                "INSERT INTO settings(key, value, updated_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- tasks ----

    fn row_to_task(r: &Row<'_>) -> rusqlite::Result<Task> {
        let status: String = r.get(6)?;
        let status = status
            .parse::<TaskStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
        Ok(Task {
            id: r.get(0)?,
            clickup_task_id: r.get(1)?,
            clickup_list_id: r.get(2)?,
            name: r.get(3)?,
            description: r.get(4)?,
            priority: r.get(5)?,
            status,
            worktree_path: r.get(7)?,
            branch_name: r.get(8)?,
            time_spent_ms: r.get(9)?,
            started_at_ms: r.get(10)?,
            completed_at_ms: r.get(11)?,
            created_at_ms: r.get(12)?,
            updated_at_ms: r.get(13)?,
        })
    }

    /// Inserts a queued task; returns `None` when the tracker id is already known.
    pub fn insert_task(&self, new: &NewTask) -> Result<Option<Task>> {
        let id = {
            let conn = self.conn.lock();
            let now = now_ms();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO tasks(clickup_task_id, clickup_list_id, name, description, priority,
                                             status, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    new.clickup_task_id,
                    new.clickup_list_id,
                    new.name,
                    new.description,
                    new.priority,
                    TaskStatus::Queued.as_str(),
                    now
                ],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            conn.last_insert_rowid()
        };
        self.get_task(id)
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        Ok(conn.query_row(&sql, [id], Self::row_to_task).optional()?)
    }

    pub fn task_exists_for_clickup_id(&self, clickup_task_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM tasks WHERE clickup_task_id = ?1",
                [clickup_task_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Newest first, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at_ms DESC, id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                for t in stmt.query_map([s.as_str()], Self::row_to_task)? {
                    out.push(t?);
                }
            }
            None => {
                let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at_ms DESC, id DESC");
                let mut stmt = conn.prepare(&sql)?;
                for t in stmt.query_map([], Self::row_to_task)? {
                    out.push(t?);
                }
            }
        }
        Ok(out)
    }

    /// Queued tasks in arrival order.
    pub fn queued_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'queued' ORDER BY id ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (status, n) = row?;
            if let Ok(status) = status.parse::<TaskStatus>() {
                out.insert(status, n.max(0) as u64);
            }
        }
        Ok(out)
    }

    pub fn count_in_status(&self, status: TaskStatus) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            [status.as_str()],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    /// `from → in_progress`; clears `completed_at`. Returns whether the task
    /// was still in `from`.
    pub fn mark_started(&self, id: i64, from: TaskStatus, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'in_progress', started_at_ms = ?3, completed_at_ms = NULL, updated_at_ms = ?3
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), now],
        )?;
        Ok(changed > 0)
    }

    /// `from → status` without touching timing; returns whether the row changed.
    pub fn set_status(&self, id: i64, from: TaskStatus, status: TaskStatus, now: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?3, updated_at_ms = ?4 WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), status.as_str(), now],
        )?;
        Ok(changed > 0)
    }

    /// Ends a run: sets the final status, accumulates running time and, for
    /// `completed`, stamps `completed_at`. Only applies while the task is still in
    /// `expected`; returns whether the row changed.
    pub fn finish_run(
        &self,
        id: i64,
        expected: TaskStatus,
        status: TaskStatus,
        elapsed_ms: i64,
        now: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let completed_at = (status == TaskStatus::Completed).then_some(now);
        let changed = conn.execute(
            "UPDATE tasks SET status = ?3, time_spent_ms = time_spent_ms + ?4,
                              completed_at_ms = COALESCE(?5, completed_at_ms), updated_at_ms = ?6
             WHERE id = ?1 AND status = ?2",
            params![id, expected.as_str(), status.as_str(), elapsed_ms.max(0), completed_at, now],
        )?;
        Ok(changed > 0)
    }

    pub fn set_worktree(&self, id: i64, path: &str, branch: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET worktree_path = ?2, branch_name = ?3, updated_at_ms = ?4 WHERE id = ?1",
            params![id, path, branch, now_ms()],
        )?;
        Ok(())
    }

    /// Removes the task with its logs and process sessions.
    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", [id])? > 0)
    }

    /// Output captured by older builds that stored one blob per task.
    pub fn legacy_output(&self, task_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let blob: Option<Option<String>> = conn
            .query_row("SELECT output_log FROM tasks WHERE id = ?1", [task_id], |r| r.get(0))
            .optional()?;
        Ok(blob.flatten())
    }

    // ---- logs ----

    pub fn insert_log(
        &self,
        task_id: i64,
        event_type: LogEventType,
        message: &str,
        is_stderr: Option<bool>,
        created_at_ms: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO task_logs(task_id, event_type, message, is_stderr, created_at_ms)
             SELECT ?1, ?2, ?3, ?4, ?5 WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?1)",
            params![task_id, event_type.as_str(), message, is_stderr, created_at_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_logs(&self, task_id: i64) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, event_type, message, is_stderr, created_at_ms
             FROM task_logs WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([task_id], |r| {
            let kind: String = r.get(2)?;
            let event_type = kind
                .parse::<LogEventType>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
            Ok(LogEntry {
                id: r.get(0)?,
                task_id: r.get(1)?,
                event_type,
                message: r.get(3)?,
                is_stderr: r.get(4)?,
                created_at_ms: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- process sessions ----

    pub fn open_process_session(&self, task_id: i64, pid: u32, now: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO process_sessions(task_id, pid, started_at_ms) VALUES (?1, ?2, ?3)",
            params![task_id, pid, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Closes every open session of the task.
    pub fn close_process_sessions(&self, task_id: i64, exit_code: Option<i32>, now: i64) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "UPDATE process_sessions SET ended_at_ms = ?2, exit_code = ?3
             WHERE task_id = ?1 AND ended_at_ms IS NULL",
            params![task_id, now, exit_code],
        )?)
    }

    /// `(pid, exit_code)` of the task's process sessions, oldest first.
    pub fn process_sessions(&self, task_id: i64) -> Result<Vec<(u32, Option<i32>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT pid, exit_code FROM process_sessions WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([task_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Marks tasks left `in_progress` by a previous daemon instance as `stopped`;
    /// their processes died with it. The interrupted run's time up to `now`
    /// is kept.
    pub fn recover_orphans(&self, now: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM tasks WHERE status = 'in_progress'")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        conn.execute(
            "UPDATE tasks SET status = 'stopped',
                              time_spent_ms = time_spent_ms + MAX(0, ?1 - COALESCE(started_at_ms, ?1)),
                              updated_at_ms = ?1
             WHERE status = 'in_progress'",
            [now],
        )?;
        conn.execute(
            "UPDATE process_sessions SET ended_at_ms = ?1 WHERE ended_at_ms IS NULL",
            [now],
        )?;
        Ok(ids)
    }

    #[cfg(test)]
    pub(crate) fn set_legacy_output(&self, task_id: i64, blob: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE tasks SET output_log = ?2 WHERE id = ?1", params![task_id, blob])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(cu: &str, priority: Option<i32>) -> NewTask {
        NewTask {
            clickup_task_id: cu.into(),
            clickup_list_id: Some("list".into()),
            name: format!("Task {cu}"),
            description: None,
            priority,
        }
    }

    #[test]
    fn dedupes_by_clickup_id() {
        let db = Db::open_in_memory().unwrap();
        let first = db.insert_task(&new_task("a", Some(1))).unwrap();
        assert!(first.is_some());
        assert!(db.insert_task(&new_task("a", Some(2))).unwrap().is_none());
        assert!(db.task_exists_for_clickup_id("a").unwrap());
        assert_eq!(db.list_tasks(None).unwrap().len(), 1);
    }

    #[test]
    fn seeds_defaults_without_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("o.db");
        {
            let db = Db::open(&path).unwrap();
            assert_eq!(db.get_setting("parallel_limit").unwrap().as_deref(), Some("1"));
            let mut m = BTreeMap::new();
            m.insert("parallel_limit".to_string(), "4".to_string());
            db.put_settings(&m).unwrap();
        }
        let db = Db::open(&path).unwrap();
        assert_eq!(db.get_setting("parallel_limit").unwrap().as_deref(), Some("4"));
        assert_eq!(db.get_setting("dev_branch").unwrap().as_deref(), Some("dev"));
    }

    #[test]
    fn finish_run_only_from_expected_status() {
        let db = Db::open_in_memory().unwrap();
        let t = db.insert_task(&new_task("a", None)).unwrap().unwrap();
        assert!(db.mark_started(t.id, TaskStatus::Queued, 1_000).unwrap());
        assert!(db
            .finish_run(t.id, TaskStatus::InProgress, TaskStatus::Completed, 500, 1_500)
            .unwrap());
        assert!(!db
            .finish_run(t.id, TaskStatus::InProgress, TaskStatus::Failed, 500, 2_000)
            .unwrap());
        let t = db.get_task(t.id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.time_spent_ms, 500);
        assert_eq!(t.completed_at_ms, Some(1_500));
    }

    #[test]
    fn delete_cascades_logs() {
        let db = Db::open_in_memory().unwrap();
        let t = db.insert_task(&new_task("a", None)).unwrap().unwrap();
        db.insert_log(t.id, LogEventType::System, "hi", None, 1).unwrap();
        db.open_process_session(t.id, 42, 1).unwrap();
        assert!(db.delete_task(t.id).unwrap());
        assert!(db.list_logs(t.id).unwrap().is_empty());
        assert!(db.process_sessions(t.id).unwrap().is_empty());
    }

    #[test]
    fn legacy_blob_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let t = db.insert_task(&new_task("a", None)).unwrap().unwrap();
        assert_eq!(db.legacy_output(t.id).unwrap(), None);
        db.set_legacy_output(t.id, "line1\nline2").unwrap();
        assert_eq!(db.legacy_output(t.id).unwrap().as_deref(), Some("line1\nline2"));
    }

    #[test]
    fn orphaned_runs_are_stopped_on_recovery() {
        let db = Db::open_in_memory().unwrap();
        let t = db.insert_task(&new_task("a", None)).unwrap().unwrap();
        assert!(db.mark_started(t.id, TaskStatus::Queued, 10).unwrap());
        db.open_process_session(t.id, 7, 10).unwrap();
        assert_eq!(db.recover_orphans(250).unwrap(), vec![t.id]);
        let t = db.get_task(t.id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Stopped);
        assert_eq!(t.time_spent_ms, 240);
        assert_eq!(db.process_sessions(t.id).unwrap(), vec![(7, None)]);
    }

    #[test]
    fn transitions_apply_only_from_the_expected_status() {
        let db = Db::open_in_memory().unwrap();
        let t = db.insert_task(&new_task("a", None)).unwrap().unwrap();
        assert!(db.mark_started(t.id, TaskStatus::Queued, 10).unwrap());
        assert!(!db.mark_started(t.id, TaskStatus::Queued, 20).unwrap());
        assert_eq!(db.get_task(t.id).unwrap().unwrap().started_at_ms, Some(10));

        assert!(!db
            .set_status(t.id, TaskStatus::Stopped, TaskStatus::Queued, 30)
            .unwrap());
        assert!(db
            .finish_run(t.id, TaskStatus::InProgress, TaskStatus::Stopped, 5, 30)
            .unwrap());
        assert!(db
            .set_status(t.id, TaskStatus::Stopped, TaskStatus::Queued, 40)
            .unwrap());
        assert_eq!(db.get_task(t.id).unwrap().unwrap().status, TaskStatus::Queued);
    }
}
