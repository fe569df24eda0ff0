//! Task lifecycle: ingestion from ClickUp, admission under the parallel
//! limit, exit handling and the user-facing actions.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clickup_orchestrator_core::admission::{available_slots, plan_admission};
use clickup_orchestrator_core::api::{TaskResponse, TaskStats};
use clickup_orchestrator_core::model::{task_prompt, NewTask, Settings, Task, TaskStatus, UnitId};
use clickup_orchestrator_core::now_ms;
use clickup_orchestrator_core::validation::{check_transition, status_after_exit, TaskAction};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::agents::AgentLauncher;
use crate::clickup::TaskTracker;
use crate::db::Db;
use crate::error::ApiError;
use crate::gateway::StreamGateway;
use crate::logs::LogStore;
use crate::supervisor::ProcessSupervisor;
use crate::worktree::{task_worktree, WorktreeManager};

/// Extra time a stop request waits beyond the kill grace period.
const STOP_SLACK: Duration = Duration::from_secs(3);

/// What one poll cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub ingested: usize,
    pub admitted: Vec<i64>,
}

pub struct TaskService {
    db: Db,
    logs: LogStore,
    supervisor: ProcessSupervisor,
    gateway: Arc<StreamGateway>,
    worktrees: Arc<WorktreeManager>,
    tracker: Arc<dyn TaskTracker>,
    launcher: AgentLauncher,
    kill_grace: Duration,
    /// Held across count-and-mark so `in_progress` never exceeds the limit.
    admission: Mutex<()>,
    /// Serializes launch against stop, complete and delete of the same task.
    task_locks: parking_lot::Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    wake: Notify,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        logs: LogStore,
        supervisor: ProcessSupervisor,
        gateway: Arc<StreamGateway>,
        worktrees: Arc<WorktreeManager>,
        tracker: Arc<dyn TaskTracker>,
        launcher: AgentLauncher,
        kill_grace: Duration,
    ) -> Self {
        Self {
            db,
            logs,
            supervisor,
            gateway,
            worktrees,
            tracker,
            launcher,
            kill_grace,
            admission: Mutex::new(()),
            task_locks: parking_lot::Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(Settings::from_map(self.db.all_settings()?))
    }

    fn task_lock(&self, id: i64) -> Arc<Mutex<()>> {
        self.task_locks.lock().entry(id).or_default().clone()
    }

    /// Requests an admission pass without waiting for the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// One scheduler cycle. Tracker failures are logged and do not prevent
    /// local admission.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let settings = self.settings()?;
        let ingested = match self.ingest(&settings).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "ClickUp ingestion failed");
                0
            }
        };
        let admitted = self.admit(&settings).await?;
        Ok(PollReport { ingested, admitted })
    }

    async fn ingest(&self, settings: &Settings) -> Result<usize> {
        let Some(list_id) = settings.list_id() else {
            return Ok(0);
        };
        if !self.tracker.is_configured() {
            return Ok(0);
        }
        let items = self
            .tracker
            .tasks_in_status(list_id, settings.trigger_status())
            .await?;

        let mut created = 0;
        for item in items {
            if self.db.task_exists_for_clickup_id(&item.id)? {
                continue;
            }
            let new = NewTask {
                clickup_task_id: item.id,
                clickup_list_id: item.list_id.or_else(|| Some(list_id.to_string())),
                name: item.name,
                description: item.description,
                priority: item.priority,
            };
            if let Some(task) = self.db.insert_task(&new)? {
                tracing::info!(task_id = task.id, clickup_task_id = %task.clickup_task_id, "task created from ClickUp");
                self.logs.system(task.id, "Task created from ClickUp");
                created += 1;
            }
        }
        Ok(created)
    }

    async fn admit(&self, settings: &Settings) -> Result<Vec<i64>> {
        if settings.target_repo_path().is_none() {
            return Ok(Vec::new());
        }
        let planned = {
            let _guard = self.admission.lock().await;
            let in_progress = self.db.count_in_status(TaskStatus::InProgress)?;
            let slots = available_slots(settings.parallel_limit(), in_progress);
            if slots == 0 {
                return Ok(Vec::new());
            }
            let now = now_ms();
            let mut plan = plan_admission(self.db.queued_tasks()?, slots);
            plan.retain(|task| match self.db.mark_started(task.id, TaskStatus::Queued, now) {
                Ok(true) => {
                    self.logs
                        .status_change(task.id, TaskStatus::Queued, TaskStatus::InProgress, None);
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    tracing::error!(task_id = task.id, error = %e, "failed to admit task");
                    false
                }
            });
            plan
        };

        let mut admitted = Vec::with_capacity(planned.len());
        for task in planned {
            tracing::info!(task_id = task.id, priority = task.priority_rank(), "admitting task");
            self.move_tracker_status(&task, settings).await;
            admitted.push(task.id);
            self.launch(task, settings).await;
        }
        Ok(admitted)
    }

    async fn move_tracker_status(&self, task: &Task, settings: &Settings) {
        if !self.tracker.is_configured() {
            return;
        }
        let target = settings.target_status();
        match self.tracker.set_status(&task.clickup_task_id, target).await {
            Ok(()) => self.logs.clickup(
                task.id,
                format!("ClickUp status updated: {} -> {target}", settings.trigger_status()),
            ),
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, "failed to update ClickUp status");
                self.logs
                    .system(task.id, format!("Failed to update ClickUp status: {e}"));
            }
        }
    }

    /// Prepares the worktree and spawns the agent for a task already marked
    /// `in_progress`. Any failure marks the task `failed`. A task stopped or
    /// completed before the launch got its turn is left alone.
    async fn launch(&self, task: Task, settings: &Settings) {
        let lock = self.task_lock(task.id);
        let _guard = lock.lock().await;
        match self.db.get_task(task.id) {
            Ok(Some(current)) if current.status == TaskStatus::InProgress => {}
            Ok(_) => {
                tracing::info!(task_id = task.id, "task left in_progress before launch; skipping");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "failed to reload task before launch");
                return;
            }
        }
        if let Err(message) = self.try_launch(&task, settings).await {
            tracing::warn!(task_id = task.id, error = %message, "task launch failed");
            self.logs.system(task.id, message.clone());
            let now = now_ms();
            match self
                .db
                .finish_run(task.id, TaskStatus::InProgress, TaskStatus::Failed, 0, now)
            {
                Ok(true) => self.logs.status_change(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Failed,
                    Some(&message),
                ),
                Ok(false) => {}
                Err(e) => tracing::error!(task_id = task.id, error = %e, "failed to mark task failed"),
            }
            self.wake();
        }
    }

    async fn try_launch(&self, task: &Task, settings: &Settings) -> std::result::Result<(), String> {
        let repo = settings
            .target_repo_path()
            .map(PathBuf::from)
            .ok_or_else(|| "Target repository path is not configured".to_string())?;

        let (path, branch) = match (&task.worktree_path, &task.branch_name) {
            (Some(path), Some(branch)) => (PathBuf::from(path), branch.clone()),
            _ => task_worktree(&repo, task),
        };
        self.worktrees
            .create_worktree(&repo, &path, &branch, settings.dev_branch())
            .await
            .map_err(|e| format!("Failed to create worktree: {e}"))?;
        let path_str = path.to_string_lossy();
        self.db
            .set_worktree(task.id, &path_str, &branch)
            .map_err(|e| format!("Failed to record worktree: {e}"))?;
        self.logs
            .system(task.id, format!("Worktree ready at {path_str} (branch {branch})"));

        let prompt = task_prompt(task, settings.agent_prompt());
        let cmd = self
            .launcher
            .command(settings.agent(), &prompt)
            .map_err(|e| e.to_string())?;
        let pid = self
            .supervisor
            .spawn(UnitId::Task(task.id), cmd, &path)
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(task_id = task.id, pid, agent = %settings.agent(), "agent started");
        Ok(())
    }

    /// Applies a process exit to the task. Only a task still `in_progress`
    /// changes status; a manual completion that killed the process wins.
    pub async fn handle_exit(&self, task_id: i64, exit_code: i32, killed: bool) {
        if let Err(e) = self.apply_exit(task_id, exit_code, killed).await {
            tracing::error!(task_id, exit_code, error = %e, "failed to record process exit");
        }
        self.wake();
    }

    async fn apply_exit(&self, task_id: i64, exit_code: i32, killed: bool) -> Result<()> {
        // The session row is opened by the log writer; let it land first.
        self.logs.flush().await;
        let now = now_ms();
        self.db
            .close_process_sessions(task_id, Some(exit_code), now)?;
        let Some(task) = self.db.get_task(task_id)? else {
            return Ok(());
        };
        if task.status != TaskStatus::InProgress {
            return Ok(());
        }
        let next = status_after_exit(exit_code, killed);
        let elapsed = task.elapsed_since_start(now);
        if self
            .db
            .finish_run(task_id, TaskStatus::InProgress, next, elapsed, now)?
        {
            self.logs.status_change(
                task_id,
                TaskStatus::InProgress,
                next,
                Some(&format!("exit code {exit_code}")),
            );
            tracing::info!(task_id, exit_code, status = %next, "task finished");
            if next == TaskStatus::Completed {
                self.report_time(&task, now);
            }
        }
        Ok(())
    }

    /// Posts the run's time to ClickUp in the background.
    fn report_time(&self, task: &Task, end_ms: i64) {
        let Some(start_ms) = task.started_at_ms else {
            return;
        };
        if !self.tracker.is_configured() || end_ms <= start_ms {
            return;
        }
        let tracker = self.tracker.clone();
        let logs = self.logs.clone();
        let task_id = task.id;
        let clickup_id = task.clickup_task_id.clone();
        tokio::spawn(async move {
            match tracker.add_time_entry(&clickup_id, start_ms, end_ms).await {
                Ok(()) => logs.clickup(
                    task_id,
                    format!("Logged {} to ClickUp", format_duration(end_ms - start_ms)),
                ),
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "failed to log time to ClickUp");
                    logs.system(task_id, format!("Failed to log time to ClickUp: {e}"));
                }
            }
        });
    }

    async fn running_tasks(&self) -> HashSet<i64> {
        self.supervisor
            .running()
            .await
            .iter()
            .filter_map(UnitId::task_id)
            .collect()
    }

    fn load(&self, id: i64) -> Result<Task, ApiError> {
        self.db
            .get_task(id)?
            .ok_or_else(|| ApiError::not_found("Task not found"))
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskResponse>, ApiError> {
        let running = self.running_tasks().await;
        Ok(self
            .db
            .list_tasks(status)?
            .into_iter()
            .map(|t| {
                let is_running = running.contains(&t.id);
                TaskResponse::from_task(t, is_running)
            })
            .collect())
    }

    pub async fn get(&self, id: i64) -> Result<TaskResponse, ApiError> {
        let task = self.load(id)?;
        let is_running = self.supervisor.is_running(&UnitId::Task(id)).await;
        Ok(TaskResponse::from_task(task, is_running))
    }

    pub async fn stats(&self) -> Result<TaskStats, ApiError> {
        let counts = self.db.count_by_status()?;
        let count = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
        Ok(TaskStats {
            queued: count(TaskStatus::Queued),
            in_progress: count(TaskStatus::InProgress),
            stopped: count(TaskStatus::Stopped),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            running_processes: self.running_tasks().await.len() as u64,
        })
    }

    pub fn exists(&self, id: i64) -> Result<bool, ApiError> {
        Ok(self.db.get_task(id)?.is_some())
    }

    /// Kills the agent and waits for the exit to be recorded.
    pub async fn stop(&self, id: i64) -> Result<TaskResponse, ApiError> {
        let lock = self.task_lock(id);
        let guard = lock.lock().await;
        let task = self.load(id)?;
        check_transition(task.status, TaskAction::Stop)?;
        let unit = UnitId::Task(id);

        if self.supervisor.kill(&unit).await? {
            self.logs.system(id, "Stop requested");
            if timeout(self.kill_grace + STOP_SLACK, self.supervisor.wait_exit(&unit))
                .await
                .is_err()
            {
                tracing::warn!(task_id = id, "process still alive after stop deadline");
            }
        } else {
            let now = now_ms();
            if self.db.finish_run(
                id,
                TaskStatus::InProgress,
                TaskStatus::Stopped,
                task.elapsed_since_start(now),
                now,
            )? {
                self.logs.status_change(
                    id,
                    TaskStatus::InProgress,
                    TaskStatus::Stopped,
                    Some("no running process"),
                );
            }
            self.wake();
        }
        drop(guard);
        self.get(id).await
    }

    /// Re-runs a stopped or failed task now, or queues it if no slot is free.
    pub async fn restart(&self, id: i64) -> Result<TaskResponse, ApiError> {
        let task = self.load(id)?;
        check_transition(task.status, TaskAction::Restart)?;
        let settings = self.settings()?;

        let admitted = {
            let _guard = self.admission.lock().await;
            let in_progress = self.db.count_in_status(TaskStatus::InProgress)?;
            let now = now_ms();
            if settings.target_repo_path().is_some()
                && available_slots(settings.parallel_limit(), in_progress) > 0
            {
                if !self.db.mark_started(id, task.status, now)? {
                    return Err(ApiError::Conflict("Task status changed; try again".to_string()));
                }
                self.logs
                    .status_change(id, task.status, TaskStatus::InProgress, Some("restart"));
                true
            } else {
                if !self.db.set_status(id, task.status, TaskStatus::Queued, now)? {
                    return Err(ApiError::Conflict("Task status changed; try again".to_string()));
                }
                self.logs.status_change(
                    id,
                    task.status,
                    TaskStatus::Queued,
                    Some("restart requested; waiting for a free slot"),
                );
                false
            }
        };

        if admitted {
            self.launch(task, &settings).await;
        }
        self.get(id).await
    }

    /// Marks the task done by hand, killing any live agent.
    pub async fn complete(&self, id: i64) -> Result<TaskResponse, ApiError> {
        let lock = self.task_lock(id);
        let guard = lock.lock().await;
        let task = self.load(id)?;
        check_transition(task.status, TaskAction::Complete)?;
        let now = now_ms();
        let elapsed = if task.status == TaskStatus::InProgress {
            task.elapsed_since_start(now)
        } else {
            0
        };
        if !self
            .db
            .finish_run(id, task.status, TaskStatus::Completed, elapsed, now)?
        {
            return Err(ApiError::Conflict("Task status changed; try again".to_string()));
        }
        self.logs.status_change(
            id,
            task.status,
            TaskStatus::Completed,
            Some("marked complete manually"),
        );
        if self.supervisor.kill(&UnitId::Task(id)).await? {
            self.logs.system(id, "Stopping agent process");
        }
        if elapsed > 0 {
            self.report_time(&task, now);
        }
        drop(guard);
        self.wake();
        self.get(id).await
    }

    /// Removes a finished task, its worktree and its logs.
    pub async fn delete(&self, id: i64) -> Result<(), ApiError> {
        let lock = self.task_lock(id);
        let _guard = lock.lock().await;
        let task = self.load(id)?;
        check_transition(task.status, TaskAction::Delete)?;
        let unit = UnitId::Task(id);

        if self.supervisor.kill(&unit).await? {
            let _ = timeout(self.kill_grace + STOP_SLACK, self.supervisor.wait_exit(&unit)).await;
            if self.supervisor.is_running(&unit).await {
                return Err(ApiError::Conflict(format!(
                    "{} still has a running process",
                    unit.describe()
                )));
            }
        }

        if let Some(path) = task.worktree_path.as_deref() {
            self.remove_worktree(Path::new(path)).await?;
        }
        self.db.delete_task(id)?;
        self.gateway.remove(&unit);
        self.task_locks.lock().remove(&id);
        tracing::info!(task_id = id, "task deleted");
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), ApiError> {
        let repo = self.settings()?.target_repo_path().map(PathBuf::from);
        match repo {
            Some(repo) if repo.is_dir() => self.worktrees.remove_worktree(&repo, path).await?,
            _ => match tokio::fs::remove_dir_all(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ApiError::internal(format!("Failed to remove worktree: {e}"))),
            },
        }
        Ok(())
    }
}

/// Runs [`TaskService::poll_once`] every `interval` and whenever woken.
pub fn spawn_scheduler(service: Arc<TaskService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = service.wake.notified() => {}
            }
            match service.poll_once().await {
                Ok(report) if report.ingested > 0 || !report.admitted.is_empty() => {
                    tracing::info!(ingested = report.ingested, admitted = ?report.admitted, "scheduler cycle");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "scheduler cycle failed"),
            }
        }
    })
}

fn format_duration(ms: i64) -> String {
    let secs = ms / 1000;
    match (secs / 3600, (secs % 3600) / 60) {
        (0, 0) => format!("{secs}s"),
        (0, m) => format!("{m}m"),
        (h, m) => format!("{h}h {m}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::format_duration;

    #[test]
    fn durations_read_naturally() {
        assert_eq!(format_duration(42_000), "42s");
        assert_eq!(format_duration(5 * 60_000 + 10_000), "5m");
        assert_eq!(format_duration(2 * 3_600_000 + 7 * 60_000), "2h 7m");
    }
}
