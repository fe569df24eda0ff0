#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clickup_orchestrator_core::model::{settings, CommandSpec, Task, TaskStatus};
use clickup_orchestrator_daemon::clickup::{self, ApiKey, ClickUpError, TaskTracker, TrackerTask};
use clickup_orchestrator_daemon::config::DaemonConfig;
use clickup_orchestrator_daemon::db::Db;
use clickup_orchestrator_daemon::state::AppState;
use parking_lot::Mutex;
use tempfile::TempDir;

/// In-memory stand-in for ClickUp.
#[derive(Default)]
pub struct FakeTracker {
    pub items: Mutex<Vec<TrackerTask>>,
    pub status_updates: Mutex<Vec<(String, String)>>,
    pub time_entries: Mutex<Vec<String>>,
    pub fail_listing: Mutex<bool>,
}

impl FakeTracker {
    pub fn push(&self, id: &str, name: &str, priority: Option<i32>) {
        self.items.lock().push(TrackerTask {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            priority,
            list_id: Some("L1".to_string()),
        });
    }
}

#[async_trait]
impl TaskTracker for FakeTracker {
    fn is_configured(&self) -> bool {
        true
    }

    async fn tasks_in_status(&self, _list_id: &str, _status: &str) -> clickup::Result<Vec<TrackerTask>> {
        if *self.fail_listing.lock() {
            return Err(ClickUpError::Api("500 Internal Server Error: boom".to_string()));
        }
        Ok(self.items.lock().clone())
    }

    async fn set_status(&self, task_id: &str, status: &str) -> clickup::Result<()> {
        self.status_updates
            .lock()
            .push((task_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn add_time_entry(&self, task_id: &str, _start_ms: i64, _end_ms: i64) -> clickup::Result<()> {
        self.time_entries.lock().push(task_id.to_string());
        Ok(())
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A repository with one commit on `dev`.
pub fn git_repo() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    git(dir.path(), &["init", "-q"]);
    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/dev"]);
    std::fs::write(dir.path().join("README.md"), "hello\n").expect("write readme");
    git(dir.path(), &["add", "README.md"]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);
    dir
}

/// Agent stand-in: a shell script; the prompt is in `$ORCHESTRATOR_PROMPT`.
pub fn sh_agent(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

pub struct Harness {
    pub state: AppState,
    pub tracker: Arc<FakeTracker>,
    pub repo: TempDir,
    _data: TempDir,
}

impl Harness {
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    pub fn db(&self) -> &Db {
        &self.state.db
    }

    pub fn set(&self, key: &str, value: &str) {
        let mut values = BTreeMap::new();
        values.insert(key.to_string(), value.to_string());
        self.db().put_settings(&values).expect("put settings");
    }

    pub fn task(&self, id: i64) -> Task {
        self.db().get_task(id).expect("get task").expect("task exists")
    }

    pub fn task_by_clickup(&self, clickup_id: &str) -> Task {
        self.db()
            .list_tasks(None)
            .expect("list")
            .into_iter()
            .find(|t| t.clickup_task_id == clickup_id)
            .expect("task ingested")
    }

    /// Polls until `id` reaches `status` or the deadline passes.
    pub async fn wait_status(&self, id: i64, status: TaskStatus) -> Task {
        for _ in 0..200 {
            let task = self.task(id);
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} never reached {status}; now {}", self.task(id).status);
    }
}

/// Full daemon wiring on a temp database and repository.
pub fn harness(agent: CommandSpec) -> Harness {
    harness_with(agent, |_| {})
}

/// [`harness`] with config overrides.
pub fn harness_with(agent: CommandSpec, tweak: impl FnOnce(&mut DaemonConfig)) -> Harness {
    let data = tempfile::tempdir().expect("tempdir");
    let repo = git_repo();
    let mut config = DaemonConfig {
        db_path: data.path().join("orchestrator.db"),
        kill_grace: Duration::from_millis(500),
        env_file: data.path().join(".env"),
        agent_command: Some(agent),
        ..DaemonConfig::default()
    };
    tweak(&mut config);
    let db = Db::open(&config.db_path).expect("open db");
    let tracker = Arc::new(FakeTracker::default());
    let state = AppState::start(
        config,
        db,
        ApiKey::new(None),
        Some(tracker.clone() as Arc<dyn TaskTracker>),
    );

    let mut values = BTreeMap::new();
    values.insert(settings::CLICKUP_LIST_ID.to_string(), "L1".to_string());
    values.insert(
        settings::TARGET_REPO_PATH.to_string(),
        repo.path().to_string_lossy().into_owned(),
    );
    values.insert(settings::PARALLEL_LIMIT.to_string(), "1".to_string());
    state.db.put_settings(&values).expect("seed settings");

    Harness {
        state,
        tracker,
        repo,
        _data: data,
    }
}
