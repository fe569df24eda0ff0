use std::sync::Arc;

use clickup_orchestrator_core::model::UnitId;
use tokio::sync::mpsc;

use crate::agents::AgentLauncher;
use crate::clickup::{ApiKey, ClickUpClient, TaskTracker};
use crate::config::DaemonConfig;
use crate::db::Db;
use crate::gateway::StreamGateway;
use crate::logs::LogStore;
use crate::scheduler::TaskService;
use crate::sessions::RefinementService;
use crate::supervisor::{ExitEvent, OutputSink, ProcessSupervisor};
use crate::worktree::WorktreeManager;

/// Shared handles for the HTTP/WS layer and the background loops.
#[derive(Clone)]
pub struct AppState {
    pub config: DaemonConfig,
    pub db: Db,
    pub logs: LogStore,
    pub gateway: Arc<StreamGateway>,
    pub supervisor: ProcessSupervisor,
    pub worktrees: Arc<WorktreeManager>,
    pub clickup: Arc<ClickUpClient>,
    pub tasks: Arc<TaskService>,
    pub sessions: Arc<RefinementService>,
    /// Outbound client for the page proxy.
    pub http: reqwest::Client,
}

impl AppState {
    /// Builds every component and starts the log writer, the supervisor and
    /// the exit loop. `tracker` replaces the ClickUp client as the scheduler's
    /// task source (tests pass a fake).
    pub fn start(config: DaemonConfig, db: Db, api_key: ApiKey, tracker: Option<Arc<dyn TaskTracker>>) -> Self {
        let logs = LogStore::spawn(db.clone());
        let gateway = Arc::new(StreamGateway::new(config.replay_lines));
        let sink = Arc::new(Fanout {
            gateway: gateway.clone(),
            logs: logs.clone(),
        });
        let (supervisor, exits) = ProcessSupervisor::new(sink, config.kill_grace);
        let worktrees = Arc::new(WorktreeManager::new());
        let clickup = Arc::new(ClickUpClient::new(config.clickup_api_base.clone(), api_key));
        let tracker = tracker.unwrap_or_else(|| clickup.clone() as Arc<dyn TaskTracker>);
        let launcher = match &config.agent_command {
            Some(cmd) => AgentLauncher::Fixed(cmd.clone()),
            None => AgentLauncher::Installed,
        };

        let tasks = Arc::new(TaskService::new(
            db.clone(),
            logs.clone(),
            supervisor.clone(),
            gateway.clone(),
            worktrees.clone(),
            tracker,
            launcher.clone(),
            config.kill_grace,
        ));
        let sessions = Arc::new(RefinementService::new(
            supervisor.clone(),
            gateway.clone(),
            launcher,
            db.clone(),
            config.kill_grace,
            config.session_idle_ttl,
        ));

        tokio::spawn(exit_loop(exits, supervisor.clone(), tasks.clone(), sessions.clone()));

        Self {
            config,
            db,
            logs,
            gateway,
            supervisor,
            worktrees,
            clickup,
            tasks,
            sessions,
            http: reqwest::Client::new(),
        }
    }
}

/// Routes process output to terminal clients and, for tasks, the log store.
struct Fanout {
    gateway: Arc<StreamGateway>,
    logs: LogStore,
}

impl OutputSink for Fanout {
    fn started(&self, id: &UnitId, pid: u32) {
        self.gateway.reset(id);
        if let UnitId::Task(task_id) = *id {
            self.logs.process_started(task_id, pid);
        }
    }

    fn line(&self, id: &UnitId, line: &str, is_stderr: bool) {
        self.gateway.publish(id, line, is_stderr);
        if let UnitId::Task(task_id) = *id {
            self.logs.output(task_id, line, is_stderr);
        }
    }
}

/// Applies exits in the order they happen, then releases the handle.
async fn exit_loop(
    mut exits: mpsc::UnboundedReceiver<ExitEvent>,
    supervisor: ProcessSupervisor,
    tasks: Arc<TaskService>,
    sessions: Arc<RefinementService>,
) {
    while let Some(event) = exits.recv().await {
        tracing::debug!(unit = %event.id, pid = event.pid, exit_code = event.exit_code, killed = event.killed, "exit event");
        match event.id.clone() {
            UnitId::Task(task_id) => {
                tasks.handle_exit(task_id, event.exit_code, event.killed).await;
                event.ack();
            }
            UnitId::Session(session_id) => {
                sessions.finished(&session_id);
                let unit = event.id.clone();
                event.ack();
                let supervisor = supervisor.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    supervisor.wait_exit(&unit).await;
                    sessions.start_next(&session_id).await;
                });
            }
        }
    }
}
