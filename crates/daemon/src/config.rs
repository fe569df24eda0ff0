use std::path::PathBuf;
use std::time::Duration;

use clickup_orchestrator_core::model::CommandSpec;

/// Public ClickUp REST endpoint.
pub const CLICKUP_API_BASE: &str = "https://api.clickup.com/api/v2";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    pub db_path: PathBuf,

    /// Interval between tracker polls / admission passes.
    pub poll_interval: Duration,
    /// Time a process gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Output lines kept per task/session for reconnecting clients.
    pub replay_lines: usize,
    /// Refinement sessions idle this long are dropped when a new one is created.
    pub session_idle_ttl: Duration,

    pub clickup_api_base: String,
    /// File the setup flow persists `CLICKUP_API_KEY` into.
    pub env_file: PathBuf,

    /// Runs this instead of the agent CLIs (prompt in `ORCHESTRATOR_PROMPT`).
    pub agent_command: Option<CommandSpec>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5150".to_string(),
            db_path: PathBuf::from(".orchestrator/orchestrator.db"),
            poll_interval: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            replay_lines: 2000,
            session_idle_ttl: Duration::from_secs(4 * 3600),
            clickup_api_base: CLICKUP_API_BASE.to_string(),
            env_file: PathBuf::from(".env"),
            agent_command: None,
        }
    }
}
