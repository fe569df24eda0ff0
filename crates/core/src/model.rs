use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Priority ordinal assigned to tasks whose tracker item carries no priority.
pub const PRIORITY_UNSET: i32 = 99;

/// Lifecycle of a task.
///
/// `queued → in_progress → {completed | stopped | failed}`; `stopped` and
/// `failed` go back to `in_progress` (or `queued` when no slot is free) via
/// restart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ingested from the tracker, waiting for a slot.
    Queued,
    /// Admitted; an agent process was (or is being) started.
    InProgress,
    /// Killed on user request.
    Stopped,
    /// Agent exited cleanly or the user marked it done.
    Completed,
    /// Agent exited non-zero or could not be started.
    Failed,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::InProgress,
        TaskStatus::Stopped,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Wire/storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unknown status / event type / agent strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    /// Which enum failed to parse.
    pub kind: &'static str,
    /// Offending input.
    pub value: String,
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "task status",
                value: s.to_string(),
            })
    }
}

/// A unit of work mirrored from the tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub clickup_task_id: String,
    pub clickup_list_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    /// 1 = urgent .. 4 = low.
    pub priority: Option<i32>,
    pub status: TaskStatus,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub time_spent_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Task {
    /// Ordinal used for admission; missing priority sorts last.
    pub fn priority_rank(&self) -> i32 {
        self.priority.unwrap_or(PRIORITY_UNSET)
    }

    /// Running time accumulated since the last start, if the task was started.
    pub fn elapsed_since_start(&self, now_ms: i64) -> i64 {
        self.started_at_ms
            .map(|started| (now_ms - started).max(0))
            .unwrap_or(0)
    }

    /// Description handed to the agent, falling back to the task name.
    pub fn effective_description(&self) -> String {
        match self.description.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => format!("Complete task: {}", self.name),
        }
    }
}

/// Fields required to create a task from a tracker item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub clickup_task_id: String,
    pub clickup_list_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub priority: Option<i32>,
}

/// Maps a ClickUp priority label to its ordinal.
pub fn priority_from_label(label: &str) -> Option<i32> {
    match label {
        "urgent" => Some(1),
        "high" => Some(2),
        "normal" => Some(3),
        "low" => Some(4),
        _ => None,
    }
}

/// Kind of event recorded in a task log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogEventType {
    /// Local status transition.
    Status,
    /// Tracker-side change (status moved, time logged).
    Clickup,
    /// Orchestrator bookkeeping (created, worktree, spawn, errors).
    System,
    /// One line of agent stdout/stderr.
    Output,
}

impl LogEventType {
    /// Wire/storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogEventType::Status => "status",
            LogEventType::Clickup => "clickup",
            LogEventType::System => "system",
            LogEventType::Output => "output",
        }
    }
}

impl FromStr for LogEventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(LogEventType::Status),
            "clickup" => Ok(LogEventType::Clickup),
            "system" => Ok(LogEventType::System),
            "output" => Ok(LogEventType::Output),
            other => Err(ParseEnumError {
                kind: "log event type",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted task log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: i64,
    pub task_id: i64,
    pub event_type: LogEventType,
    pub message: String,
    /// Only set for output events.
    pub is_stderr: Option<bool>,
    pub created_at_ms: i64,
}

/// Result of reading a task's log.
///
/// Tasks that predate structured logging only carry the blob captured at
/// process exit; an empty structured log next to such a blob is a valid state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRead {
    /// Ordered structured entries (possibly empty).
    Structured(Vec<LogEntry>),
    /// Unstructured output captured by older versions.
    Legacy(String),
}

impl LogRead {
    /// Picks the structured entries when present, else the legacy blob.
    pub fn resolve(entries: Vec<LogEntry>, legacy: Option<String>) -> Self {
        match legacy {
            Some(blob) if entries.is_empty() && !blob.is_empty() => LogRead::Legacy(blob),
            _ => LogRead::Structured(entries),
        }
    }
}

/// Formats a status-change log message.
pub fn status_change_message(from: TaskStatus, to: TaskStatus, note: Option<&str>) -> String {
    match note {
        Some(note) => format!("Status changed: {from} -> {to} ({note})"),
        None => format!("Status changed: {from} -> {to}"),
    }
}

/// The synthetic line emitted once per process after it exits.
pub fn exit_line(exit_code: i32) -> String {
    format!("\n[Process exited with code {exit_code}]")
}

/// Identity of a supervised process: one per task or UI refinement session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitId {
    Task(i64),
    Session(String),
}

impl UnitId {
    /// Task id, if this unit is a task.
    pub fn task_id(&self) -> Option<i64> {
        match self {
            UnitId::Task(id) => Some(*id),
            UnitId::Session(_) => None,
        }
    }

    /// Human label used in caller-facing messages.
    pub fn describe(&self) -> String {
        match self {
            UnitId::Task(id) => format!("Task {id}"),
            UnitId::Session(id) => format!("Session {id}"),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Task(id) => write!(f, "task:{id}"),
            UnitId::Session(id) => write!(f, "session:{id}"),
        }
    }
}

/// A program invocation handed to the process supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Command with no extra environment.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }
}

/// Supported coding agent CLIs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    /// Executable looked up on `PATH`.
    pub fn binary(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }

    /// Builds the non-interactive invocation for `prompt`.
    ///
    /// `claude` only streams when attached to a terminal, so it runs under
    /// `script` to get a pseudo-tty.
    pub fn command(self, prompt: &str) -> CommandSpec {
        match self {
            AgentKind::Claude => {
                let inner = [
                    "claude",
                    "-p",
                    prompt,
                    "--dangerously-skip-permissions",
                ];
                script_wrapped(&inner)
            }
            AgentKind::Codex => CommandSpec::new("codex", ["exec", prompt, "--full-auto"]),
            AgentKind::Gemini => CommandSpec::new("gemini", [prompt, "-y"]),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for AgentKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            "gemini" => Ok(AgentKind::Gemini),
            _ => Err(ParseEnumError {
                kind: "agent",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(target_os = "macos")]
fn script_wrapped(argv: &[&str]) -> CommandSpec {
    let mut args = vec!["-q".to_string(), "/dev/null".to_string()];
    args.extend(argv.iter().map(|a| a.to_string()));
    CommandSpec::new("script", args)
}

#[cfg(not(target_os = "macos"))]
fn script_wrapped(argv: &[&str]) -> CommandSpec {
    let joined = argv
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    CommandSpec::new("script", ["-q", "-e", "-c", joined.as_str(), "/dev/null"])
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Recognised settings keys and their defaults.
pub mod settings {
    pub const CLICKUP_LIST_ID: &str = "clickup_list_id";
    pub const CLICKUP_WORKSPACE_ID: &str = "clickup_workspace_id";
    pub const CLICKUP_SPACE_ID: &str = "clickup_space_id";
    pub const CLICKUP_FOLDER_ID: &str = "clickup_folder_id";
    pub const TRIGGER_STATUS: &str = "trigger_status";
    pub const TARGET_STATUS: &str = "target_status";
    pub const PARALLEL_LIMIT: &str = "parallel_limit";
    pub const TARGET_REPO_PATH: &str = "target_repo_path";
    pub const DEV_BRANCH: &str = "dev_branch";
    pub const AGENT_PROMPT: &str = "agent_prompt";
    pub const AGENT: &str = "agent";

    pub const DEFAULT_AGENT_PROMPT: &str = "Implement the task described above in this repository. \
Follow the existing code style, keep changes focused, run the relevant tests, \
and commit your work on the current branch with a descriptive message.";

    /// Seeded on first start; existing values are never overwritten.
    pub const DEFAULTS: &[(&str, &str)] = &[
        (CLICKUP_WORKSPACE_ID, ""),
        (CLICKUP_SPACE_ID, ""),
        (CLICKUP_FOLDER_ID, ""),
        (CLICKUP_LIST_ID, ""),
        (TRIGGER_STATUS, "Ready for Dev"),
        (TARGET_STATUS, "In Development"),
        (PARALLEL_LIMIT, "1"),
        (TARGET_REPO_PATH, ""),
        (DEV_BRANCH, "dev"),
        (AGENT_PROMPT, DEFAULT_AGENT_PROMPT),
        (AGENT, "claude"),
    ];
}

/// Typed view over the settings map with defaults applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.values
    }

    /// Raw value, empty strings treated as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn list_id(&self) -> Option<&str> {
        self.get(settings::CLICKUP_LIST_ID)
    }

    pub fn trigger_status(&self) -> &str {
        self.get_or(settings::TRIGGER_STATUS, "Ready for Dev")
    }

    pub fn target_status(&self) -> &str {
        self.get_or(settings::TARGET_STATUS, "In Development")
    }

    /// Parallel agent limit; unparsable values fall back to 1.
    pub fn parallel_limit(&self) -> usize {
        self.get(settings::PARALLEL_LIMIT)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1)
    }

    pub fn target_repo_path(&self) -> Option<&str> {
        self.get(settings::TARGET_REPO_PATH)
    }

    pub fn dev_branch(&self) -> &str {
        self.get_or(settings::DEV_BRANCH, "dev")
    }

    pub fn agent_prompt(&self) -> &str {
        self.get_or(settings::AGENT_PROMPT, settings::DEFAULT_AGENT_PROMPT)
    }

    pub fn agent(&self) -> AgentKind {
        self.get(settings::AGENT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

/// Prompt handed to the agent for a task.
pub fn task_prompt(task: &Task, instructions: &str) -> String {
    format!(
        "## Task\n{}\n\n## Instructions\n{}",
        task.effective_description(),
        instructions
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(description: Option<&str>) -> Task {
        Task {
            id: 1,
            clickup_task_id: "abc".into(),
            clickup_list_id: None,
            name: "Fix login".into(),
            description: description.map(String::from),
            priority: None,
            status: TaskStatus::Queued,
            worktree_path: None,
            branch_name: None,
            time_spent_ms: 0,
            started_at_ms: None,
            completed_at_ms: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn prompt_falls_back_to_name() {
        let p = task_prompt(&task(None), "do it");
        assert_eq!(p, "## Task\nComplete task: Fix login\n\n## Instructions\ndo it");
        let p = task_prompt(&task(Some("  ")), "x");
        assert!(p.starts_with("## Task\nComplete task: Fix login"));
    }

    #[test]
    fn legacy_blob_only_used_without_entries() {
        assert_eq!(
            LogRead::resolve(vec![], Some("old output".into())),
            LogRead::Legacy("old output".into())
        );
        assert_eq!(LogRead::resolve(vec![], Some(String::new())), LogRead::Structured(vec![]));
        assert_eq!(LogRead::resolve(vec![], None), LogRead::Structured(vec![]));
    }

    #[test]
    fn settings_defaults_and_parsing() {
        let s = Settings::default();
        assert_eq!(s.trigger_status(), "Ready for Dev");
        assert_eq!(s.parallel_limit(), 1);
        assert_eq!(s.agent(), AgentKind::Claude);
        assert!(s.list_id().is_none());

        let mut map = BTreeMap::new();
        map.insert(settings::PARALLEL_LIMIT.to_string(), "3".to_string());
        map.insert(settings::CLICKUP_LIST_ID.to_string(), " ".to_string());
        map.insert(settings::AGENT.to_string(), "Gemini".to_string());
        let s = Settings::from_map(map);
        assert_eq!(s.parallel_limit(), 3);
        assert!(s.list_id().is_none());
        assert_eq!(s.agent(), AgentKind::Gemini);
    }

    #[test]
    fn shell_quoting() {
        assert_eq!(shell_quote("claude"), "claude");
        assert_eq!(shell_quote("it's here"), r"'it'\''s here'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn agent_commands() {
        let codex = AgentKind::Codex.command("hi there");
        assert_eq!(codex.program, "codex");
        assert_eq!(codex.args, vec!["exec", "hi there", "--full-auto"]);
        let gemini = AgentKind::Gemini.command("p");
        assert_eq!(gemini.args, vec!["p", "-y"]);
        let claude = AgentKind::Claude.command("p");
        assert_eq!(claude.program, "script");
    }
}
