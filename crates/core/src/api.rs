//! JSON shapes shared with the dashboard.
//!
//! Field names here are a compatibility contract; rename nothing.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{AgentKind, LogEntry, LogRead, Task, TaskStatus};
use crate::rfc3339_from_ms;

/// Task as returned by `/api/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResponse {
    pub id: i64,
    pub clickup_task_id: String,
    pub name: String,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub status: TaskStatus,
    pub worktree_path: Option<String>,
    pub time_spent_ms: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub is_running: bool,
}

impl TaskResponse {
    /// Builds the response; liveness comes from the process supervisor.
    pub fn from_task(task: Task, is_running: bool) -> Self {
        Self {
            id: task.id,
            clickup_task_id: task.clickup_task_id,
            name: task.name,
            description: task.description,
            priority: task.priority,
            status: task.status,
            worktree_path: task.worktree_path,
            time_spent_ms: task.time_spent_ms,
            started_at: task.started_at_ms.and_then(rfc3339_from_ms),
            completed_at: task.completed_at_ms.and_then(rfc3339_from_ms),
            is_running,
        }
    }
}

/// `GET /api/tasks` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
}

/// `GET /api/tasks/stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStats {
    pub queued: u64,
    pub in_progress: u64,
    pub stopped: u64,
    pub completed: u64,
    pub failed: u64,
    pub running_processes: u64,
}

/// One log entry on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntryResponse {
    pub id: i64,
    pub task_id: i64,
    pub event_type: String,
    pub message: String,
    pub is_stderr: Option<bool>,
    pub created_at: Option<String>,
}

impl From<LogEntry> for LogEntryResponse {
    fn from(e: LogEntry) -> Self {
        Self {
            id: e.id,
            task_id: e.task_id,
            event_type: e.event_type.as_str().to_string(),
            message: e.message,
            is_stderr: e.is_stderr,
            created_at: rfc3339_from_ms(e.created_at_ms),
        }
    }
}

/// `GET /api/tasks/:id/logs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskLogsResponse {
    pub logs: Vec<LogEntryResponse>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub legacy_output_log: Option<String>,
}

impl From<LogRead> for TaskLogsResponse {
    fn from(read: LogRead) -> Self {
        match read {
            LogRead::Structured(entries) => Self {
                logs: entries.into_iter().map(Into::into).collect(),
                legacy_output_log: None,
            },
            LogRead::Legacy(blob) => Self {
                logs: Vec::new(),
                legacy_output_log: Some(blob),
            },
        }
    }
}

/// `GET/PUT /api/settings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsPayload {
    pub settings: BTreeMap<String, String>,
}

/// `GET /api/settings/:key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingValue {
    pub key: String,
    pub value: String,
}

/// Generic `{error}` reply used by the git/files/clickup endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// `{success: true}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// Body carrying a repository path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

/// `POST /api/git/validate-path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatePathResponse {
    pub valid: bool,
    pub error: Option<String>,
}

/// `GET /api/git/branches`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchesResponse {
    pub branches: Vec<String>,
    pub current: Option<String>,
}

/// `POST /api/git/create-branch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBranchRequest {
    pub path: String,
    pub branch: String,
    /// Start point; defaults to the current HEAD.
    #[serde(default)]
    pub from: Option<String>,
    /// Switch to the new branch after creating it.
    #[serde(default)]
    pub checkout: bool,
}

/// `POST /api/git/checkout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub path: String,
    pub branch: String,
}

/// `POST /api/git/detect-path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectPathRequest {
    pub marker_filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectPathResponse {
    pub found: bool,
    pub path: Option<String>,
}

/// Node of `GET /api/files/tree`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub children: Option<Vec<FileNode>>,
}

/// `GET /api/files/content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    pub language: String,
    pub encoding: String,
}

/// `PUT /api/files/content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveContentRequest {
    pub path: String,
    pub content: String,
}

/// `POST /api/files/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileRequest {
    pub path: String,
    #[serde(default)]
    pub is_directory: bool,
}

/// `POST /api/files/rename`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    pub old_path: String,
    pub new_path: String,
}

/// `GET /api/setup/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupStatus {
    pub is_complete: bool,
    pub has_api_key: bool,
    pub has_list_selected: bool,
    pub has_repo_configured: bool,
    pub api_key_valid: bool,
}

/// `POST /api/setup/api-key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveApiKeyRequest {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveApiKeyResponse {
    pub success: bool,
    pub valid: bool,
    pub error: Option<String>,
}

/// `POST /api/setup/complete`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompleteSetupResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// `POST /api/ui-refinements/session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub branch_name: String,
    /// Directory the session's agents run in; defaults to the target repo.
    #[serde(default)]
    pub worktree_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionResponse {
    pub session_id: String,
    pub branch_name: String,
}

/// DOM element picked in the proxied page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElementMetadata {
    #[serde(rename = "tagName")]
    pub tag_name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "classList", default)]
    pub class_list: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(rename = "textContent", default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub xpath: String,
    #[serde(rename = "cssSelector", default)]
    pub css_selector: String,
}

/// `POST /api/ui-refinements/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(default)]
    pub element_context: Option<ElementMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatResponse {
    pub success: bool,
    pub queued: bool,
    pub queue_position: Option<usize>,
    /// Id usable with the cancel endpoint while the message is queued.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message_id: Option<String>,
}

/// Queued chat message summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: String,
    pub message: String,
    pub agent: AgentKind,
}

/// `GET /api/ui-refinements/queue/:id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending_messages: usize,
    pub current_task: Option<String>,
    #[serde(default)]
    pub messages: Vec<QueuedMessage>,
}

/// `GET /api/ui-refinements/proxy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyQuery {
    pub url: String,
}

/// Messages sent by the server on both terminal sockets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        task_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session_id: Option<String>,
        is_running: bool,
    },
    Output {
        line: String,
        is_stderr: bool,
    },
    Error {
        message: String,
    },
    Spawned {
        pid: u32,
    },
}

/// Messages accepted on `/ws/tasks/:id/terminal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientMessage {
    Input { data: String },
    Kill,
}

/// Messages accepted on `/ws/ui-refinements/:session_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionClientMessage {
    Input {
        data: String,
    },
    Kill,
    Spawn {
        prompt: String,
        #[serde(default)]
        agent: AgentKind,
        worktree_path: String,
    },
    Cancel {
        message_id: String,
    },
}
