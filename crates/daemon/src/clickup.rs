//! ClickUp REST client and the tracker seam the scheduler talks to.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use clickup_orchestrator_core::model::priority_from_label;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const API_KEY_ENV: &str = "CLICKUP_API_KEY";

#[derive(Debug, Error)]
pub enum ClickUpError {
    #[error("CLICKUP_API_KEY not set")]
    NoApiKey,
    /// Non-2xx reply: `"<status>: <body>"`.
    #[error("ClickUp API error: {0}")]
    Api(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid ClickUp URL: {0}")]
    Url(String),
}

pub type Result<T> = std::result::Result<T, ClickUpError>;

/// The API key in effect; the setup flow can replace it at runtime.
#[derive(Debug, Clone, Default)]
pub struct ApiKey(Arc<RwLock<Option<String>>>);

impl ApiKey {
    pub fn new(key: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(key.filter(|k| !k.trim().is_empty()))))
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var(API_KEY_ENV).ok())
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }

    pub fn set(&self, key: &str) {
        *self.0.write() = Some(key.to_string());
    }

    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Space {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct List {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Status {
    #[serde(default)]
    pub id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(rename = "type", default)]
    pub status_type: Option<String>,
    #[serde(default)]
    pub orderindex: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TeamsResponse {
    teams: Vec<Team>,
}

#[derive(Debug, Deserialize)]
struct SpacesResponse {
    spaces: Vec<Space>,
}

#[derive(Debug, Deserialize)]
struct FoldersResponse {
    folders: Vec<Folder>,
}

#[derive(Debug, Deserialize)]
struct ListsResponse {
    lists: Vec<List>,
}

#[derive(Debug, Deserialize)]
struct ListDetails {
    #[serde(default)]
    statuses: Vec<Status>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<RawPriority>,
    #[serde(default)]
    list: Option<RawListRef>,
}

#[derive(Debug, Deserialize)]
struct RawPriority {
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawListRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TasksResponse {
    tasks: Vec<RawTask>,
}

#[derive(Debug, Serialize)]
struct UpdateTaskRequest<'a> {
    status: &'a str,
}

#[derive(Debug, Serialize)]
struct TimeEntryRequest {
    start: i64,
    end: i64,
    time: i64,
}

/// A work item as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerTask {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// 1 = urgent .. 4 = low.
    pub priority: Option<i32>,
    pub list_id: Option<String>,
}

impl From<RawTask> for TrackerTask {
    fn from(raw: RawTask) -> Self {
        Self {
            priority: raw
                .priority
                .and_then(|p| p.priority)
                .and_then(|label| priority_from_label(&label)),
            list_id: raw.list.map(|l| l.id),
            description: raw.description.filter(|d| !d.trim().is_empty()),
            id: raw.id,
            name: raw.name,
        }
    }
}

/// External task tracker the scheduler ingests from and reports to.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Whether credentials are available; the scheduler skips ingestion otherwise.
    fn is_configured(&self) -> bool;

    async fn tasks_in_status(&self, list_id: &str, status: &str) -> Result<Vec<TrackerTask>>;

    async fn set_status(&self, task_id: &str, status: &str) -> Result<()>;

    async fn add_time_entry(&self, task_id: &str, start_ms: i64, end_ms: i64) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ClickUpClient {
    http: Client,
    base: String,
    key: ApiKey,
}

impl ClickUpClient {
    pub fn new(base: impl Into<String>, key: ApiKey) -> Self {
        Self {
            http: Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            key,
        }
    }

    /// Same endpoint, different key; used to validate a candidate key.
    pub fn with_key(&self, key: &str) -> Self {
        Self {
            http: self.http.clone(),
            base: self.base.clone(),
            key: ApiKey::new(Some(key.to_string())),
        }
    }

    pub fn api_key(&self) -> &ApiKey {
        &self.key
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.base, endpoint)).map_err(|e| ClickUpError::Url(e.to_string()))
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let key = self.key.get().ok_or(ClickUpError::NoApiKey)?;
        let response = req.header("Authorization", key).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClickUpError::Api(format!("{status}: {body}")));
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = self.url(endpoint)?;
        self.send(self.http.get(url)).await
    }

    pub async fn workspaces(&self) -> Result<Vec<Team>> {
        Ok(self.get::<TeamsResponse>("/team").await?.teams)
    }

    pub async fn spaces(&self, team_id: &str) -> Result<Vec<Space>> {
        Ok(self.get::<SpacesResponse>(&format!("/team/{team_id}/space")).await?.spaces)
    }

    pub async fn folders(&self, space_id: &str) -> Result<Vec<Folder>> {
        Ok(self.get::<FoldersResponse>(&format!("/space/{space_id}/folder")).await?.folders)
    }

    pub async fn folder_lists(&self, folder_id: &str) -> Result<Vec<List>> {
        Ok(self.get::<ListsResponse>(&format!("/folder/{folder_id}/list")).await?.lists)
    }

    pub async fn folderless_lists(&self, space_id: &str) -> Result<Vec<List>> {
        Ok(self.get::<ListsResponse>(&format!("/space/{space_id}/list")).await?.lists)
    }

    pub async fn list_statuses(&self, list_id: &str) -> Result<Vec<Status>> {
        Ok(self.get::<ListDetails>(&format!("/list/{list_id}")).await?.statuses)
    }
}

#[async_trait]
impl TaskTracker for ClickUpClient {
    fn is_configured(&self) -> bool {
        self.key.is_set()
    }

    async fn tasks_in_status(&self, list_id: &str, status: &str) -> Result<Vec<TrackerTask>> {
        let mut url = self.url(&format!("/list/{list_id}/task"))?;
        url.query_pairs_mut().append_pair("statuses[]", status);
        let response: TasksResponse = self.send(self.http.get(url)).await?;
        Ok(response.tasks.into_iter().map(TrackerTask::from).collect())
    }

    async fn set_status(&self, task_id: &str, status: &str) -> Result<()> {
        let url = self.url(&format!("/task/{task_id}"))?;
        let _: serde_json::Value = self
            .send(self.http.put(url).json(&UpdateTaskRequest { status }))
            .await?;
        Ok(())
    }

    async fn add_time_entry(&self, task_id: &str, start_ms: i64, end_ms: i64) -> Result<()> {
        let url = self.url(&format!("/task/{task_id}/time"))?;
        let body = TimeEntryRequest {
            start: start_ms,
            end: end_ms,
            time: end_ms.saturating_sub(start_ms),
        };
        let _: serde_json::Value = self.send(self.http.post(url).json(&body)).await?;
        Ok(())
    }
}

/// Writes `CLICKUP_API_KEY=<key>` into the env file, replacing an existing
/// entry and keeping every other line.
pub fn persist_api_key(env_file: &Path, key: &str) -> std::io::Result<()> {
    let existing = match std::fs::read_to_string(env_file) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    let entry = format!("{API_KEY_ENV}={key}");
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            if line.trim_start().starts_with(&format!("{API_KEY_ENV}=")) {
                replaced = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(entry);
    }
    if let Some(parent) = env_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(env_file, lines.join("\n") + "\n")
}
