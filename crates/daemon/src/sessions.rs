//! UI refinement sessions: chat messages turned into agent runs, one at a
//! time per session, with a FIFO of pending messages.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clickup_orchestrator_core::api::{
    ChatRequest, ChatResponse, ElementMetadata, QueueStatus, QueuedMessage, SessionResponse,
};
use clickup_orchestrator_core::model::{AgentKind, CommandSpec, Settings, UnitId};
use clickup_orchestrator_core::{new_session_id, new_ulid};
use parking_lot::Mutex;

use crate::agents::AgentLauncher;
use crate::db::Db;
use crate::error::ApiError;
use crate::gateway::StreamGateway;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone)]
struct PendingMessage {
    id: String,
    message: String,
    agent: AgentKind,
    prompt: String,
}

#[derive(Debug)]
struct Session {
    branch_name: String,
    workdir: Option<PathBuf>,
    /// Message whose agent is running. Set before the spawn and cleared by
    /// the exit, so at most one agent is attached.
    current: Option<String>,
    queue: VecDeque<PendingMessage>,
    last_active: Instant,
}

impl Session {
    fn is_idle_since(&self, cutoff: Instant) -> bool {
        self.current.is_none() && self.queue.is_empty() && self.last_active <= cutoff
    }
}

pub struct RefinementService {
    sessions: Mutex<HashMap<String, Session>>,
    supervisor: ProcessSupervisor,
    gateway: Arc<StreamGateway>,
    launcher: AgentLauncher,
    db: Db,
    kill_grace: Duration,
    idle_ttl: Duration,
}

impl RefinementService {
    pub fn new(
        supervisor: ProcessSupervisor,
        gateway: Arc<StreamGateway>,
        launcher: AgentLauncher,
        db: Db,
        kill_grace: Duration,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            supervisor,
            gateway,
            launcher,
            db,
            kill_grace,
            idle_ttl,
        }
    }

    pub fn create(&self, branch_name: String, worktree_path: Option<String>) -> SessionResponse {
        self.prune_idle();
        let session_id = new_session_id();
        let workdir = worktree_path
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        tracing::info!(session_id = %session_id, branch = %branch_name, "refinement session created");
        self.sessions.lock().insert(
            session_id.clone(),
            Session {
                branch_name: branch_name.clone(),
                workdir,
                current: None,
                queue: VecDeque::new(),
                last_active: Instant::now(),
            },
        );
        SessionResponse {
            session_id,
            branch_name,
        }
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drops sessions with no agent, nothing queued and no activity within
    /// the idle TTL, along with their terminal streams.
    fn prune_idle(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.idle_ttl) else {
            return;
        };
        let pruned: Vec<String> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_idle_since(cutoff))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };
        for id in pruned {
            tracing::info!(session_id = %id, "idle refinement session dropped");
            self.gateway.remove(&UnitId::Session(id));
        }
    }

    /// Ends a session: kills its agent, drops pending messages and forgets
    /// its terminal stream.
    pub async fn delete(&self, session_id: &str) -> Result<(), ApiError> {
        let removed = self
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| ApiError::not_found("Session not found"))?;
        let unit = UnitId::Session(session_id.to_string());
        if self.supervisor.kill(&unit).await? {
            let grace = self.kill_grace + Duration::from_secs(1);
            if tokio::time::timeout(grace, self.supervisor.wait_exit(&unit))
                .await
                .is_err()
            {
                tracing::warn!(session_id, "agent still alive after session delete");
            }
        }
        self.gateway.remove(&unit);
        tracing::info!(session_id, dropped = removed.queue.len(), "refinement session deleted");
        Ok(())
    }

    /// Working directory: the session's own, else the configured target repo.
    fn workdir(&self, session_id: &str) -> Result<PathBuf, ApiError> {
        let own = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| ApiError::not_found("Session not found"))?;
            session.workdir.clone()
        };
        if let Some(dir) = own {
            return Ok(dir);
        }
        Settings::from_map(self.db.all_settings()?)
            .target_repo_path()
            .map(PathBuf::from)
            .ok_or_else(|| ApiError::validation("No working directory: set target_repo_path or pass worktree_path"))
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ApiError> {
        let message = req.message.trim();
        if message.is_empty() {
            return Err(ApiError::validation("Message cannot be empty"));
        }
        let pending = PendingMessage {
            id: new_ulid().to_string(),
            message: message.to_string(),
            agent: req.agent,
            prompt: refinement_prompt(message, req.element_context.as_ref()),
        };
        let unit = UnitId::Session(req.session_id.clone());

        let must_queue = {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(&req.session_id)
                .ok_or_else(|| ApiError::not_found("Session not found"))?;
            session.current.is_some() || !session.queue.is_empty()
        };
        if !must_queue {
            match self.start(&req.session_id, &pending).await {
                Ok(_) => {
                    return Ok(ChatResponse {
                        success: true,
                        queued: false,
                        queue_position: None,
                        message_id: Some(pending.id),
                    })
                }
                Err(ApiError::Conflict(_)) => {
                    tracing::debug!(unit = %unit, "agent already attached; queueing message");
                }
                Err(e) => return Err(e),
            }
        }

        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&req.session_id)
            .ok_or_else(|| ApiError::not_found("Session not found"))?;
        let id = pending.id.clone();
        session.queue.push_back(pending);
        session.last_active = Instant::now();
        let position = session.queue.len();
        tracing::info!(unit = %unit, position, "chat message queued");
        Ok(ChatResponse {
            success: true,
            queued: true,
            queue_position: Some(position),
            message_id: Some(id),
        })
    }

    async fn start(&self, session_id: &str, msg: &PendingMessage) -> Result<u32, ApiError> {
        let workdir = self.workdir(session_id)?;
        let cmd = self.launcher.command(msg.agent, &msg.prompt)?;
        let branch = self.reserve(session_id, &msg.message)?;
        let pid = self.spawn_reserved(session_id, cmd, &workdir).await?;
        tracing::info!(session_id, pid, message_id = %msg.id, branch = %branch, "refinement agent started");
        Ok(pid)
    }

    /// Claims the session's single agent slot; returns the branch name.
    fn reserve(&self, session_id: &str, label: &str) -> Result<String, ApiError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::not_found("Session not found"))?;
        if session.current.is_some() {
            return Err(ApiError::Conflict(
                "An agent is already running for this session".to_string(),
            ));
        }
        session.current = Some(label.to_string());
        session.last_active = Instant::now();
        Ok(session.branch_name.clone())
    }

    /// Spawns into a reserved slot, releasing it if the spawn fails.
    async fn spawn_reserved(
        &self,
        session_id: &str,
        cmd: CommandSpec,
        workdir: &Path,
    ) -> Result<u32, ApiError> {
        let spawned = self
            .supervisor
            .spawn(UnitId::Session(session_id.to_string()), cmd, workdir)
            .await;
        if spawned.is_err() {
            self.finished(session_id);
        }
        Ok(spawned?)
    }

    /// Direct spawn from the terminal socket.
    pub async fn spawn(
        &self,
        session_id: &str,
        prompt: &str,
        agent: AgentKind,
        worktree_path: &str,
    ) -> Result<u32, ApiError> {
        if !self.exists(session_id) {
            return Err(ApiError::not_found("Session not found"));
        }
        let workdir = if worktree_path.trim().is_empty() {
            self.workdir(session_id)?
        } else {
            PathBuf::from(worktree_path)
        };
        let cmd = self.launcher.command(agent, prompt)?;
        self.reserve(session_id, prompt)?;
        self.spawn_reserved(session_id, cmd, &workdir).await
    }

    pub fn queue_status(&self, session_id: &str) -> Result<QueueStatus, ApiError> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| ApiError::not_found("Session not found"))?;
        Ok(QueueStatus {
            pending_messages: session.queue.len(),
            current_task: session.current.clone(),
            messages: session
                .queue
                .iter()
                .map(|m| QueuedMessage {
                    id: m.id.clone(),
                    message: m.message.clone(),
                    agent: m.agent,
                })
                .collect(),
        })
    }

    /// Drops a pending message; `false` if it is not (or no longer) queued.
    pub fn cancel(&self, session_id: &str, message_id: &str) -> Result<bool, ApiError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::not_found("Session not found"))?;
        let before = session.queue.len();
        session.queue.retain(|m| m.id != message_id);
        Ok(session.queue.len() != before)
    }

    /// Called when the session's process exited; clears the running marker.
    pub fn finished(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            session.current = None;
            session.last_active = Instant::now();
        }
    }

    /// Starts the next queued message, if any. Failures are logged and the
    /// message is dropped so the queue keeps moving.
    pub async fn start_next(&self, session_id: &str) {
        loop {
            let next = {
                let mut sessions = self.sessions.lock();
                match sessions.get_mut(session_id) {
                    Some(session) if session.current.is_none() => session.queue.pop_front(),
                    _ => None,
                }
            };
            let Some(msg) = next else {
                return;
            };
            match self.start(session_id, &msg).await {
                Ok(_) => return,
                Err(ApiError::Conflict(_)) => {
                    // Someone attached a process in between; put it back.
                    if let Some(session) = self.sessions.lock().get_mut(session_id) {
                        session.queue.push_front(msg);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(session_id, message_id = %msg.id, error = %e, "queued refinement failed to start");
                }
            }
        }
    }
}

/// Prompt for a chat message, with the picked element described when present.
pub fn refinement_prompt(message: &str, element: Option<&ElementMetadata>) -> String {
    let mut prompt = String::new();
    if let Some(el) = element {
        prompt.push_str("## Selected element\n");
        let _ = writeln!(prompt, "- Tag: <{}>", el.tag_name);
        if let Some(id) = el.id.as_deref().filter(|s| !s.is_empty()) {
            let _ = writeln!(prompt, "- Id: {id}");
        }
        if !el.class_list.is_empty() {
            let _ = writeln!(prompt, "- Classes: {}", el.class_list.join(" "));
        }
        if !el.css_selector.is_empty() {
            let _ = writeln!(prompt, "- CSS selector: {}", el.css_selector);
        }
        if !el.xpath.is_empty() {
            let _ = writeln!(prompt, "- XPath: {}", el.xpath);
        }
        if let Some(text) = el.text_content.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let _ = writeln!(prompt, "- Text: {text}");
        }
        prompt.push('\n');
    }
    prompt.push_str("## Request\n");
    prompt.push_str(message);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_describes_selected_element() {
        let el = ElementMetadata {
            tag_name: "button".into(),
            id: Some("save".into()),
            class_list: vec!["btn".into(), "primary".into()],
            attributes: Default::default(),
            text_content: Some("  Save  ".into()),
            xpath: "//*[@id=\"save\"]".into(),
            css_selector: "#save".into(),
        };
        let prompt = refinement_prompt("make it green", Some(&el));
        assert!(prompt.starts_with("## Selected element\n- Tag: <button>\n- Id: save\n"));
        assert!(prompt.contains("- Classes: btn primary\n"));
        assert!(prompt.contains("- CSS selector: #save\n"));
        assert!(prompt.contains("- Text: Save\n"));
        assert!(prompt.ends_with("## Request\nmake it green"));

        assert_eq!(refinement_prompt("hi", None), "## Request\nhi");
    }
}
