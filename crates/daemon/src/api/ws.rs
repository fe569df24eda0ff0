//! Terminal sockets: `connected`, then the replay tail, then live output.
//! Closing a socket never touches the process.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use clickup_orchestrator_core::api::{ServerMessage, SessionClientMessage, TerminalClientMessage};
use clickup_orchestrator_core::model::UnitId;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use crate::gateway::OutputLine;
use crate::state::AppState;

pub(super) async fn task_terminal(
    ws: WebSocketUpgrade,
    State(st): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, st, UnitId::Task(id)))
}

pub(super) async fn session_terminal(
    ws: WebSocketUpgrade,
    State(st): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, st, UnitId::Session(session_id)))
}

type Outbound = SplitSink<WebSocket, Message>;

async fn send(tx: &mut Outbound, msg: &ServerMessage) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

fn output(line: OutputLine) -> ServerMessage {
    ServerMessage::Output {
        line: line.line,
        is_stderr: line.is_stderr,
    }
}

fn error(message: impl ToString) -> ServerMessage {
    ServerMessage::Error {
        message: message.to_string(),
    }
}

async fn run_socket(socket: WebSocket, st: AppState, unit: UnitId) {
    let (mut tx, mut rx) = socket.split();

    let known = match &unit {
        UnitId::Task(id) => st.tasks.exists(*id).unwrap_or(false),
        UnitId::Session(id) => st.sessions.exists(id),
    };
    if !known {
        let what = if unit.task_id().is_some() { "Task" } else { "Session" };
        let _ = send(&mut tx, &error(format!("{what} not found"))).await;
        let _ = tx.close().await;
        return;
    }

    let sub = st.gateway.subscribe(&unit);
    let is_running = st.supervisor.is_running(&unit).await;
    let hello = match &unit {
        UnitId::Task(id) => ServerMessage::Connected {
            task_id: Some(*id),
            session_id: None,
            is_running,
        },
        UnitId::Session(id) => ServerMessage::Connected {
            task_id: None,
            session_id: Some(id.clone()),
            is_running,
        },
    };
    if send(&mut tx, &hello).await.is_err() {
        return;
    }
    tracing::debug!(unit = %unit, replay = sub.replay.len(), is_running, "terminal client connected");
    for line in sub.replay {
        if send(&mut tx, &output(line)).await.is_err() {
            return;
        }
    }

    let mut live = sub.live;
    loop {
        tokio::select! {
            line = live.recv() => match line {
                Some(line) => {
                    if send(&mut tx, &output(line)).await.is_err() {
                        break;
                    }
                }
                // Stream dropped: the task was deleted.
                None => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_inbound(&st, &unit, text.as_str()).await {
                        if send(&mut tx, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(unit = %unit, "terminal client disconnected");
}

/// Applies one client message; returns the reply to send, if any.
async fn handle_inbound(st: &AppState, unit: &UnitId, text: &str) -> Option<ServerMessage> {
    match unit {
        UnitId::Task(task_id) => match serde_json::from_str::<TerminalClientMessage>(text) {
            Ok(TerminalClientMessage::Input { data }) => write_input(st, unit, data).await,
            Ok(TerminalClientMessage::Kill) => match st.supervisor.kill(unit).await {
                Ok(true) => {
                    st.logs.system(*task_id, "Kill requested from terminal");
                    None
                }
                Ok(false) => None,
                Err(e) => Some(error(e)),
            },
            Err(e) => Some(error(format!("Invalid message: {e}"))),
        },
        UnitId::Session(session_id) => match serde_json::from_str::<SessionClientMessage>(text) {
            Ok(SessionClientMessage::Input { data }) => write_input(st, unit, data).await,
            Ok(SessionClientMessage::Kill) => kill(st, unit).await,
            Ok(SessionClientMessage::Spawn {
                prompt,
                agent,
                worktree_path,
            }) => match st
                .sessions
                .spawn(session_id, &prompt, agent, &worktree_path)
                .await
            {
                Ok(pid) => Some(ServerMessage::Spawned { pid }),
                Err(e) => Some(error(e)),
            },
            Ok(SessionClientMessage::Cancel { message_id }) => {
                match st.sessions.cancel(session_id, &message_id) {
                    Ok(true) => None,
                    Ok(false) => Some(error("Message not found in queue")),
                    Err(e) => Some(error(e)),
                }
            }
            Err(e) => Some(error(format!("Invalid message: {e}"))),
        },
    }
}

async fn write_input(st: &AppState, unit: &UnitId, data: String) -> Option<ServerMessage> {
    st.supervisor
        .write_input(unit, data.into_bytes())
        .await
        .err()
        .map(error)
}

/// Killing something that already exited is not an error.
async fn kill(st: &AppState, unit: &UnitId) -> Option<ServerMessage> {
    match st.supervisor.kill(unit).await {
        Ok(_) => None,
        Err(e) => Some(error(e)),
    }
}
