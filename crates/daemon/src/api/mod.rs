//! HTTP and WebSocket surface consumed by the dashboard.

use std::fmt::Display;

use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clickup_orchestrator_core::api::ErrorResponse;
use serde::Serialize;

use crate::state::AppState;

mod clickup;
mod files;
mod git;
mod refinements;
mod settings;
mod setup;
mod tasks;
mod ws;

/// REST routes under `/api`, terminal sockets under `/ws`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .merge(tasks::routes())
        .merge(settings::routes())
        .merge(git::routes())
        .merge(files::routes())
        .merge(clickup::routes())
        .merge(setup::routes())
        .merge(refinements::routes());

    Router::new()
        .nest("/api", api)
        .route("/ws/tasks/{id}/terminal", get(ws::task_terminal))
        .route("/ws/ui-refinements/{session_id}", get(ws::session_terminal))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Dashboard convention for git/files/ClickUp/setup endpoints: failures are
/// still `200` with an `{error}` body.
fn reply<T: Serialize, E: Display>(result: Result<T, E>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => Json(ErrorResponse::new(e.to_string())).into_response(),
    }
}
