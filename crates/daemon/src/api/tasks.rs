use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use clickup_orchestrator_core::api::{
    ListTasksQuery, SuccessResponse, TaskLogsResponse, TaskResponse, TaskStats,
};
use clickup_orchestrator_core::model::TaskStatus;

use crate::error::ApiError;
use crate::state::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list))
        .route("/tasks/stats", get(stats))
        .route("/tasks/{id}", get(show).delete(remove))
        .route("/tasks/{id}/stop", post(stop))
        .route("/tasks/{id}/restart", post(restart))
        .route("/tasks/{id}/complete", post(complete))
        .route("/tasks/{id}/logs", get(logs))
}

async fn list(
    State(st): State<AppState>,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let status = match q.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(s.parse::<TaskStatus>().map_err(ApiError::validation)?),
        None => None,
    };
    Ok(Json(st.tasks.list(status).await?))
}

async fn stats(State(st): State<AppState>) -> Result<Json<TaskStats>, ApiError> {
    Ok(Json(st.tasks.stats().await?))
}

async fn show(State(st): State<AppState>, Path(id): Path<i64>) -> Result<Json<TaskResponse>, ApiError> {
    Ok(Json(st.tasks.get(id).await?))
}

async fn stop(State(st): State<AppState>, Path(id): Path<i64>) -> Result<Json<TaskResponse>, ApiError> {
    Ok(Json(st.tasks.stop(id).await?))
}

async fn restart(State(st): State<AppState>, Path(id): Path<i64>) -> Result<Json<TaskResponse>, ApiError> {
    Ok(Json(st.tasks.restart(id).await?))
}

async fn complete(State(st): State<AppState>, Path(id): Path<i64>) -> Result<Json<TaskResponse>, ApiError> {
    Ok(Json(st.tasks.complete(id).await?))
}

async fn remove(State(st): State<AppState>, Path(id): Path<i64>) -> Result<Json<SuccessResponse>, ApiError> {
    st.tasks.delete(id).await?;
    Ok(Json(SuccessResponse::ok()))
}

async fn logs(State(st): State<AppState>, Path(id): Path<i64>) -> Result<Json<TaskLogsResponse>, ApiError> {
    if !st.tasks.exists(id)? {
        return Err(ApiError::not_found("Task not found"));
    }
    Ok(Json(st.logs.read(id).await?.into()))
}
