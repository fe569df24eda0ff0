use std::path::PathBuf;

use axum::extract::Query;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clickup_orchestrator_core::api::{
    CreateFileRequest, PathRequest, RenameRequest, SaveContentRequest, SuccessResponse,
};

use super::reply;
use crate::files::{self, FileError};
use crate::state::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/files/tree", get(tree))
        .route("/files/content", get(content).put(save))
        .route("/files/create", post(create))
        .route("/files/rename", post(rename))
        .route("/files", delete(remove))
}

/// Runs blocking filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res.map_err(|e| e.to_string()),
        Err(e) => Err(format!("file operation aborted: {e}")),
    }
}

async fn tree(Query(q): Query<PathRequest>) -> Response {
    let root = PathBuf::from(q.path);
    reply(blocking(move || files::tree(&root)).await)
}

async fn content(Query(q): Query<PathRequest>) -> Response {
    let path = PathBuf::from(q.path);
    reply(blocking(move || files::read(&path)).await)
}

async fn save(Json(req): Json<SaveContentRequest>) -> Response {
    let path = PathBuf::from(req.path);
    reply(
        blocking(move || files::save(&path, &req.content))
            .await
            .map(|()| SuccessResponse::ok()),
    )
}

async fn create(Json(req): Json<CreateFileRequest>) -> Response {
    let path = PathBuf::from(req.path);
    reply(
        blocking(move || files::create(&path, req.is_directory))
            .await
            .map(|()| SuccessResponse::ok()),
    )
}

async fn rename(Json(req): Json<RenameRequest>) -> Response {
    let (from, to) = (PathBuf::from(req.old_path), PathBuf::from(req.new_path));
    reply(
        blocking(move || files::rename(&from, &to))
            .await
            .map(|()| SuccessResponse::ok()),
    )
}

async fn remove(Query(q): Query<PathRequest>) -> Response {
    let path = PathBuf::from(q.path);
    tracing::info!(path = %path.display(), "deleting path");
    reply(
        blocking(move || files::delete(&path))
            .await
            .map(|()| SuccessResponse::ok()),
    )
}
