use std::path::Path;

use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use clickup_orchestrator_core::api::{
    BranchesResponse, CheckoutRequest, CreateBranchRequest, DetectPathRequest, DetectPathResponse,
    PathRequest, SuccessResponse, ValidatePathResponse,
};
use clickup_orchestrator_core::validation::validate_marker_filename;

use super::reply;
use crate::state::AppState;
use crate::worktree::detect_path;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/git/validate-path", post(validate_path))
        .route("/git/branches", get(branches))
        .route("/git/create-branch", post(create_branch))
        .route("/git/checkout", post(checkout))
        .route("/git/fetch", post(fetch))
        .route("/git/detect-path", post(detect))
}

async fn validate_path(State(st): State<AppState>, Json(req): Json<PathRequest>) -> Json<ValidatePathResponse> {
    let res = st.worktrees.validate(Path::new(req.path.trim())).await;
    Json(ValidatePathResponse {
        valid: res.is_ok(),
        error: res.err().map(|e| e.to_string()),
    })
}

async fn branches(State(st): State<AppState>, Query(q): Query<PathRequest>) -> Response {
    reply(
        st.worktrees
            .branches(Path::new(&q.path))
            .await
            .map(|(branches, current)| BranchesResponse { branches, current }),
    )
}

async fn create_branch(State(st): State<AppState>, Json(req): Json<CreateBranchRequest>) -> Response {
    reply(
        st.worktrees
            .create_branch(Path::new(&req.path), req.branch.trim(), req.from.as_deref(), req.checkout)
            .await
            .map(|()| SuccessResponse::ok()),
    )
}

async fn checkout(State(st): State<AppState>, Json(req): Json<CheckoutRequest>) -> Response {
    reply(
        st.worktrees
            .checkout(Path::new(&req.path), req.branch.trim())
            .await
            .map(|()| SuccessResponse::ok()),
    )
}

async fn fetch(State(st): State<AppState>, Json(req): Json<PathRequest>) -> Response {
    reply(
        st.worktrees
            .fetch(Path::new(&req.path))
            .await
            .map(|()| SuccessResponse::ok()),
    )
}

async fn detect(Json(req): Json<DetectPathRequest>) -> Response {
    if let Err(e) = validate_marker_filename(&req.marker_filename) {
        return reply::<DetectPathResponse, _>(Err(e));
    }
    let found = detect_path(&req.marker_filename).await;
    if let Some(dir) = &found {
        tracing::info!(path = %dir.display(), "repository detected from marker file");
    }
    reply::<_, std::convert::Infallible>(Ok(DetectPathResponse {
        found: found.is_some(),
        path: found.map(|p| p.to_string_lossy().into_owned()),
    }))
}
