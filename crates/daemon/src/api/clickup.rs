use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use super::reply;
use crate::state::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/clickup/workspaces", get(workspaces))
        .route("/clickup/workspaces/{team_id}/spaces", get(spaces))
        .route("/clickup/spaces/{space_id}/folders", get(folders))
        .route("/clickup/folders/{folder_id}/lists", get(folder_lists))
        .route("/clickup/spaces/{space_id}/lists", get(folderless_lists))
        .route("/clickup/lists/{list_id}/statuses", get(statuses))
}

async fn workspaces(State(st): State<AppState>) -> Response {
    reply(st.clickup.workspaces().await)
}

async fn spaces(State(st): State<AppState>, Path(team_id): Path<String>) -> Response {
    reply(st.clickup.spaces(&team_id).await)
}

async fn folders(State(st): State<AppState>, Path(space_id): Path<String>) -> Response {
    reply(st.clickup.folders(&space_id).await)
}

async fn folder_lists(State(st): State<AppState>, Path(folder_id): Path<String>) -> Response {
    reply(st.clickup.folder_lists(&folder_id).await)
}

async fn folderless_lists(State(st): State<AppState>, Path(space_id): Path<String>) -> Response {
    reply(st.clickup.folderless_lists(&space_id).await)
}

async fn statuses(State(st): State<AppState>, Path(list_id): Path<String>) -> Response {
    reply(st.clickup.list_statuses(&list_id).await)
}
