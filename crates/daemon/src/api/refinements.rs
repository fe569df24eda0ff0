use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clickup_orchestrator_core::api::{
    ChatRequest, ChatResponse, CreateSessionRequest, ErrorResponse, ProxyQuery, QueueStatus,
    SessionResponse, SuccessResponse,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;

use crate::error::ApiError;
use crate::state::AppState;

/// Injected into proxied pages; lets the user pick an element and posts its
/// metadata to the parent frame.
const HIGHLIGHT_SCRIPT: &str = include_str!("../../assets/highlight.js");

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/ui-refinements/session", post(create_session))
        .route("/ui-refinements/session/{session_id}", delete(delete_session))
        .route("/ui-refinements/chat", post(chat))
        .route("/ui-refinements/queue/{session_id}", get(queue))
        .route("/ui-refinements/queue/{session_id}/{message_id}", delete(cancel))
        .route("/ui-refinements/proxy", get(proxy))
}

async fn create_session(
    State(st): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let branch = req.branch_name.trim();
    if branch.is_empty() {
        return Err(ApiError::validation("branch_name is required"));
    }
    Ok(Json(st.sessions.create(branch.to_string(), req.worktree_path)))
}

async fn delete_session(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    st.sessions.delete(&session_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn chat(State(st): State<AppState>, Json(req): Json<ChatRequest>) -> Result<Json<ChatResponse>, ApiError> {
    Ok(Json(st.sessions.chat(req).await?))
}

async fn queue(State(st): State<AppState>, Path(session_id): Path<String>) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(st.sessions.queue_status(&session_id)?))
}

async fn cancel(
    State(st): State<AppState>,
    Path((session_id, message_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let removed = st.sessions.cancel(&session_id, &message_id)?;
    Ok(Json(SuccessResponse { success: removed }))
}

async fn proxy(State(st): State<AppState>, Query(q): Query<ProxyQuery>) -> Response {
    match fetch_page(&st.http, &q.url).await {
        Ok(html) => Html(inject_highlight(&html)).into_response(),
        Err(error) => Json(ErrorResponse::new(error)).into_response(),
    }
}

async fn fetch_page(http: &reqwest::Client, url: &str) -> Result<String, String> {
    let url = Url::parse(url).map_err(|e| format!("Invalid URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err("Only http and https URLs can be proxied".to_string());
    }
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| format!("Failed to fetch URL: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("Failed to fetch URL: {}", response.status()));
    }
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(true, |ct| ct.contains("text/html"));
    if !is_html {
        return Err("URL does not return HTML content".to_string());
    }
    response
        .text()
        .await
        .map_err(|e| format!("Failed to read response: {e}"))
}

/// Adds the picker script before the last `</body>`, or at the end.
fn inject_highlight(html: &str) -> String {
    let script = format!("<script>\n{HIGHLIGHT_SCRIPT}</script>\n");
    match html.rfind("</body>") {
        Some(at) => format!("{}{script}{}", &html[..at], &html[at..]),
        None => format!("{html}{script}"),
    }
}

#[cfg(test)]
mod tests {
    use super::inject_highlight;

    #[test]
    fn script_lands_before_closing_body() {
        let out = inject_highlight("<html><body><p>x</p></body></html>");
        let script_at = out.find("<script>").unwrap();
        assert!(script_at > out.find("<p>x</p>").unwrap());
        assert!(script_at < out.find("</body>").unwrap());
        assert!(out.ends_with("</body></html>"));

        assert!(inject_highlight("<p>bare</p>").starts_with("<p>bare</p><script>"));
    }
}
