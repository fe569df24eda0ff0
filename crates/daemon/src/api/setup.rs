use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use clickup_orchestrator_core::api::{
    CompleteSetupResponse, SaveApiKeyRequest, SaveApiKeyResponse, SetupStatus,
};
use clickup_orchestrator_core::model::Settings;

use crate::clickup::persist_api_key;
use crate::error::ApiError;
use crate::state::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/setup/status", get(status))
        .route("/setup/api-key", post(save_api_key))
        .route("/setup/complete", post(complete))
}

async fn status(State(st): State<AppState>) -> Result<Json<SetupStatus>, ApiError> {
    let settings = Settings::from_map(st.db.all_settings()?);
    let has_api_key = st.clickup.api_key().is_set();
    let api_key_valid = has_api_key && st.clickup.workspaces().await.is_ok();
    let has_list_selected = settings.list_id().is_some();
    Ok(Json(SetupStatus {
        is_complete: api_key_valid && has_list_selected,
        has_api_key,
        has_list_selected,
        has_repo_configured: settings.target_repo_path().is_some(),
        api_key_valid,
    }))
}

/// Validates the key against ClickUp, persists it to the env file and makes
/// it effective immediately.
async fn save_api_key(State(st): State<AppState>, Json(req): Json<SaveApiKeyRequest>) -> Json<SaveApiKeyResponse> {
    let key = req.api_key.trim();
    let failed = |valid: bool, error: String| {
        Json(SaveApiKeyResponse {
            success: false,
            valid,
            error: Some(error),
        })
    };
    if key.is_empty() {
        return failed(false, "API key cannot be empty".to_string());
    }

    match st.clickup.with_key(key).workspaces().await {
        Ok(teams) if teams.is_empty() => {
            return failed(false, "API key is valid but no workspaces found".to_string())
        }
        Ok(_) => {}
        Err(e) => return failed(false, format!("Invalid API key: {e}")),
    }

    let env_file = st.config.env_file.clone();
    let owned = key.to_string();
    let written = tokio::task::spawn_blocking(move || persist_api_key(&env_file, &owned)).await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return failed(true, format!("Failed to save .env file: {e}")),
        Err(e) => return failed(true, format!("Failed to save .env file: {e}")),
    }

    st.clickup.api_key().set(key);
    tracing::info!(env_file = %st.config.env_file.display(), "ClickUp API key updated");
    st.tasks.wake();
    Json(SaveApiKeyResponse {
        success: true,
        valid: true,
        error: None,
    })
}

async fn complete(State(st): State<AppState>) -> Result<Json<CompleteSetupResponse>, ApiError> {
    let settings = Settings::from_map(st.db.all_settings()?);
    if !st.clickup.api_key().is_set() || settings.list_id().is_none() {
        return Ok(Json(CompleteSetupResponse {
            success: false,
            error: Some("Setup is not complete. Please configure API key and select a list.".to_string()),
        }));
    }
    Ok(Json(CompleteSetupResponse {
        success: true,
        error: None,
    }))
}
