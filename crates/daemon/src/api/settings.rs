use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use clickup_orchestrator_core::api::{SettingValue, SettingsPayload};
use clickup_orchestrator_core::model::settings::PARALLEL_LIMIT;

use crate::error::ApiError;
use crate::state::AppState;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/settings", get(all).put(update))
        .route("/settings/{key}", get(one))
}

async fn all(State(st): State<AppState>) -> Result<Json<SettingsPayload>, ApiError> {
    Ok(Json(SettingsPayload {
        settings: st.db.all_settings()?,
    }))
}

async fn one(State(st): State<AppState>, Path(key): Path<String>) -> Result<Json<SettingValue>, ApiError> {
    let value = st
        .db
        .get_setting(&key)?
        .ok_or_else(|| ApiError::not_found("Setting not found"))?;
    Ok(Json(SettingValue { key, value }))
}

/// Upserts every provided key in one transaction; unknown keys are stored too.
async fn update(
    State(st): State<AppState>,
    Json(body): Json<SettingsPayload>,
) -> Result<Json<SettingsPayload>, ApiError> {
    if let Some(limit) = body.settings.get(PARALLEL_LIMIT) {
        match limit.trim().parse::<usize>() {
            Ok(n) if n > 0 => {}
            _ => return Err(ApiError::validation("parallel_limit must be a positive integer")),
        }
    }
    st.db.put_settings(&body.settings)?;
    tracing::info!(keys = ?body.settings.keys().collect::<Vec<_>>(), "settings updated");
    st.tasks.wake();
    Ok(Json(SettingsPayload {
        settings: st.db.all_settings()?,
    }))
}
