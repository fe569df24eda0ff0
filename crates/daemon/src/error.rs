use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use clickup_orchestrator_core::api::ErrorResponse;
use clickup_orchestrator_core::validation::{BranchNameError, TransitionError};
use thiserror::Error;

use crate::clickup::ClickUpError;
use crate::supervisor::SupervisorError;
use crate::worktree::GitError;

/// Caller-facing error; the message is displayed verbatim by the dashboard.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ExternalService(String),
    #[error("{0}")]
    Process(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }
    pub fn not_found(msg: &str) -> Self {
        Self::NotFound(msg.to_string())
    }
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            ApiError::Process(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let code = self.status();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (code, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(format!("{e:#}"))
    }
}

impl From<TransitionError> for ApiError {
    fn from(e: TransitionError) -> Self {
        Self::Conflict(e.to_string())
    }
}

impl From<BranchNameError> for ApiError {
    fn from(e: BranchNameError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::AlreadyRunning(_) => Self::Conflict(e.to_string()),
            SupervisorError::NotRunning(_) => Self::Conflict(e.to_string()),
            SupervisorError::WorkingDirMissing(_) => Self::Validation(e.to_string()),
            SupervisorError::AgentNotFound(_)
            | SupervisorError::Spawn(_)
            | SupervisorError::Stdin(_) => Self::Process(e.to_string()),
            SupervisorError::Closed => Self::Internal(e.to_string()),
        }
    }
}

impl From<GitError> for ApiError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::Io(_) => Self::Internal(e.to_string()),
            _ => Self::Validation(e.to_string()),
        }
    }
}

impl From<ClickUpError> for ApiError {
    fn from(e: ClickUpError) -> Self {
        Self::ExternalService(e.to_string())
    }
}
