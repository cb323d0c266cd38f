use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::directory::DirectoryError;
use crate::engine::EngineError;
use crate::monitor::MonitorError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;
use crate::submission::SubmissionError;
use crate::vault::VaultError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A stored third-party grant is gone; the user must connect it again.
    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            AppError::ReauthRequired(msg) => (StatusCode::UNAUTHORIZED, "REAUTH_REQUIRED", msg.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        AppError::Unauthorized(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => AppError::NotFound(e.to_string()),
            StoreError::InvalidTransition { .. } | StoreError::Duplicate { .. } => {
                AppError::Validation(e.to_string())
            }
            StoreError::Database(e) => AppError::Database(e),
            StoreError::Invariant(_) | StoreError::Corrupt(_) => AppError::Internal(e.into()),
        }
    }
}

impl From<DirectoryError> for AppError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Database(e) => AppError::Database(e),
            DirectoryError::Corrupt(_) => AppError::Internal(e.into()),
        }
    }
}

impl From<VaultError> for AppError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::AuthUnavailable { .. } => AppError::ReauthRequired(e.to_string()),
            VaultError::NotFound(_) => AppError::NotFound(e.to_string()),
            VaultError::Database(e) => AppError::Database(e),
            VaultError::SecretUnavailable | VaultError::DecryptFailure(_) | VaultError::Crypto(_) => {
                AppError::Internal(e.into())
            }
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::NotOwned { .. } => AppError::Forbidden(e.to_string()),
            SchedulerError::Store(e) => e.into(),
            SchedulerError::Directory(e) => e.into(),
        }
    }
}

impl From<MonitorError> for AppError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::NotMonitorable { .. } => AppError::Validation(e.to_string()),
            MonitorError::Vault(e) => e.into(),
            MonitorError::Store(e) => e.into(),
            MonitorError::Directory(e) => e.into(),
            MonitorError::Http(_) | MonitorError::Api { .. } | MonitorError::Unsupported(_) => {
                AppError::Internal(e.into())
            }
        }
    }
}

impl From<SubmissionError> for AppError {
    fn from(e: SubmissionError) -> Self {
        match e {
            SubmissionError::Store(e) => e.into(),
            SubmissionError::Vault(e) => e.into(),
            SubmissionError::Directory(e) => e.into(),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::PostingNotFound(_) => AppError::NotFound(e.to_string()),
            EngineError::Forbidden(msg) => AppError::Forbidden(msg),
            EngineError::Invalid(msg) => AppError::Validation(msg),
            EngineError::Store(e) => e.into(),
            EngineError::Directory(e) => e.into(),
            EngineError::Scheduler(e) => e.into(),
            EngineError::Monitor(e) => e.into(),
            EngineError::Submission(e) => e.into(),
        }
    }
}
