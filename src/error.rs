use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Sandbox refused execution: {0}")]
    SandboxViolation(String),

    #[error("Evaluator unavailable: {0}")]
    EvaluatorUnavailable(String),

    #[error("KV adapter error: {0}")]
    Kv(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::SandboxViolation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::EvaluatorUnavailable(msg) => {
                tracing::warn!("Evaluator unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Evaluator unavailable".to_string())
            }
            AppError::Kv(msg) => {
                tracing::error!("KV adapter error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage adapter error".to_string())
            }
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Configuration error: {}", msg)),
        };

        let body = Json(json!({
            "success": false,
            "error": error_message,
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
