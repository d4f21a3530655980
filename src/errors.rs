use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Control-plane errors surfaced by the Process Supervisor, distinct from the
/// runtime error kinds classified by [`crate::classifier`] (those live in the
/// Error Journal, not the HTTP error path).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("channel is already running")]
    AlreadyRunning,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("channel not found")]
    NotFound,
    #[error("ffmpeg process failed to start: {0}")]
    SpawnFailed(String),
}

/// Single error type for the HTTP boundary. Serializes to the `{code,
/// message, data?}` envelope every handler uses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Supervisor(SupervisorError::AlreadyRunning) => StatusCode::CONFLICT,
            ApiError::Supervisor(SupervisorError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            ApiError::Supervisor(SupervisorError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Supervisor(SupervisorError::SpawnFailed(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(%status, error = %self, "request failed");
        (
            status,
            Json(json!({
                "code": status.as_u16(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Success half of the `{code, message, data?}` envelope `ApiError` already
/// implements for failures. Every handler wraps its payload in this instead
/// of returning a bare `Json<T>`, matching the original's `routes.py`
/// convention of shaping every response the same way regardless of outcome.
pub struct ApiOk<T> {
    status: StatusCode,
    message: &'static str,
    data: T,
}

impl<T> ApiOk<T> {
    pub fn new(message: &'static str, data: T) -> Self {
        Self {
            status: StatusCode::OK,
            message,
            data,
        }
    }

    pub fn with_status(status: StatusCode, message: &'static str, data: T) -> Self {
        Self { status, message, data }
    }
}

impl<T: serde::Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "code": self.status.as_u16(),
                "message": self.message,
                "data": self.data,
            })),
        )
            .into_response()
    }
}
