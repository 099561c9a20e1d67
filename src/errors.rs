use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures raised by the upload/pin pipeline.
///
/// Every variant is recoverable: the worker leaves the asset where it was and
/// the next sweep retries, handlers turn it into an [`AppError`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("remote upload failed: {0}")]
    RemoteUpload(String),
    #[error("remote fetch failed: {0}")]
    RemoteFetch(String),
    #[error("remote transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("usage transaction failed: {0}")]
    Transaction(#[source] sqlx::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::RemoteUpload(_)
            | GatewayError::RemoteFetch(_)
            | GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Io(_)
            | GatewayError::Transaction(_)
            | GatewayError::Sqlx(_)
            | GatewayError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError::new(status, err.to_string())
    }
}
