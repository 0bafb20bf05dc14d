//! Error types for the download orchestrator and its API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Errors surfaced by the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Bad artifact id, URL or filename; rejected before any I/O
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("download already in progress: {0}")]
    AlreadyInProgress(String),

    /// Network or process failure for a single candidate
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("no progress for {0} seconds")]
    Stalled(u64),

    #[error("all methods failed")]
    AllSourcesExhausted,

    #[error("download cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for orchestrator operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Machine-readable code for errors that terminate an event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    AlreadyInProgress,
    AllSourcesExhausted,
    Internal,
}

impl DownloadError {
    /// Code reported to the caller in a terminal `Error` event
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyInProgress(_) => ErrorCode::AlreadyInProgress,
            Self::AllSourcesExhausted => ErrorCode::AllSourcesExhausted,
            _ => ErrorCode::Internal,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyInProgress(_) => StatusCode::CONFLICT,
            Self::SourceUnreachable(_) | Self::Stalled(_) | Self::AllSourcesExhausted => {
                StatusCode::BAD_GATEWAY
            }
            Self::Cancelled | Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
