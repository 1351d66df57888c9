//! API error types.

use axum::http::StatusCode;
use axum::http::header::ALLOW;
use axum::response::{IntoResponse, Response};

/// API error type. Bodies stay empty apart from bad-request detail; the
/// status code carries the meaning.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed { allow: &'static str },

    #[error("not supported")]
    NotSupported,

    #[error("conflicting results from backends")]
    UpstreamConflict,

    #[error("all backends unreachable")]
    UpstreamUnreachable,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] polestar_core::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Core(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotSupported => StatusCode::NOT_IMPLEMENTED,
            Self::UpstreamConflict | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamUnreachable => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::MethodNotAllowed { allow } => {
                (status, [(ALLOW, allow)], String::new()).into_response()
            }
            Self::BadRequest(msg) => (status, msg).into_response(),
            Self::Core(err) => (status, err.to_string()).into_response(),
            _ => status.into_response(),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
