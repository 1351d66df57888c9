//! HTTP request handlers.

pub mod find;
pub mod find_stream;
pub mod providers;

use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};

use crate::error::{ApiError, ApiResult};

static INDEX_PAGE: &str = include_str!("../../static/index.html");

/// GET /health - liveness probe.
pub async fn health(method: Method) -> ApiResult<Response> {
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed { allow: "GET" });
    }
    Ok("ready".into_response())
}

/// GET / and /index.html - static landing page. Unknown paths are a
/// strict 404 so that routes some backends support and we do not, like
/// `/metadata` without a key, never answer with HTML.
pub async fn landing(method: Method) -> ApiResult<Response> {
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed { allow: "GET" });
    }
    Ok(Html(INDEX_PAGE).into_response())
}

/// Fallback for everything unrouted.
pub async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}
