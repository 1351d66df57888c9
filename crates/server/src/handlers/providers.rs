//! Provider listing endpoints, answered from the provider cache.
//!
//! These never scatter: the cache refreshes in the background from the
//! providers-only backends and requests read the latest snapshot.

use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::{IntoResponse, Json, Response};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /providers - every known provider. Never 404: an empty federation
/// is an empty JSON array.
pub async fn providers_list(State(state): State<AppState>, method: Method) -> ApiResult<Response> {
    require_get(&method)?;
    Ok(Json(state.provider_cache.list()).into_response())
}

/// GET /providers/{pid} - the most recent state of a single provider.
pub async fn providers_get(
    State(state): State<AppState>,
    method: Method,
    Path(pid): Path<String>,
) -> ApiResult<Response> {
    require_get(&method)?;
    if pid.is_empty() {
        return Err(ApiError::BadRequest("empty provider id".to_string()));
    }
    match state.provider_cache.get(&pid) {
        Some(info) => Ok(Json(info).into_response()),
        None => Err(ApiError::NotFound),
    }
}

fn require_get(method: &Method) -> ApiResult<()> {
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed { allow: "GET" });
    }
    Ok(())
}
