//! Route configuration.

use axum::Router;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::any;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::delegated::delegated_router;
use crate::handlers;
use crate::reframe;
use crate::state::AppState;

/// Create the public finder router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_request_body_size;

    // Handlers dispatch on method themselves so that 405 responses can
    // carry an Allow header and OPTIONS can answer with route-specific
    // CORS metadata.
    Router::new()
        .route("/cid/{cid}", any(handlers::find::find_cid))
        .route("/encrypted/cid/{cid}", any(handlers::find::find_cid_encrypted))
        .route("/multihash", any(handlers::find::find_multihash_batch))
        .route("/multihash/{mh}", any(handlers::find::find_multihash))
        .route(
            "/encrypted/multihash/{mh}",
            any(handlers::find::find_multihash_encrypted),
        )
        .route("/metadata/{vk}", any(handlers::find::find_metadata))
        .route("/providers", any(handlers::providers::providers_list))
        .route("/providers/{pid}", any(handlers::providers::providers_get))
        .route("/reframe", any(reframe::reframe))
        .route("/reframe/ipns", any(reframe::not_supported))
        .route("/reframe/provide", any(reframe::not_supported))
        // The delegated adapter keeps its own nested mux; the prefix is
        // stripped before it sees the path.
        .nest("/routing/v1", delegated_router())
        .route("/health", any(handlers::health))
        .route("/", any(handlers::landing))
        .route("/index.html", any(handlers::landing))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn(allow_any_origin))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Every public response carries the permissive CORS origin.
async fn allow_any_origin(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .entry("Access-Control-Allow-Origin")
        .or_insert(HeaderValue::from_static("*"));
    response
}

/// The router served on the metrics listener.
pub fn metrics_router() -> Router {
    Router::new().route(
        "/metrics",
        axum::routing::get(crate::metrics::metrics_handler),
    )
}
