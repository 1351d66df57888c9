//! Legacy reframe adapter.
//!
//! In translate mode the legacy FindProviders call is reworded as a core
//! find: the response is filtered to Bitswap-capable providers and
//! streamed back as NDJSON result objects. In proxy mode the request is
//! relayed to each backend's own `/reframe` endpoint and the first
//! successful answer wins. IPNS and provide operations are not
//! supported either way.

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::accept::MEDIA_TYPE_NDJSON;
use crate::backend::{Backend, RequestClass};
use crate::error::{ApiError, ApiResult};
use crate::handlers::find::{
    FIND_METHOD_REFRAME, backend_endpoint, do_find, eligible_targets, path_and_query, request_host,
};
use crate::scatter::{ScatterGather, WorkerError};
use crate::state::AppState;
use polestar_core::{AddrInfo, ContentKey, transport};

/// One streamed result of a legacy FindProviders call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindProvidersResult {
    #[serde(rename = "AddrInfo", default, skip_serializing_if = "Vec::is_empty")]
    pub addr_info: Vec<AddrInfo>,
    #[serde(rename = "Err", default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Deserialize)]
pub struct ReframeQuery {
    key: Option<String>,
}

/// /reframe - the legacy find-providers entry point.
pub async fn reframe(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(query): Query<ReframeQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    if !state.translate_reframe {
        return proxy_reframe(&state, method, &uri, &headers, body).await;
    }

    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed { allow: "GET" });
    }
    let key = query
        .key
        .ok_or_else(|| ApiError::BadRequest("missing key query parameter".to_string()))?;
    let key = ContentKey::parse_cid(&key)
        .map_err(|e| ApiError::BadRequest(format!("invalid cid: {e}")))?;

    let find_uri = Uri::try_from(format!("/multihash/{key}"))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let host = request_host(&headers);

    let result = match do_find(
        &state,
        Method::GET,
        FIND_METHOD_REFRAME,
        &find_uri,
        &host,
        Bytes::new(),
        false,
    )
    .await
    {
        Ok(resp) => {
            if resp.multihash_results.len() != 1 {
                FindProvidersResult {
                    err: Some(format!(
                        "unexpected number of multihashes: {}",
                        resp.multihash_results.len()
                    )),
                    ..Default::default()
                }
            } else {
                // Only Bitswap-capable providers are reachable through the
                // legacy protocol; everything else is filtered out.
                let mut seen = HashSet::new();
                let addr_info = resp.multihash_results[0]
                    .provider_results
                    .iter()
                    .filter(|pr| transport::starts_with_bitswap(&pr.metadata))
                    .filter(|pr| seen.insert(pr.provider.id.clone()))
                    .map(|pr| pr.provider.clone())
                    .collect();
                FindProvidersResult {
                    addr_info,
                    ..Default::default()
                }
            }
        }
        // No results closes the stream without emission.
        Err(ApiError::NotFound) => return Ok(ndjson_body(Vec::new())),
        Err(err) => FindProvidersResult {
            err: Some(format!("status {}", err.status_code().as_u16())),
            ..Default::default()
        },
    };

    let mut line = serde_json::to_vec(&result).map_err(|e| ApiError::Internal(e.to_string()))?;
    line.push(b'\n');
    Ok(ndjson_body(line))
}

/// /reframe/ipns and /reframe/provide - mutation operations the gateway
/// never performs.
pub async fn not_supported() -> ApiError {
    ApiError::NotSupported
}

fn ndjson_body(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE.as_str(), MEDIA_TYPE_NDJSON),
            ("X-Content-Type-Options", "nosniff"),
        ],
        body,
    )
        .into_response()
}

/// Relay the raw reframe exchange to every plain backend and return the
/// first successful response.
async fn proxy_reframe(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let host = request_host(headers);
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let targets = eligible_targets(state, RequestClass::PlainFind, uri);

    let cancel = CancellationToken::new();
    let _teardown = cancel.clone().drop_guard();

    let mut sg: ScatterGather<Arc<Backend>, (Vec<u8>, Option<String>)> =
        ScatterGather::new(targets, state.config.server.result_max_wait);
    let http = state.http.clone();
    let max_wait = state.config.server.result_max_wait;
    let path_and_query = path_and_query(uri);
    sg.scatter(&cancel, move |backend| {
        let http = http.clone();
        let method = method.clone();
        let host = host.clone();
        let body = body.clone();
        let content_type = content_type.clone();
        let path_and_query = path_and_query.clone();
        async move {
            let endpoint = backend_endpoint(&backend, &path_and_query)?;
            let mut req = http
                .request(method, endpoint)
                .timeout(max_wait)
                .header("X-Forwarded-Host", host);
            if let Some(ct) = content_type {
                req = req.header(CONTENT_TYPE, ct);
            }
            if !body.is_empty() {
                req = req.body(body);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| WorkerError::Fault(e.to_string()))?;
            let status = resp.status();
            let resp_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let data = resp
                .bytes()
                .await
                .map_err(|e| WorkerError::Fault(e.to_string()))?;
            match status {
                reqwest::StatusCode::OK => Ok(Some((data.to_vec(), resp_type))),
                reqwest::StatusCode::NOT_FOUND => Ok(None),
                s if s.is_server_error() => Err(WorkerError::Fault(format!(
                    "status {s} response from backend"
                ))),
                s => Err(WorkerError::Benign(format!(
                    "status {s} response from backend"
                ))),
            }
        }
    });

    let mut rx = sg.gather();
    if let Some((data, resp_type)) = rx.recv().await {
        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(ct) = resp_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        return builder
            .body(axum::body::Body::from(data))
            .map_err(|e| ApiError::Internal(e.to_string()));
    }
    Err(ApiError::NotFound)
}
