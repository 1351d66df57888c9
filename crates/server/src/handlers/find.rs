//! Batch (JSON) find aggregation and the find route handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::header::{ACCEPT, HOST};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::accept::{MEDIA_TYPE_JSON, get_accepts};
use crate::backend::{Backend, BackendKind, RequestClass};
use crate::error::{ApiError, ApiResult};
use crate::handlers::find_stream::do_find_ndjson;
use crate::metrics::{FIND_BACKENDS, FIND_LATENCY, FIND_LOAD, FIND_RESPONSE, yesno};
use crate::scatter::{ScatterGather, WorkerError};
use crate::state::AppState;
use polestar_core::{ContentKey, FindResponse, transport};

pub(crate) const FIND_METHOD_ORIG: &str = "http-v0";
pub(crate) const FIND_METHOD_REFRAME: &str = "reframe-v1";
pub(crate) const FIND_METHOD_DELEGATED: &str = "delegated-v1";

/// GET /cid/{cid} - find by content identifier.
pub async fn find_cid(
    state: State<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    path: Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    find_cid_inner(state, method, uri, headers, path, body, false).await
}

/// GET /encrypted/cid/{cid} - double-hashed find by content identifier.
pub async fn find_cid_encrypted(
    state: State<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    path: Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    find_cid_inner(state, method, uri, headers, path, body, true).await
}

async fn find_cid_inner(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(cid): Path<String>,
    body: Bytes,
    encrypted: bool,
) -> ApiResult<Response> {
    if method == Method::OPTIONS {
        Ok(ipni_options(&state, false))
    } else if method == Method::GET {
        let key = ContentKey::parse_cid(&cid)
            .map_err(|e| ApiError::BadRequest(format!("invalid cid: {e}")))?;
        find(state, method, uri, headers, body, Some(key), encrypted).await
    } else {
        Err(ApiError::MethodNotAllowed {
            allow: "GET, OPTIONS",
        })
    }
}

/// GET /multihash/{mh} - find by multihash.
pub async fn find_multihash(
    state: State<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    path: Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    find_multihash_inner(state, method, uri, headers, path, body, false).await
}

/// GET /encrypted/multihash/{mh} - double-hashed find by multihash.
pub async fn find_multihash_encrypted(
    state: State<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    path: Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    find_multihash_inner(state, method, uri, headers, path, body, true).await
}

async fn find_multihash_inner(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(mh): Path<String>,
    body: Bytes,
    encrypted: bool,
) -> ApiResult<Response> {
    if method == Method::OPTIONS {
        Ok(ipni_options(&state, false))
    } else if method == Method::GET {
        let key = ContentKey::parse_b58(&mh)
            .map_err(|e| ApiError::BadRequest(format!("invalid multihash: {e}")))?;
        find(state, method, uri, headers, body, Some(key), encrypted).await
    } else {
        Err(ApiError::MethodNotAllowed {
            allow: "GET, OPTIONS",
        })
    }
}

/// POST /multihash - batch find. The body is forwarded to backends
/// verbatim; only the non-streaming JSON shape is supported.
pub async fn find_multihash_batch(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if method == Method::OPTIONS {
        Ok(ipni_options(&state, true))
    } else if method == Method::POST {
        find(state, method, uri, headers, body, None, false).await
    } else {
        Err(ApiError::MethodNotAllowed {
            allow: "POST, OPTIONS",
        })
    }
}

/// GET /metadata/{vk} - double-hashed metadata lookup. Value keys are
/// globally unique, so the first 200 from any dh backend is the answer
/// and no aggregation happens.
pub async fn find_metadata(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(vk): Path<String>,
) -> ApiResult<Response> {
    if method == Method::OPTIONS {
        return Ok(ipni_options(&state, false));
    }
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed {
            allow: "GET, OPTIONS",
        });
    }
    if vk.is_empty() {
        return Err(ApiError::BadRequest("empty value key".to_string()));
    }

    let host = request_host(&headers);
    let targets = eligible_targets(&state, RequestClass::FindMetadata, &uri);
    let cancel = CancellationToken::new();
    let _teardown = cancel.clone().drop_guard();

    let mut sg: ScatterGather<Arc<Backend>, Vec<u8>> =
        ScatterGather::new(targets, state.config.server.result_max_wait);
    let http = state.http.clone();
    let max_wait = state.config.server.result_max_wait;
    let path_and_query = path_and_query(&uri);
    sg.scatter(&cancel, move |backend| {
        let http = http.clone();
        let host = host.clone();
        let path_and_query = path_and_query.clone();
        async move {
            let endpoint = backend_endpoint(&backend, &path_and_query)?;
            let resp = http
                .get(endpoint)
                .timeout(max_wait)
                .header("X-Forwarded-Host", host)
                .header(ACCEPT, MEDIA_TYPE_JSON)
                .send()
                .await
                .map_err(|e| WorkerError::Fault(e.to_string()))?;
            let status = resp.status();
            let data = resp
                .bytes()
                .await
                .map_err(|e| WorkerError::Fault(e.to_string()))?;
            match status {
                reqwest::StatusCode::OK => Ok(Some(data.to_vec())),
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
    while let Some(body) = rx.recv().await {
        if !body.is_empty() {
            return Ok((
                StatusCode::OK,
                [("content-type", "application/json; charset=utf-8")],
                body,
            )
                .into_response());
        }
    }
    Err(ApiError::NotFound)
}

/// Accept-negotiated dispatch between the JSON and NDJSON aggregators.
async fn find(
    state: AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    key: Option<ContentKey>,
    encrypted_route: bool,
) -> ApiResult<Response> {
    let accepts = get_accepts(&headers)
        .map_err(|e| ApiError::BadRequest(format!("invalid Accept header: {e}")))?;
    let host = request_host(&headers);
    let dh = encrypted_route || key.map(|k| k.is_double_hashed()).unwrap_or(false);

    if method == Method::POST {
        // Only non-streaming JSON is supported for batch requests.
        if accepts.header_found && !accepts.json && !accepts.any {
            return Err(ApiError::BadRequest("unsupported media type".to_string()));
        }
        let resp = do_find(&state, method, FIND_METHOD_ORIG, &uri, &host, body, dh).await?;
        return Ok(Json(resp).into_response());
    }

    if accepts.ndjson {
        do_find_ndjson(&state, FIND_METHOD_ORIG, &uri, &host, false, key, dh).await
    } else if accepts.json || accepts.any || !accepts.header_found {
        if state.translate_non_streaming {
            return do_find_ndjson(&state, FIND_METHOD_ORIG, &uri, &host, true, key, dh).await;
        }
        // A request with no Accept header at all is forgiven and gets JSON.
        let resp = do_find(&state, method, FIND_METHOD_ORIG, &uri, &host, body, dh).await?;
        Ok(Json(resp).into_response())
    } else {
        // An explicit media type we do not speak.
        Err(ApiError::BadRequest("unsupported media type".to_string()))
    }
}

/// Scatter a find to every eligible backend and merge the answers into a
/// single response.
pub(crate) async fn do_find(
    state: &AppState,
    method: Method,
    source: &'static str,
    uri: &Uri,
    host: &str,
    body: Bytes,
    dh: bool,
) -> ApiResult<FindResponse> {
    let start = Instant::now();
    FIND_LOAD.with_label_values(&[source]).inc();
    // A GET carries exactly one key, so backends must agree on the
    // multihash of every entry; batch responses merge per key instead.
    let single_key = method == Method::GET;
    let latency_method = method.as_str().to_string();

    let class = if dh {
        RequestClass::DhFind
    } else {
        RequestClass::PlainFind
    };
    let targets = eligible_targets(state, class, uri);

    let cancel = CancellationToken::new();
    let _teardown = cancel.clone().drop_guard();

    let reached = Arc::new(AtomicU32::new(0));
    let failed = Arc::new(AtomicU32::new(0));

    let mut sg: ScatterGather<Arc<Backend>, (FindResponse, BackendKind)> =
        ScatterGather::new(targets, state.config.server.result_max_wait);
    {
        let http = state.http.clone();
        let host = host.to_string();
        let path_and_query = path_and_query(uri);
        let max_wait = state.config.server.result_max_wait;
        let reached = reached.clone();
        let failed = failed.clone();
        sg.scatter(&cancel, move |backend| {
            let http = http.clone();
            let method = method.clone();
            let host = host.clone();
            let body = body.clone();
            let path_and_query = path_and_query.clone();
            let reached = reached.clone();
            let failed = failed.clone();
            async move {
                let endpoint = backend_endpoint(&backend, &path_and_query)?;
                let mut req = http
                    .request(method, endpoint)
                    .timeout(max_wait)
                    .header("X-Forwarded-Host", host)
                    .header(ACCEPT, MEDIA_TYPE_JSON);
                if !body.is_empty() {
                    req = req.body(body);
                }
                let resp = req.send().await.map_err(|e| {
                    failed.fetch_add(1, Ordering::Relaxed);
                    WorkerError::Fault(e.to_string())
                })?;
                let status = resp.status();
                let data = resp.bytes().await.map_err(|e| {
                    failed.fetch_add(1, Ordering::Relaxed);
                    WorkerError::Fault(e.to_string())
                })?;
                match status {
                    reqwest::StatusCode::OK => {
                        reached.fetch_add(1, Ordering::Relaxed);
                        let parsed: FindResponse = serde_json::from_slice(&data)
                            .map_err(|e| WorkerError::Benign(e.to_string()))?;
                        Ok(Some((parsed, backend.kind())))
                    }
                    reqwest::StatusCode::NOT_FOUND => {
                        reached.fetch_add(1, Ordering::Relaxed);
                        Ok(None)
                    }
                    s if s.is_server_error() => Err(WorkerError::Fault(format!(
                        "status {s} response from backend"
                    ))),
                    s => Err(WorkerError::Benign(format!(
                        "status {s} response from backend"
                    ))),
                }
            }
        });
    }

    let mut merged = FindResponse::default();
    let mut found_caskade = false;
    let mut found_regular = false;

    let mut rx = sg.gather();
    while let Some((resp, kind)) = rx.recv().await {
        let accepted = merge_response(&mut merged, resp, single_key)?;
        if accepted {
            found_caskade |= kind == BackendKind::Cascade;
            found_regular |= kind != BackendKind::Cascade;
        }
    }

    FIND_BACKENDS.set(f64::from(reached.load(Ordering::Relaxed)));

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    if merged.is_empty() {
        FIND_LATENCY
            .with_label_values(&[latency_method.as_str(), "no", "no", "no"])
            .observe(elapsed_ms);
        if reached.load(Ordering::Relaxed) == 0 && failed.load(Ordering::Relaxed) > 0 {
            return Err(ApiError::UpstreamUnreachable);
        }
        return Err(ApiError::NotFound);
    }

    FIND_LATENCY
        .with_label_values(&[
            latency_method.as_str(),
            "yes",
            yesno(found_caskade),
            yesno(found_regular),
        ])
        .observe(elapsed_ms);
    observe_find_response(state, source, &merged);
    Ok(merged)
}

/// Fold one backend response into the accumulator. Returns whether any
/// new result landed, or an error on a multihash conflict.
fn merge_response(
    merged: &mut FindResponse,
    resp: FindResponse,
    single_key: bool,
) -> ApiResult<bool> {
    let mut accepted = false;
    for mhr in resp.multihash_results {
        match merged
            .multihash_results
            .iter_mut()
            .find(|e| e.multihash == mhr.multihash)
        {
            None => {
                if single_key && !merged.multihash_results.is_empty() {
                    tracing::warn!("conflicting multihash results from backends");
                    return Err(ApiError::UpstreamConflict);
                }
                if !mhr.provider_results.is_empty() {
                    accepted = true;
                }
                merged.multihash_results.push(mhr);
            }
            Some(entry) => {
                for pr in mhr.provider_results {
                    if !entry.provider_results.iter().any(|e| e.same_identity(&pr)) {
                        accepted = true;
                        entry.provider_results.push(pr);
                    }
                }
            }
        }
    }

    for emr in resp.encrypted_multihash_results {
        match merged
            .encrypted_multihash_results
            .iter_mut()
            .find(|e| e.multihash == emr.multihash)
        {
            None => {
                if single_key && !merged.encrypted_multihash_results.is_empty() {
                    tracing::warn!("conflicting encrypted multihash results from backends");
                    return Err(ApiError::UpstreamConflict);
                }
                if !emr.encrypted_value_keys.is_empty() {
                    accepted = true;
                }
                merged.encrypted_multihash_results.push(emr);
            }
            Some(entry) => {
                accepted |= !emr.encrypted_value_keys.is_empty();
                entry
                    .encrypted_value_keys
                    .extend(emr.encrypted_value_keys);
            }
        }
    }
    Ok(accepted)
}

/// Per-transport response metrics and provider-frequency accounting for
/// a merged response.
fn observe_find_response(state: &AppState, source: &'static str, resp: &FindResponse) {
    for mhr in &resp.multihash_results {
        for pr in &mhr.provider_results {
            let transport_name = transport::primary_transport(&pr.metadata)
                .map(transport::protocol_name)
                .unwrap_or("unknown");
            FIND_RESPONSE
                .with_label_values(&[source, transport_name])
                .inc();
            state.provider_counts.add(&pr.provider.id);
        }
    }
    let encrypted: usize = resp
        .encrypted_multihash_results
        .iter()
        .map(|e| e.encrypted_value_keys.len())
        .sum();
    if encrypted > 0 {
        FIND_RESPONSE
            .with_label_values(&[source, "encrypted"])
            .inc_by(encrypted as u64);
    }
}

/// OPTIONS responses advertise CORS and, when cascade labels are
/// configured, the opt-in cascade header.
pub(crate) fn ipni_options(state: &AppState, post: bool) -> Response {
    let methods = if post {
        "GET, POST, OPTIONS"
    } else {
        "GET, OPTIONS"
    };
    let mut builder = Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", methods)
        .header("Access-Control-Allow-Headers", "Content-Type, Accept");
    if !state.config.server.cascade_labels.is_empty() {
        builder = builder.header(
            "X-IPNI-Allow-Cascade",
            state.config.server.cascade_labels.as_str(),
        );
    }
    builder
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::ACCEPTED.into_response())
}

pub(crate) fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Rewrite the inbound path and query onto a backend's origin.
pub(crate) fn backend_endpoint(
    backend: &Backend,
    path_and_query: &str,
) -> Result<Url, WorkerError> {
    backend
        .url()
        .join(path_and_query)
        .map_err(|e| WorkerError::Benign(format!("cannot build backend endpoint: {e}")))
}

/// The backends a request class fans out to, matcher applied.
pub(crate) fn eligible_targets(
    state: &AppState,
    class: RequestClass,
    uri: &Uri,
) -> Vec<(Arc<Backend>, Option<Arc<crate::breaker::CircuitBreaker>>)> {
    // The matcher only inspects the query string, so any authority works
    // for the synthesized URL.
    let inbound = Url::parse(&format!("http://gateway{}", path_and_query(uri))).ok();
    state
        .backends()
        .iter()
        .filter(|b| b.serves(class))
        .filter(|b| inbound.as_ref().map(|u| b.matches(u)).unwrap_or(true))
        .map(|b| (b.clone(), Some(b.breaker())))
        .collect()
}
