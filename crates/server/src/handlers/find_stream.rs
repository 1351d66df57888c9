//! Streaming (NDJSON) find aggregation.
//!
//! Backends are consumed as NDJSON streams; each newly seen record is
//! flushed to the client as soon as it arrives. The seen-set hashes
//! `providerID || contextID` (or the encrypted value key) with CRC-32:
//! within one request's lifetime the tiny false-negative risk is a fair
//! trade for not retaining every key.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::ACCEPT;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::accept::MEDIA_TYPE_NDJSON;
use crate::backend::{Backend, BackendKind, RequestClass};
use crate::error::{ApiError, ApiResult};
use crate::handlers::find::{backend_endpoint, eligible_targets, path_and_query};
use crate::metrics::{FIND_BACKENDS, FIND_LATENCY, FIND_LOAD, FIND_RESPONSE, yesno};
use crate::scatter::{ScatterGather, WorkerError};
use crate::state::AppState;
use polestar_core::{
    ContentKey, EncryptedMultihashResult, FindRecord, FindResponse, MultihashResult, transport,
};

/// Deduplicated records from every eligible backend, in arrival order.
pub(crate) struct RecordStream {
    pub rx: mpsc::Receiver<(FindRecord, BackendKind)>,
    pub cancel: CancellationToken,
    /// Cancels the workers when the consumer goes away.
    _teardown: DropGuard,
    pub reached: Arc<AtomicU32>,
    pub failed: Arc<AtomicU32>,
}

/// Scatter an NDJSON find and collect every sane record into one channel.
pub(crate) fn scatter_find_records(
    state: &AppState,
    class: RequestClass,
    uri: &Uri,
    host: &str,
    max_wait: Duration,
) -> RecordStream {
    let cancel = CancellationToken::new();
    let teardown = cancel.clone().drop_guard();
    let (records_tx, records_rx) = mpsc::channel(16);
    let reached = Arc::new(AtomicU32::new(0));
    let failed = Arc::new(AtomicU32::new(0));

    let targets = eligible_targets(state, class, uri);
    // The scatter deadline is only a backstop: each worker bounds its own
    // read loop with `max_wait` and keeps whatever arrived in time.
    let mut sg: ScatterGather<Arc<Backend>, ()> =
        ScatterGather::new(targets, max_wait.saturating_mul(2));

    let http = state.http.clone();
    let host = host.to_string();
    let path_and_query = path_and_query(uri);
    {
        let reached = reached.clone();
        let failed = failed.clone();
        sg.scatter(&cancel, move |backend| {
            let http = http.clone();
            let host = host.clone();
            let path_and_query = path_and_query.clone();
            let records_tx = records_tx.clone();
            let reached = reached.clone();
            let failed = failed.clone();
            async move {
                let endpoint = backend_endpoint(&backend, &path_and_query)?;
                let resp = http
                    .get(endpoint)
                    .header("X-Forwarded-Host", host)
                    .header(ACCEPT, MEDIA_TYPE_NDJSON)
                    .send()
                    .await
                    .map_err(|e| {
                        failed.fetch_add(1, Ordering::Relaxed);
                        WorkerError::Fault(e.to_string())
                    })?;
                match resp.status() {
                    reqwest::StatusCode::OK => {}
                    reqwest::StatusCode::NOT_FOUND => {
                        reached.fetch_add(1, Ordering::Relaxed);
                        return Ok(None);
                    }
                    s if s.is_server_error() => {
                        return Err(WorkerError::Fault(format!(
                            "status {s} response from backend"
                        )));
                    }
                    s => {
                        return Err(WorkerError::Benign(format!(
                            "status {s} response from backend"
                        )));
                    }
                }
                reached.fetch_add(1, Ordering::Relaxed);

                let kind = backend.kind();
                let read_lines = async {
                    let body = resp.bytes_stream().map_err(std::io::Error::other);
                    let mut lines =
                        FramedRead::new(StreamReader::new(body), LinesCodec::new());
                    while let Some(next) = lines.next().await {
                        let line = next.map_err(|e| WorkerError::Benign(e.to_string()))?;
                        if line.is_empty() {
                            continue;
                        }
                        let record: FindRecord = serde_json::from_str(&line)
                            .map_err(|e| WorkerError::Benign(e.to_string()))?;
                        // Backends do not always respect the accept media
                        // type; drop records that cannot be acted upon.
                        if !record.is_encrypted()
                            && (record.result.provider.id.is_empty()
                                || record.result.provider.addrs.is_empty())
                        {
                            continue;
                        }
                        if records_tx.send((record, kind)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(())
                };
                match tokio::time::timeout(max_wait, read_lines).await {
                    Ok(Ok(())) => Ok(None),
                    Ok(Err(err)) => Err(err),
                    // Stream deadline: keep the records already relayed.
                    Err(_) => Ok(None),
                }
            }
        });
    }
    // Workers emit nothing through the scatter channel itself; records
    // travel on their own channel which closes when every worker is done.
    drop(sg.gather());

    RecordStream {
        rx: records_rx,
        cancel,
        _teardown: teardown,
        reached,
        failed,
    }
}

struct SeenSet(HashSet<u32>);

impl SeenSet {
    fn new() -> Self {
        Self(HashSet::new())
    }

    /// True when the record was not seen before.
    fn insert(&mut self, record: &FindRecord) -> bool {
        self.0.insert(crc32fast::hash(&record.dedup_bytes()))
    }
}

/// Scatter an NDJSON find and either stream deduplicated records to the
/// client, or (`translate`) re-assemble them into one JSON envelope.
pub(crate) async fn do_find_ndjson(
    state: &AppState,
    source: &'static str,
    uri: &Uri,
    host: &str,
    translate: bool,
    key: Option<ContentKey>,
    dh: bool,
) -> ApiResult<Response> {
    let start = Instant::now();
    FIND_LOAD.with_label_values(&[source]).inc();
    let max_wait = if translate {
        state.config.server.result_max_wait
    } else {
        state.config.server.result_stream_max_wait
    };
    let class = if dh {
        RequestClass::DhFind
    } else {
        RequestClass::PlainFind
    };
    let mut rs = scatter_find_records(state, class, uri, host, max_wait);

    if translate {
        return translate_to_json(state, source, start, key, rs).await;
    }

    let mut seen = SeenSet::new();
    // Hold the response until the first unique record: a stream that
    // never produces one is a 404, not an empty 200.
    let first = loop {
        match rs.rx.recv().await {
            None => {
                observe_not_found(start, &rs);
                return Err(empty_result_error(&rs));
            }
            Some((record, kind)) => {
                if seen.insert(&record) {
                    break (record, kind);
                }
            }
        }
    };

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
    let task_state = state.clone();
    tokio::spawn(async move {
        let mut found_caskade = false;
        let mut found_regular = false;
        let mut emit = |record: &FindRecord, kind: BackendKind| {
            observe_record(&task_state, source, record);
            found_caskade |= kind == BackendKind::Cascade;
            found_regular |= kind != BackendKind::Cascade;
        };

        emit(&first.0, first.1);
        if send_line(&body_tx, &first.0).await {
            while let Some((record, kind)) = rs.rx.recv().await {
                if !seen.insert(&record) {
                    continue;
                }
                emit(&record, kind);
                if !send_line(&body_tx, &record).await {
                    // Client went away: tear the workers down.
                    rs.cancel.cancel();
                    break;
                }
            }
        } else {
            rs.cancel.cancel();
        }

        FIND_BACKENDS.set(f64::from(rs.reached.load(Ordering::Relaxed)));
        FIND_LATENCY
            .with_label_values(&[
                Method::GET.as_str(),
                "yes",
                yesno(found_caskade),
                yesno(found_regular),
            ])
            .observe(start.elapsed().as_secs_f64() * 1000.0);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", MEDIA_TYPE_NDJSON)
        .header("Connection", "Keep-Alive")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Consume the NDJSON upstreams but answer with a single JSON envelope.
async fn translate_to_json(
    state: &AppState,
    source: &'static str,
    start: Instant,
    key: Option<ContentKey>,
    mut rs: RecordStream,
) -> ApiResult<Response> {
    let mut seen = SeenSet::new();
    let mut found_caskade = false;
    let mut found_regular = false;
    let mut provider_results = Vec::new();
    let mut encrypted_value_keys = Vec::new();

    while let Some((record, kind)) = rs.rx.recv().await {
        if !seen.insert(&record) {
            continue;
        }
        observe_record(state, source, &record);
        found_caskade |= kind == BackendKind::Cascade;
        found_regular |= kind != BackendKind::Cascade;
        if record.is_encrypted() {
            encrypted_value_keys.push(record.encrypted_value_key);
        } else {
            provider_results.push(record.result);
        }
    }

    if provider_results.is_empty() && encrypted_value_keys.is_empty() {
        observe_not_found(start, &rs);
        return Err(empty_result_error(&rs));
    }
    FIND_BACKENDS.set(f64::from(rs.reached.load(Ordering::Relaxed)));

    FIND_LATENCY
        .with_label_values(&[
            Method::GET.as_str(),
            "yes",
            yesno(found_caskade),
            yesno(found_regular),
        ])
        .observe(start.elapsed().as_secs_f64() * 1000.0);

    let multihash = key.map(|k| k.to_bytes()).unwrap_or_default();
    let mut resp = FindResponse::default();
    if !provider_results.is_empty() {
        resp.multihash_results = vec![MultihashResult {
            multihash: multihash.clone(),
            provider_results,
        }];
    }
    if !encrypted_value_keys.is_empty() {
        resp.encrypted_multihash_results = vec![EncryptedMultihashResult {
            multihash,
            encrypted_value_keys,
        }];
    }
    Ok(Json(resp).into_response())
}

/// One NDJSON line down to the client; false when it has gone away.
async fn send_line(tx: &mpsc::Sender<Result<Bytes, Infallible>>, record: &FindRecord) -> bool {
    let mut line = match serde_json::to_vec(record) {
        Ok(line) => line,
        Err(err) => {
            tracing::error!(%err, "failed to encode streaming result");
            return true;
        }
    };
    line.push(b'\n');
    tx.send(Ok(Bytes::from(line))).await.is_ok()
}

fn observe_record(state: &AppState, source: &'static str, record: &FindRecord) {
    if record.is_encrypted() {
        FIND_RESPONSE
            .with_label_values(&[source, "encrypted"])
            .inc();
    } else {
        let transport_name = transport::primary_transport(&record.result.metadata)
            .map(transport::protocol_name)
            .unwrap_or("unknown");
        FIND_RESPONSE
            .with_label_values(&[source, transport_name])
            .inc();
        state.provider_counts.add(&record.result.provider.id);
    }
}

fn observe_not_found(start: Instant, rs: &RecordStream) {
    FIND_BACKENDS.set(f64::from(rs.reached.load(Ordering::Relaxed)));
    FIND_LATENCY
        .with_label_values(&[Method::GET.as_str(), "no", "no", "no"])
        .observe(start.elapsed().as_secs_f64() * 1000.0);
}

/// An empty merge is a 404, unless no backend could be reached at all
/// and at least one transport error occurred.
fn empty_result_error(rs: &RecordStream) -> ApiError {
    if rs.reached.load(Ordering::Relaxed) == 0 && rs.failed.load(Ordering::Relaxed) > 0 {
        ApiError::UpstreamUnreachable
    } else {
        ApiError::NotFound
    }
}
