//! Delegated-routing (`/routing/v1`) adapter.
//!
//! A thin shape-transformer over the core find call: `/providers/{cid}`
//! becomes an internal `/cid/{cid}` find and provider results are
//! reshaped into delegated-routing "peer" records. Holds no state of its
//! own.

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::accept::{MEDIA_TYPE_NDJSON, get_accepts};
use crate::backend::RequestClass;
use crate::error::{ApiError, ApiResult};
use crate::handlers::find::{FIND_METHOD_DELEGATED, do_find, request_host};
use crate::handlers::find_stream::scatter_find_records;
use crate::metrics::DELEGATED_ROUTING_METHOD;
use crate::state::AppState;
use polestar_core::{ContentKey, FindRecord, ProviderResult, transport};

const SCHEMA_PEER: &str = "peer";

/// Nested router mounted under the `/routing/v1` strip-prefix.
pub fn delegated_router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/providers", any(providers_root))
        .route("/providers/{cid}", any(find_providers))
        .route("/encrypted/providers/{cid}", any(find_providers_encrypted))
}

/// A delegated-routing provider record.
#[derive(Clone, Debug, Serialize)]
struct PeerRecord {
    #[serde(rename = "Schema")]
    schema: &'static str,
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Addrs")]
    addrs: Vec<String>,
    #[serde(rename = "Protocols", skip_serializing_if = "Vec::is_empty")]
    protocols: Vec<String>,
    #[serde(rename = "Metadata", skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize)]
struct DelegatedResponse {
    #[serde(rename = "Providers")]
    providers: Vec<PeerRecord>,
}

/// Reshape one provider result. A record whose metadata fails to parse
/// is still emitted, address-only.
fn peer_record(result: &ProviderResult) -> PeerRecord {
    let mut record = PeerRecord {
        schema: SCHEMA_PEER,
        id: result.provider.id.clone(),
        addrs: result.provider.addrs.clone(),
        protocols: Vec::new(),
        metadata: BTreeMap::new(),
    };
    if let Ok(entries) = transport::decode_metadata(&result.metadata) {
        for entry in entries {
            let name = entry.protocol_name().to_string();
            record.metadata.insert(name.clone(), BASE64.encode(entry.encode()));
            record.protocols.push(name);
        }
    }
    record
}

/// Identity for delegated-routing dedup: upstream records without their
/// context IDs can collide, so hash everything the client will see.
fn record_key(record: &PeerRecord) -> u32 {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(record.id.as_bytes());
    for proto in &record.protocols {
        bytes.extend_from_slice(proto.as_bytes());
    }
    bytes.extend_from_slice(record.schema.as_bytes());
    for payload in record.metadata.values() {
        bytes.extend_from_slice(payload.as_bytes());
    }
    crc32fast::hash(&bytes)
}

async fn providers_root(method: Method) -> Response {
    DELEGATED_ROUTING_METHOD
        .with_label_values(&[method.as_str()])
        .inc();
    let cors = [
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, PUT, OPTIONS"),
    ];
    if method == Method::OPTIONS {
        (StatusCode::OK, cors).into_response()
    } else if method == Method::PUT {
        (StatusCode::NOT_IMPLEMENTED, cors).into_response()
    } else {
        ApiError::MethodNotAllowed {
            allow: "PUT, OPTIONS",
        }
        .into_response()
    }
}

async fn find_providers(
    state: State<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    path: Path<String>,
) -> ApiResult<Response> {
    find_providers_inner(state, method, uri, headers, path, false).await
}

async fn find_providers_encrypted(
    state: State<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    path: Path<String>,
) -> ApiResult<Response> {
    find_providers_inner(state, method, uri, headers, path, true).await
}

async fn find_providers_inner(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(cid): Path<String>,
    encrypted: bool,
) -> ApiResult<Response> {
    DELEGATED_ROUTING_METHOD
        .with_label_values(&[method.as_str()])
        .inc();
    if method == Method::OPTIONS {
        return Ok((
            StatusCode::OK,
            [
                ("Access-Control-Allow-Origin", "*"),
                ("Access-Control-Allow-Methods", "GET, OPTIONS"),
            ],
        )
            .into_response());
    }
    if method != Method::GET {
        return Err(ApiError::MethodNotAllowed {
            allow: "GET, OPTIONS",
        });
    }

    let key = ContentKey::parse_cid(&cid)
        .map_err(|e| ApiError::BadRequest(format!("invalid cid: {e}")))?;
    let dh = encrypted || key.is_double_hashed();
    let find_uri = internal_find_uri(&cid, &uri, encrypted)?;

    let accepts = get_accepts(&headers)
        .map_err(|e| ApiError::BadRequest(format!("invalid Accept header: {e}")))?;
    let host = request_host(&headers);

    if accepts.ndjson {
        return stream_providers(&state, &find_uri, &host, dh).await;
    }
    if accepts.header_found && !accepts.json && !accepts.any {
        return Err(ApiError::BadRequest("unsupported media type".to_string()));
    }

    let resp = do_find(
        &state,
        Method::GET,
        FIND_METHOD_DELEGATED,
        &find_uri,
        &host,
        Bytes::new(),
        dh,
    )
    .await?;

    if dh {
        // No "peer" schema exists for encrypted value keys; the envelope
        // passes through untouched.
        return Ok(Json(resp).into_response());
    }

    if resp.multihash_results.len() != 1 {
        tracing::warn!(
            number_multihash = resp.multihash_results.len(),
            "unexpected backend response shape"
        );
        return Err(ApiError::Internal(
            "unexpected number of multihash results".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    let mut out = DelegatedResponse::default();
    for pr in &resp.multihash_results[0].provider_results {
        let record = peer_record(pr);
        if seen.insert(record_key(&record)) {
            out.providers.push(record);
        }
    }
    Ok(Json(out).into_response())
}

/// Map `/providers/{cid}` onto the internal find path, keeping the query
/// so cascade opt-ins survive translation.
fn internal_find_uri(cid: &str, inbound: &Uri, encrypted: bool) -> ApiResult<Uri> {
    let prefix = if encrypted { "/encrypted/cid" } else { "/cid" };
    let query = inbound
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    Uri::try_from(format!("{prefix}/{cid}{query}"))
        .map_err(|e| ApiError::BadRequest(format!("invalid request path: {e}")))
}

/// NDJSON variant: reshape and stream records as they arrive.
async fn stream_providers(
    state: &AppState,
    find_uri: &Uri,
    host: &str,
    dh: bool,
) -> ApiResult<Response> {
    let class = if dh {
        RequestClass::DhFind
    } else {
        RequestClass::PlainFind
    };
    let mut rs = scatter_find_records(
        state,
        class,
        find_uri,
        host,
        state.config.server.result_stream_max_wait,
    );

    let mut seen = std::collections::HashSet::new();
    // 404 unless at least one record arrives, exactly like the plain
    // NDJSON finder.
    let first = loop {
        match rs.rx.recv().await {
            None => return Err(ApiError::NotFound),
            Some((record, _)) => {
                if let Some(line) = encode_delegated(&record, &mut seen) {
                    break line;
                }
            }
        }
    };

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
    tokio::spawn(async move {
        if body_tx.send(Ok(first)).await.is_err() {
            rs.cancel.cancel();
            return;
        }
        while let Some((record, _)) = rs.rx.recv().await {
            let Some(line) = encode_delegated(&record, &mut seen) else {
                continue;
            };
            if body_tx.send(Ok(line)).await.is_err() {
                rs.cancel.cancel();
                return;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", MEDIA_TYPE_NDJSON)
        .header("Connection", "Keep-Alive")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Encode one upstream record as an NDJSON line, or `None` when it is a
/// duplicate. Encrypted records keep their upstream shape.
fn encode_delegated(
    record: &FindRecord,
    seen: &mut std::collections::HashSet<u32>,
) -> Option<Bytes> {
    let line = if record.is_encrypted() {
        if !seen.insert(crc32fast::hash(&record.dedup_bytes())) {
            return None;
        }
        serde_json::to_vec(record)
    } else {
        let reshaped = peer_record(&record.result);
        if !seen.insert(record_key(&reshaped)) {
            return None;
        }
        serde_json::to_vec(&reshaped)
    };
    match line {
        Ok(mut line) => {
            line.push(b'\n');
            Some(Bytes::from(line))
        }
        Err(err) => {
            tracing::error!(%err, "failed to encode delegated record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polestar_core::AddrInfo;
    use polestar_core::transport::{TRANSPORT_BITSWAP, TransportEntry};

    fn result(id: &str, metadata: Vec<u8>) -> ProviderResult {
        ProviderResult {
            context_id: b"ctx".to_vec(),
            metadata,
            provider: AddrInfo {
                id: id.to_string(),
                addrs: vec!["/ip4/10.0.0.1/tcp/4001".to_string()],
            },
        }
    }

    #[test]
    fn reshapes_known_transports() {
        let md = TransportEntry {
            code: TRANSPORT_BITSWAP,
            payload: Vec::new(),
        }
        .encode();
        let record = peer_record(&result("p1", md));
        assert_eq!(record.schema, SCHEMA_PEER);
        assert_eq!(record.protocols, vec!["transport-bitswap"]);
        assert!(record.metadata.contains_key("transport-bitswap"));
    }

    #[test]
    fn unparseable_metadata_emits_address_only_record() {
        let record = peer_record(&result("p1", vec![0xff]));
        assert_eq!(record.id, "p1");
        assert!(record.protocols.is_empty());
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn identical_records_share_a_key() {
        let md = TransportEntry {
            code: TRANSPORT_BITSWAP,
            payload: Vec::new(),
        }
        .encode();
        let a = peer_record(&result("p1", md.clone()));
        let b = peer_record(&result("p1", md));
        assert_eq!(record_key(&a), record_key(&b));

        let c = peer_record(&result("p2", Vec::new()));
        assert_ne!(record_key(&a), record_key(&c));
    }
}
