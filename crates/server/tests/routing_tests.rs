//! Routing, method, and accept-negotiation behavior of the front door.

mod common;

use axum::http::StatusCode;
use common::{TEST_CID, TEST_MH, TestServerBuilder, find_response, get, provider_result, request};
use httpmock::prelude::*;

#[tokio::test]
async fn health_is_ready() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();
    let (status, _, bytes) = get(&server.router, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&bytes[..], b"ready");

    let (status, headers, _) = request(&server.router, "POST", "/health", None, None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers.get("allow").unwrap(), "GET");
}

#[tokio::test]
async fn landing_page_is_strict_about_paths() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();

    let (status, _, bytes) = get(&server.router, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&bytes).contains("polestar"));

    let (status, _, _) = get(&server.router, "/index.html", None).await;
    assert_eq!(status, StatusCode::OK);

    // Paths some backends support and we do not must 404, never fall
    // back to HTML.
    let (status, _, _) = get(&server.router, "/metadata", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = get(&server.router, "/no-such-thing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = request(&server.router, "POST", "/", None, None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn cid_lookup_accepts_json_by_default() {
    let backend = MockServer::start_async().await;
    backend
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/cid/{TEST_CID}"))
                .header("accept", "application/json");
            then.status(200).json_body(find_response(
                TEST_MH,
                vec![provider_result("peer-1", b"ctx", Vec::new())],
            ));
        })
        .await;

    let server = TestServerBuilder::new().plain(&backend.base_url()).build();

    let (status, headers, _) = get(&server.router, &format!("/cid/{TEST_CID}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/json")
    );
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
}

#[tokio::test]
async fn cid_lookup_streams_on_ndjson_accept() {
    let backend = MockServer::start_async().await;
    backend
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/cid/{TEST_CID}"))
                .header("accept", "application/x-ndjson");
            then.status(200).body(
                r#"{"ContextID":"Y3R4","Provider":{"ID":"peer-1","Addrs":["/ip4/1.2.3.4/tcp/1"]}}
"#,
            );
        })
        .await;

    let server = TestServerBuilder::new().plain(&backend.base_url()).build();
    let (status, headers, _) = get(
        &server.router,
        &format!("/cid/{TEST_CID}"),
        Some("application/x-ndjson"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/x-ndjson");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("connection").unwrap(), "Keep-Alive");
}

#[tokio::test]
async fn unsupported_accept_is_a_client_error() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();
    let (status, _, _) = get(
        &server.router,
        &format!("/cid/{TEST_CID}"),
        Some("text/csv"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(&server.router, &format!("/cid/{TEST_CID}"), Some(";;;;")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_keys_are_rejected() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();

    let (status, _, _) = get(&server.router, "/cid/not-a-cid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(&server.router, "/multihash/0OIl", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn options_advertises_cors_and_cascade_labels() {
    let server = TestServerBuilder::new()
        .config(|c| c.server.cascade_labels = "legs,ipfs-dht".to_string())
        .plain("http://127.0.0.1:1/")
        .build();

    let (status, headers, _) = request(
        &server.router,
        "OPTIONS",
        &format!("/cid/{TEST_CID}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET, OPTIONS"
    );
    assert_eq!(
        headers.get("x-ipni-allow-cascade").unwrap(),
        "legs,ipfs-dht"
    );

    let (status, headers, _) =
        request(&server.router, "OPTIONS", "/multihash", None, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET, POST, OPTIONS"
    );
}

#[tokio::test]
async fn options_without_cascade_labels_omits_the_header() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();
    let (status, headers, _) = request(
        &server.router,
        "OPTIONS",
        &format!("/cid/{TEST_CID}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(headers.get("x-ipni-allow-cascade").is_none());
}

#[tokio::test]
async fn wrong_methods_get_allow_headers() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();

    let (status, headers, _) = request(
        &server.router,
        "DELETE",
        &format!("/cid/{TEST_CID}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers.get("allow").unwrap(), "GET, OPTIONS");

    let (status, headers, _) = request(
        &server.router,
        "GET",
        "/multihash",
        Some("application/json"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers.get("allow").unwrap(), "POST, OPTIONS");
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let server = TestServerBuilder::new()
        .config(|c| c.server.max_request_body_size = 64)
        .plain("http://127.0.0.1:1/")
        .build();

    let (status, _, _) = request(
        &server.router,
        "POST",
        "/multihash",
        Some("application/json"),
        Some(vec![b'x'; 1024]),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}
