//! Provider cache endpoints.

mod common;

use axum::http::StatusCode;
use common::{TestServerBuilder, get, request};
use httpmock::prelude::*;

fn provider_json(id: &str, time: &str) -> serde_json::Value {
    serde_json::json!({
        "AddrInfo": {"ID": id, "Addrs": ["/ip4/10.0.0.1/tcp/4001"]},
        "LastAdvertisementTime": time,
        "IndexCount": 7
    })
}

#[tokio::test]
async fn providers_list_unions_sources_latest_record_winning() {
    let a = MockServer::start_async().await;
    let b = MockServer::start_async().await;
    a.mock_async(|when, then| {
        when.method(GET).path("/providers");
        then.status(200).json_body(serde_json::json!([
            provider_json("peer-1", "2023-01-01T00:00:00Z"),
            provider_json("peer-2", "2023-01-01T00:00:00Z"),
        ]));
    })
    .await;
    b.mock_async(|when, then| {
        when.method(GET).path("/providers");
        then.status(200).json_body(serde_json::json!([
            provider_json("peer-1", "2023-06-01T00:00:00Z"),
        ]));
    })
    .await;

    let server = TestServerBuilder::new()
        .plain("http://127.0.0.1:1/")
        .providers(&a.base_url())
        .providers(&b.base_url())
        .build();
    server.state.provider_cache.refresh().await;

    let (status, _, bytes) = get(&server.router, "/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    let list: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(list.len(), 2);

    let (status, _, bytes) = get(&server.router, "/providers/peer-1", None).await;
    assert_eq!(status, StatusCode::OK);
    let info: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(info["LastAdvertisementTime"], "2023-06-01T00:00:00Z");
    // Fields the gateway does not model still pass through.
    assert_eq!(info["IndexCount"], 7);
}

#[tokio::test]
async fn providers_never_scatter_to_find_backends() {
    let plain = MockServer::start_async().await;
    let plain_mock = plain
        .mock_async(|when, then| {
            when.any_request();
            then.status(200).json_body(serde_json::json!([]));
        })
        .await;

    let server = TestServerBuilder::new().plain(&plain.base_url()).build();
    server.state.provider_cache.refresh().await;

    // An empty federation is an empty array, never a 404.
    let (status, _, bytes) = get(&server.router, "/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&bytes[..], b"[]");
    assert_eq!(plain_mock.hits_async().await, 0);
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();
    let (status, _, _) = get(&server.router, "/providers/peer-missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn providers_routes_are_get_only() {
    let server = TestServerBuilder::new().plain("http://127.0.0.1:1/").build();
    let (status, headers, _) = request(&server.router, "PUT", "/providers", None, None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers.get("allow").unwrap(), "GET");
}

#[tokio::test]
async fn failing_source_does_not_poison_the_union() {
    let healthy = MockServer::start_async().await;
    healthy
        .mock_async(|when, then| {
            when.method(GET).path("/providers");
            then.status(200).json_body(serde_json::json!([
                provider_json("peer-1", "2023-01-01T00:00:00Z"),
            ]));
        })
        .await;

    let server = TestServerBuilder::new()
        .plain("http://127.0.0.1:1/")
        .providers(&healthy.base_url())
        .providers("http://127.0.0.1:1/")
        .build();
    server.state.provider_cache.refresh().await;

    let (status, _, bytes) = get(&server.router, "/providers", None).await;
    assert_eq!(status, StatusCode::OK);
    let list: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(list.len(), 1);
}
