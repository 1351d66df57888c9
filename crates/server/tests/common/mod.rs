//! Server test utilities.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use polestar_core::{AddrInfo, AppConfig, FindResponse, MultihashResult, ProviderResult};
use polestar_server::{AppState, create_router, load_backends};
use std::time::Duration;
use tower::ServiceExt;
use url::Url;

/// A CID and the base58 form of its multihash, used all over the find
/// tests.
#[allow(dead_code)]
pub const TEST_CID: &str = "bafybeidbjeqjovk2zdwh2dngy7tckid7l7qab5wivw2v5es4gphqxvsqqu";
#[allow(dead_code)]
pub const TEST_MH: &str = "QmZ7nrfFMcrnroRWkZCAiALDEYK5Z5gkEFsSMAaoFfQmAw";

/// A gateway wired to a caller-chosen set of (mock) backends.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
}

#[allow(dead_code)]
pub struct TestServerBuilder {
    config: AppConfig,
    plain: Vec<Url>,
    cascade: Vec<Url>,
    dh: Vec<Url>,
    providers: Vec<Url>,
    translate_reframe: bool,
    translate_non_streaming: bool,
}

#[allow(dead_code)]
impl TestServerBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        // Keep fan-out waits short so failure-path tests finish quickly.
        config.server.result_max_wait = Duration::from_millis(500);
        config.server.result_stream_max_wait = Duration::from_millis(500);
        Self {
            config,
            plain: Vec::new(),
            cascade: Vec::new(),
            dh: Vec::new(),
            providers: Vec::new(),
            translate_reframe: false,
            translate_non_streaming: false,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut AppConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn plain(mut self, url: &str) -> Self {
        self.plain.push(Url::parse(url).unwrap());
        self
    }

    pub fn cascade(mut self, url: &str) -> Self {
        self.cascade.push(Url::parse(url).unwrap());
        self
    }

    pub fn dh(mut self, url: &str) -> Self {
        self.dh.push(Url::parse(url).unwrap());
        self
    }

    pub fn providers(mut self, url: &str) -> Self {
        self.providers.push(Url::parse(url).unwrap());
        self
    }

    pub fn translate_reframe(mut self) -> Self {
        self.translate_reframe = true;
        self
    }

    pub fn translate_non_streaming(mut self) -> Self {
        self.translate_non_streaming = true;
        self
    }

    pub fn build(self) -> TestServer {
        let backends = load_backends(
            &self.config,
            &self.plain,
            &self.cascade,
            &self.dh,
            &self.providers,
        )
        .expect("failed to build backend set");
        let state = AppState::new(
            self.config,
            backends,
            self.translate_reframe,
            self.translate_non_streaming,
        )
        .expect("failed to build app state");
        TestServer {
            router: create_router(state.clone()),
            state,
        }
    }
}

/// Drive one request through the router.
#[allow(dead_code)]
pub async fn request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    accept: Option<&str>,
    body: Option<Vec<u8>>,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "gateway.test");
    if let Some(accept) = accept {
        builder = builder.header("accept", accept);
    }
    let body = match body {
        Some(bytes) => Body::from(bytes),
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, bytes)
}

#[allow(dead_code)]
pub async fn get(
    router: &axum::Router,
    uri: &str,
    accept: Option<&str>,
) -> (StatusCode, HeaderMap, Bytes) {
    request(router, "GET", uri, accept, None).await
}

/// One plain provider claim for `TEST_MH`.
#[allow(dead_code)]
pub fn provider_result(provider_id: &str, context_id: &[u8], metadata: Vec<u8>) -> ProviderResult {
    ProviderResult {
        context_id: context_id.to_vec(),
        metadata,
        provider: AddrInfo {
            id: provider_id.to_string(),
            addrs: vec!["/ip4/127.0.0.1/tcp/4001".to_string()],
        },
    }
}

/// A single-multihash find response in backend wire shape.
#[allow(dead_code)]
pub fn find_response(mh: &str, providers: Vec<ProviderResult>) -> serde_json::Value {
    let mh_bytes = polestar_core::ContentKey::parse_b58(mh).unwrap().to_bytes();
    serde_json::to_value(FindResponse {
        multihash_results: vec![MultihashResult {
            multihash: mh_bytes,
            provider_results: providers,
        }],
        encrypted_multihash_results: Vec::new(),
    })
    .unwrap()
}
