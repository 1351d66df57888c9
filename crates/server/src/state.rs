//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendKind};
use crate::pcache::ProviderCache;
use crate::pcount::ProviderCounter;
use polestar_core::AppConfig;

/// Shared application state.
///
/// The backend set is an atomically swapped immutable slice: readers
/// load one consistent snapshot per request and reloads never produce a
/// partially updated view.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Shared pooled HTTP client used by every backend call.
    pub http: reqwest::Client,
    backends: Arc<ArcSwap<Vec<Arc<Backend>>>>,
    pub provider_cache: Arc<ProviderCache>,
    pub provider_counts: Arc<ProviderCounter>,
    /// Present non-streaming JSON atop streaming NDJSON upstreams.
    pub translate_non_streaming: bool,
    /// Translate legacy reframe calls into core finds instead of
    /// proxying them through.
    pub translate_reframe: bool,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        backends: Vec<Arc<Backend>>,
        translate_reframe: bool,
        translate_non_streaming: bool,
    ) -> anyhow::Result<Self> {
        let http = build_http_client(&config)?;
        let provider_cache = Arc::new(ProviderCache::new(http.clone()));
        let provider_counts = Arc::new(ProviderCounter::new(config.server.top_provider_cardinality));

        let state = Self {
            config: Arc::new(config),
            http,
            backends: Arc::new(ArcSwap::from_pointee(Vec::new())),
            provider_cache,
            provider_counts,
            translate_non_streaming,
            translate_reframe,
        };
        state.replace_backends(backends);
        Ok(state)
    }

    /// One consistent snapshot of the live backend set.
    pub fn backends(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    /// Swap in a fully built replacement backend set and repoint the
    /// provider cache at its providers-only members.
    pub fn replace_backends(&self, backends: Vec<Arc<Backend>>) {
        let provider_sources = backends
            .iter()
            .filter(|b| b.kind() == BackendKind::ProvidersOnly)
            .map(|b| b.url().clone())
            .collect();
        self.provider_cache.set_sources(provider_sources);
        self.backends.store(Arc::new(backends));
    }

    /// Spawn the provider-cache refresher and the top-provider reporter.
    pub fn spawn_background_tasks(&self, cancel: &CancellationToken) {
        self.provider_cache
            .clone()
            .spawn_refresher(self.config.server.provider_cache_refresh_interval, cancel.clone());

        let counts = self.provider_counts.clone();
        let interval = self
            .config
            .server
            .top_provider_report_interval
            .max(Duration::from_secs(1));
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick reports an empty map; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => counts.report(),
                }
            }
        });
    }
}

fn build_http_client(config: &AppConfig) -> anyhow::Result<reqwest::Client> {
    let server = &config.server;
    Ok(reqwest::Client::builder()
        .pool_max_idle_per_host(server.max_idle_conns)
        .timeout(server.http_client_timeout)
        .connect_timeout(server.dialer_timeout)
        .tcp_keepalive(server.dialer_keep_alive)
        .build()?)
}
