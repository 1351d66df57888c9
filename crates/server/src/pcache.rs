//! Background-refreshed provider cache.
//!
//! A union view over the providers-only backends: the refresher fetches
//! each backend's provider list on a timer and merges by peer ID, the
//! record with the latest parseable advertisement time winning. The
//! `/providers` endpoints are answered purely from the latest snapshot
//! and never scatter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::accept::MEDIA_TYPE_JSON;
use polestar_core::ProviderInfo;

type Snapshot = HashMap<String, ProviderInfo>;

pub struct ProviderCache {
    http: reqwest::Client,
    sources: ArcSwap<Vec<Url>>,
    snapshot: ArcSwap<Snapshot>,
}

impl ProviderCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            sources: ArcSwap::from_pointee(Vec::new()),
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
        }
    }

    /// Replace the providers-only backend set, e.g. after a reload.
    pub fn set_sources(&self, sources: Vec<Url>) {
        self.sources.store(Arc::new(sources));
    }

    /// Fetch every source and swap in a freshly merged snapshot.
    pub async fn refresh(&self) {
        let sources = self.sources.load_full();
        let mut merged = Snapshot::new();
        for source in sources.iter() {
            match self.fetch_providers(source).await {
                Ok(providers) => {
                    for info in providers {
                        merge_provider(&mut merged, info);
                    }
                }
                Err(err) => {
                    tracing::warn!(source = %source, %err, "failed to refresh providers");
                }
            }
        }
        self.snapshot.store(Arc::new(merged));
    }

    async fn fetch_providers(&self, source: &Url) -> anyhow::Result<Vec<ProviderInfo>> {
        let mut endpoint = source.clone();
        endpoint.set_path("/providers");
        endpoint.set_query(None);

        let resp = self
            .http
            .get(endpoint)
            .header(ACCEPT, MEDIA_TYPE_JSON)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("status {status} from provider source");
        }
        Ok(resp.json().await?)
    }

    /// All cached providers, in no particular order.
    pub fn list(&self) -> Vec<ProviderInfo> {
        self.snapshot.load().values().cloned().collect()
    }

    /// A single cached provider by peer ID.
    pub fn get(&self, peer_id: &str) -> Option<ProviderInfo> {
        self.snapshot.load().get(peer_id).cloned()
    }

    /// Run `refresh` on a timer until cancelled. The initial refresh is
    /// immediate so the cache serves data as soon as sources respond.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.refresh().await,
                }
            }
        })
    }
}

/// Keep the record with the latest parseable advertisement time; a
/// record with an unparseable or missing time never displaces one
/// already present.
fn merge_provider(merged: &mut Snapshot, info: ProviderInfo) {
    let id = info.addr_info.id.clone();
    if id.is_empty() {
        return;
    }
    match merged.get(&id) {
        None => {
            merged.insert(id, info);
        }
        Some(current) => {
            if let (Some(current_at), Some(new_at)) =
                (current.last_advertised_at(), info.last_advertised_at())
            {
                if current_at < new_at {
                    merged.insert(id, info);
                }
            }
        }
    }
}
