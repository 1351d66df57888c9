//! Backend registry and request matchers.
//!
//! A backend is an immutable `(url, circuit breaker, matcher, kind)`
//! tuple; the live set is replaced wholesale on configuration reload.
//! The kind decides which request classes a backend may answer, the
//! matcher adds per-request opt-in (cascade labels).

use std::sync::Arc;

use anyhow::Context;
use url::Url;

use crate::breaker::CircuitBreaker;
use polestar_core::AppConfig;

/// Which federation role a backend plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Regular indexer answering plain find queries.
    Plain,
    /// Indexer consulted only when the client opts in via the `cascade`
    /// query parameter.
    Cascade,
    /// Double-hashed indexer answering encrypted lookups.
    DoubleHashed,
    /// Backend that only answers `/providers` queries.
    ProvidersOnly,
}

/// The routing class of an inbound request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestClass {
    PlainFind,
    DhFind,
    FindMetadata,
    ProviderList,
}

/// Predicate over an inbound request URL.
#[derive(Clone, Debug)]
pub enum Matcher {
    Any,
    AnyOf(Vec<Matcher>),
    QueryParam { key: String, value: String },
}

impl Matcher {
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::AnyOf(ms) => ms.iter().any(|m| m.matches(url)),
            Matcher::QueryParam { key, value } => url
                .query_pairs()
                .any(|(k, v)| k.as_ref() == key && v.as_ref() == value),
        }
    }
}

pub struct Backend {
    url: Url,
    kind: BackendKind,
    breaker: Arc<CircuitBreaker>,
    matcher: Matcher,
}

impl Backend {
    pub fn new(url: Url, kind: BackendKind, breaker: CircuitBreaker, matcher: Matcher) -> Self {
        Self {
            url,
            kind,
            breaker: Arc::new(breaker),
            matcher,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn matches(&self, url: &Url) -> bool {
        self.matcher.matches(url)
    }

    /// The eligibility table: which backend kinds answer which request
    /// classes. Matchers are applied separately.
    pub fn serves(&self, class: RequestClass) -> bool {
        matches!(
            (self.kind, class),
            (BackendKind::Plain | BackendKind::Cascade, RequestClass::PlainFind)
                | (
                    BackendKind::DoubleHashed,
                    RequestClass::DhFind | RequestClass::FindMetadata
                )
                | (BackendKind::ProvidersOnly, RequestClass::ProviderList)
        )
    }
}

/// Build the full backend set from configured URL lists.
pub fn load_backends(
    config: &AppConfig,
    plain: &[Url],
    cascade: &[Url],
    dh: &[Url],
    providers: &[Url],
) -> anyhow::Result<Vec<Arc<Backend>>> {
    let mut backends = Vec::with_capacity(plain.len() + cascade.len() + dh.len() + providers.len());

    let simple = |url: &Url, kind| {
        validate(url)?;
        Ok::<_, anyhow::Error>(Arc::new(Backend::new(
            url.clone(),
            kind,
            CircuitBreaker::new(url.as_str(), &config.circuit),
            Matcher::Any,
        )))
    };

    for url in plain {
        backends.push(simple(url, BackendKind::Plain)?);
    }
    for url in dh {
        backends.push(simple(url, BackendKind::DoubleHashed)?);
    }
    for url in providers {
        backends.push(simple(url, BackendKind::ProvidersOnly)?);
    }

    let labels = config.server.cascade_label_list();
    for url in cascade {
        validate(url)?;
        let matcher = if labels.is_empty() {
            Matcher::Any
        } else {
            Matcher::AnyOf(
                labels
                    .iter()
                    .map(|label| Matcher::QueryParam {
                        key: "cascade".to_string(),
                        value: label.clone(),
                    })
                    .collect(),
            )
        };
        backends.push(Arc::new(Backend::new(
            url.clone(),
            BackendKind::Cascade,
            CircuitBreaker::new(url.as_str(), &config.cascade_circuit),
            matcher,
        )));
    }

    if backends.is_empty() {
        anyhow::bail!("no backends specified");
    }
    Ok(backends)
}

fn validate(url: &Url) -> anyhow::Result<()> {
    url.host_str()
        .map(|_| ())
        .with_context(|| format!("backend url has no host: {url}"))
}
