//! Runtime configuration.
//!
//! Tuning knobs come from the environment (`SERVER_*`, `CIRCUIT_*`,
//! `CASCADE_CIRCUIT_*`); the backends file is a JSON array of URL
//! strings and is the only persisted state. A section that fails to
//! parse falls back to its defaults with a warning rather than aborting
//! startup.

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// HTTP client, aggregation, and reporting knobs. Environment prefix
/// `SERVER_`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum idle connections kept per backend host.
    pub max_idle_conns: usize,
    /// Maximum total connections per backend host.
    pub max_conns_per_host: usize,
    /// Whole-request timeout on outbound backend calls.
    #[serde(with = "humantime_serde")]
    pub http_client_timeout: Duration,
    /// TCP connect timeout.
    #[serde(with = "humantime_serde")]
    pub dialer_timeout: Duration,
    /// TCP keep-alive interval.
    #[serde(with = "humantime_serde")]
    pub dialer_keep_alive: Duration,
    /// How long a batch find waits for any backend.
    #[serde(with = "humantime_serde")]
    pub result_max_wait: Duration,
    /// How long a streaming find waits for any backend.
    #[serde(with = "humantime_serde")]
    pub result_stream_max_wait: Duration,
    /// Inbound request body cap in bytes.
    pub max_request_body_size: usize,
    /// Comma-separated cascade labels clients may opt into.
    pub cascade_labels: String,
    /// How many providers the top-provider gauge reports.
    pub top_provider_cardinality: usize,
    #[serde(with = "humantime_serde")]
    pub top_provider_report_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub provider_cache_refresh_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_conns_per_host: 100,
            http_client_timeout: Duration::from_secs(10),
            dialer_timeout: Duration::from_secs(10),
            dialer_keep_alive: Duration::from_secs(15),
            result_max_wait: Duration::from_secs(5),
            result_stream_max_wait: Duration::from_secs(10),
            max_request_body_size: 8 << 10,
            cascade_labels: String::new(),
            top_provider_cardinality: 1000,
            top_provider_report_interval: Duration::from_secs(60),
            provider_cache_refresh_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Cascade labels as a list; empty configuration yields no labels.
    pub fn cascade_label_list(&self) -> Vec<String> {
        self.cascade_labels
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Circuit breaker tuning. Environment prefixes `CIRCUIT_` and
/// `CASCADE_CIRCUIT_`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive half-open successes required to close the breaker.
    pub half_open_successes: u32,
    /// How long the breaker stays open before admitting a probe.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Idle duration after which the closed-state failure counter resets.
    #[serde(with = "humantime_serde")]
    pub counter_reset: Duration,
    /// Failures within one counter window that trip the breaker open.
    pub failure_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            half_open_successes: 10,
            open_timeout: Duration::ZERO,
            counter_reset: Duration::from_secs(1),
            failure_threshold: 10,
        }
    }
}

/// Full environment-derived configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub circuit: CircuitConfig,
    pub cascade_circuit: CircuitConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            server: section("SERVER_"),
            circuit: section("CIRCUIT_"),
            cascade_circuit: section("CASCADE_CIRCUIT_"),
        }
    }
}

fn section<T: Default + Serialize + DeserializeOwned>(prefix: &str) -> T {
    Figment::from(Serialized::defaults(T::default()))
        .merge(Env::prefixed(prefix))
        .extract()
        .unwrap_or_else(|err| {
            tracing::warn!(%prefix, %err, "invalid environment configuration, using defaults");
            T::default()
        })
}

/// Read the backends file: a JSON array of URL strings.
pub fn load_backend_urls(path: &Path) -> Result<Vec<Url>> {
    let raw = std::fs::read(path).map_err(|e| Error::BackendsFile(e.to_string()))?;
    let entries: Vec<String> =
        serde_json::from_slice(&raw).map_err(|e| Error::BackendsFile(e.to_string()))?;
    entries
        .iter()
        .map(|s| {
            Url::parse(s).map_err(|e| Error::InvalidBackendUrl {
                url: s.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}
