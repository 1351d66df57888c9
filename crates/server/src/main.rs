//! Polestar gateway binary.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Parser;
use polestar_core::{AppConfig, load_backend_urls};
use polestar_server::{AppState, create_router, load_backends};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// How frequently the backends file is checked for changes. The file is
/// also re-read on SIGHUP.
const CONFIG_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_BACKEND: &str = "https://cid.contact/";

/// Polestar routes content lookups across an indexer federation in a
/// star topology.
#[derive(Parser, Clone, Debug)]
#[command(name = "polestard")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the backends file (JSON array of URLs)
    #[arg(long, env = "POLESTAR_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP server listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Metrics server listen address
    #[arg(long, default_value = "0.0.0.0:8081")]
    metrics: String,

    /// Backends to propagate requests to
    #[arg(long, value_delimiter = ',')]
    backends: Vec<String>,

    /// Backends consulted only on cascade opt-in
    #[arg(long = "cascadeBackends", value_delimiter = ',')]
    cascade_backends: Vec<String>,

    /// Double-hashed backends
    #[arg(long = "dhBackends", value_delimiter = ',')]
    dh_backends: Vec<String>,

    /// Backends that only answer /providers queries
    #[arg(long = "providersBackends", value_delimiter = ',')]
    providers_backends: Vec<String>,

    /// Translate reframe requests into find requests instead of
    /// proxying them to backends
    #[arg(long = "translateReframe")]
    translate_reframe: bool,

    /// Present non-streaming JSON atop streaming NDJSON backends
    #[arg(long = "translateNonStreaming")]
    translate_non_streaming: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env();
    polestar_server::metrics::register_metrics();

    let plain = resolve_plain_backends(&args)?;
    let cascade = parse_urls(&args.cascade_backends)?;
    let dh = parse_urls(&args.dh_backends)?;
    let providers = parse_urls(&args.providers_backends)?;

    let backends = load_backends(&config, &plain, &cascade, &dh, &providers)?;
    let state = AppState::new(
        config,
        backends,
        args.translate_reframe,
        args.translate_non_streaming,
    )?;

    let shutdown = CancellationToken::new();
    state.spawn_background_tasks(&shutdown);
    spawn_reload_task(state.clone(), args.clone(), shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutting down");
            shutdown.cancel();
        });
    }

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("cannot listen on {}", args.listen))?;
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics)
        .await
        .with_context(|| format!("cannot listen on {}", args.metrics))?;

    tracing::info!(listen_addr = %args.listen, "finder http server listening");
    tracing::info!(listen_addr = %args.metrics, "metrics server listening");

    let serve_finder = axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let serve_metrics = axum::serve(metrics_listener, polestar_server::routes::metrics_router())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::try_join!(
        async { serve_finder.await },
        async { serve_metrics.await },
    )
    .context("server error")?;
    Ok(())
}

fn parse_urls(raw: &[String]) -> Result<Vec<Url>> {
    raw.iter()
        .filter(|s| !s.is_empty())
        .map(|s| Url::parse(s).with_context(|| format!("invalid backend url: {s}")))
        .collect()
}

fn resolve_plain_backends(args: &Args) -> Result<Vec<Url>> {
    if !args.backends.is_empty() {
        return parse_urls(&args.backends);
    }
    if let Some(path) = &args.config {
        return load_backend_urls(path).context("could not load backends from config");
    }
    Ok(vec![Url::parse(DEFAULT_BACKEND)?])
}

async fn wait_for_shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::error!(%err, "cannot install SIGTERM handler"),
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

/// Rebuild and swap the backend set on SIGHUP or when the backends file
/// changes on disk.
fn spawn_reload_task(state: AppState, args: Args, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(%err, "cannot install SIGHUP handler");
                return;
            }
        };

        let mut ticker = tokio::time::interval(CONFIG_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut mod_time = args.config.as_deref().and_then(mtime);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sighup.recv() => reload(&state, &args),
                _ = ticker.tick() => {
                    let Some(path) = args.config.as_deref() else { continue };
                    let current = mtime(path);
                    if current.is_some() && current != mod_time {
                        mod_time = current;
                        reload(&state, &args);
                    }
                }
            }
        }
    });
}

fn reload(state: &AppState, args: &Args) {
    let Some(path) = args.config.as_deref() else {
        tracing::warn!("no backends file configured, nothing to reload");
        return;
    };
    if let Err(err) = try_reload(state, args, path) {
        tracing::warn!(%err, "couldn't reload backends");
    }
}

fn try_reload(state: &AppState, args: &Args, path: &Path) -> Result<()> {
    let plain = load_backend_urls(path)?;
    let cascade = parse_urls(&args.cascade_backends)?;
    let dh = parse_urls(&args.dh_backends)?;
    let providers = parse_urls(&args.providers_backends)?;

    let backends = load_backends(&state.config, &plain, &cascade, &dh, &providers)?;
    tracing::info!(count = backends.len(), "backend set reloaded");
    state.replace_backends(backends);
    Ok(())
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}
