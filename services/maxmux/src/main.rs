//! maxmux - virtual key proxy for a shared Anthropic OAuth subscription
//!
//! Single-binary Rust service that:
//! 1. Loads a static allow-list of per-client virtual keys
//! 2. Rejects requests whose `Authorization: Bearer` key is not on the list
//! 3. Swaps the virtual key for the shared OAuth token and injects the
//!    OAuth headers (anthropic-beta: oauth-2025-04-20)
//! 4. Streams the exchange to and from api.anthropic.com

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;
mod relay;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use provider::SharedTokenProvider;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use virtual_keys::VirtualKeys;

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;

/// How long in-flight requests may keep running after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the proxy router: every method and path goes to the proxy handler.
fn build_router(state: ProxyState) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

/// Assemble the gateway from a loaded configuration.
///
/// Fails on anything that must stop the process before it binds a port.
fn build_proxy_state(config: &Config, metrics: ServiceMetrics) -> Result<ProxyState> {
    let provider = SharedTokenProvider::new(config.oauth_token.clone())
        .context("oauth_token cannot be used as a bearer credential")?;
    let client = proxy::build_client(config.connect_timeout, config.read_timeout)
        .context("failed to build upstream HTTP client")?;
    let keys = VirtualKeys::new(config.virtual_keys.iter().cloned());

    Ok(ProxyState::new(
        client,
        config.upstream.clone(),
        keys,
        Arc::new(provider),
        metrics,
        config.max_connections,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // CLI: simple --config / --log-level flag parsing
    let args: Vec<String> = std::env::args().collect();
    init_tracing(flag_value(&args, "--log-level"));

    let config_path = Config::resolve_path(flag_value(&args, "--config"));
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let service_metrics = ServiceMetrics::new();
    let proxy_state = build_proxy_state(&config, service_metrics.clone())?;

    info!(
        port = config.port,
        upstream = %config.upstream,
        virtual_keys = proxy_state.keys.len(),
        oauth_token = %config.oauth_token.masked(),
        "starting maxmux"
    );
    if proxy_state.keys.is_empty() {
        warn!("no virtual keys configured, every request will be rejected");
    }

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    if let Some(metrics_addr) = config.metrics_addr() {
        let admin_app = build_admin_router(AdminState {
            metrics: service_metrics.clone(),
            prometheus: prometheus_handle,
            upstream: Arc::from(config.upstream.as_str()),
            virtual_keys: proxy_state.keys.len(),
        });
        let admin_listener = TcpListener::bind(metrics_addr)
            .await
            .with_context(|| format!("failed to bind admin listener to {metrics_addr}"))?;
        info!(addr = %metrics_addr, "admin listener ready");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app).await {
                error!(error = %e, "admin listener failed");
            }
        });
    }

    let listen_addr = config.listen_addr();
    let app = build_router(proxy_state);
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "listening");

    let in_flight = service_metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: signal the server to drain, then race it against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// JSON logs; level from --log-level, then LOG_LEVEL, then RUST_LOG, then info.
fn init_tracing(cli_level: Option<&str>) {
    let filter = cli_level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_env("LOG_LEVEL").ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Value following `flag` on the command line, if any.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Catch-all handler that proxies every request to upstream.
async fn proxy_handler(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
