//! Credential issuer
//!
//! Single-binary service that:
//! 1. Loads credentials, requests and proxies from the JSON state file
//! 2. Probes the proxy pool in the background
//! 3. Serves the admin API that approves, rejects and revokes requests
//! 4. Runs one listener per issued credential until its confirmation code arrives

mod admin;
mod config;
mod error;
mod metrics;
mod notify;

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_store::FileStore;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use issuance::RequestOrchestrator;
use metrics_exporter_prometheus::PrometheusHandle;
use platform::GatewayConnector;
use proxy_pool::{HttpProber, IpApiLookup, ProxyPool, ProxyRegistry};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::notify::LogNotifier;

/// How long in-flight admin calls may run after a shutdown signal.
/// Revoke can spend up to its session reset bound, so this stays above it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the health and metrics handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<RequestOrchestrator>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the full router: health, metrics and the admin API behind one
/// concurrency limit.
fn build_router(state: AppState, admin: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(build_admin_router(admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting credential-issuer");

    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        store = %config.store.path.display(),
        gateway = %config.gateway.base_url,
        gateway_token = config.gateway.token.is_some(),
        code_wait_secs = config.listener.code_wait_timeout_secs,
        "configuration loaded"
    );

    let store = Arc::new(
        FileStore::load(config.store.path.clone())
            .await
            .with_context(|| format!("failed to open store {}", config.store.path.display()))?,
    );

    let prober = HttpProber::new(
        config.proxies.probe_url.clone(),
        Duration::from_secs(config.proxies.probe_timeout_secs),
    );
    let pool = Arc::new(ProxyPool::new(Arc::new(prober)));

    let mut registry = ProxyRegistry::new(store.clone(), pool.clone());
    if config.proxies.geo_lookup {
        registry = registry.with_geo(Arc::new(IpApiLookup::new(reqwest::Client::new())));
    }
    let registry = Arc::new(registry);
    let loaded = registry
        .load_into_pool()
        .await
        .context("failed to load proxies into the pool")?;
    if loaded == 0 {
        warn!("no proxies configured, listeners will connect directly");
    }

    let gateway_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.gateway.timeout_secs))
        .build()
        .context("failed to build gateway HTTP client")?;
    let connector = Arc::new(GatewayConnector::new(
        gateway_client,
        &config.gateway.base_url,
        config.gateway.token.clone(),
    ));

    let orchestrator = Arc::new(RequestOrchestrator::new(
        store,
        pool,
        connector,
        Arc::new(LogNotifier),
        config.issuance(),
    ));
    let probe_task = orchestrator.spawn_probe(
        Some(registry.clone()),
        Duration::from_secs(config.proxies.probe_interval_secs),
    );

    let app_state = AppState {
        orchestrator: orchestrator.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(
        app_state,
        AdminState::new(orchestrator.clone(), registry),
        config.admin.max_connections,
    );

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting admin requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    let stopped = orchestrator.shutdown().await;
    if let Err(e) = probe_task.await {
        error!(error = %e, "probe task panicked");
    }

    info!(listeners_stopped = stopped, "shutdown complete");
    Ok(())
}

/// Health endpoint: uptime, running listeners and pool health.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let listeners = state.orchestrator.manager().active_count().await;
    let proxies = state.orchestrator.pool().stats().await;

    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "active_listeners": listeners,
        "proxies": proxies,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
