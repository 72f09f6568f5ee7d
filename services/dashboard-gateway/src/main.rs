//! Dashboard Gateway
//!
//! Single-binary Rust service that:
//! 1. Holds the dashboard session credential
//! 2. Listens for requests from the dashboard front end
//! 3. Sends each one through the request pipeline (credential injection,
//!    shared refresh on 401, single retry, error classification)
//! 4. Proxies to the dashboard backend and reports busy/session state

mod config;
mod error;
mod metrics;
mod proxy;
mod sinks;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use pipeline::{HttpTransport, LoadingAggregator, RequestPipeline};
use serde::Deserialize;
use session::{Credential, CredentialStore, HttpRefresh, RefreshCoordinator};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::sinks::{LogNotifier, LoginRedirect};

/// How long in-flight requests may keep running after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pipeline: Arc<RequestPipeline>,
    metrics: ServiceMetrics,
    login: Arc<LoginRedirect>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", put(put_session_handler).delete(delete_session_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Wire store, refresh coordinator and transport into a pipeline.
fn build_pipeline(
    config: &Config,
    client: reqwest::Client,
    login: Arc<LoginRedirect>,
) -> RequestPipeline {
    let store = Arc::new(match &config.session.token {
        Some(token) => CredentialStore::with_credential(Credential::new(token.expose().clone())),
        None => CredentialStore::new(),
    });

    let refresh = RefreshCoordinator::new(
        store,
        Arc::new(HttpRefresh::new(
            client.clone(),
            &config.backend.base_url,
            &config.backend.refresh_path,
        )),
        login,
        config.refresh_timeout(),
    );

    let transport = HttpTransport::new(
        client,
        config.backend.base_url.clone(),
        config.request_timeout(),
    );

    RequestPipeline::new(
        Arc::new(transport),
        refresh,
        LoadingAggregator::new(config.debounce()),
        Arc::new(LogNotifier),
        config.pipeline_config(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting dashboard-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
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
        listen_addr = %config.gateway.listen_addr,
        backend = %config.backend.base_url,
        api_prefix = %config.backend.api_prefix,
        public_paths = config.pipeline.public_paths.len(),
        silent_paths = config.pipeline.silent_paths.len(),
        session = config.session.token.is_some(),
        "configuration loaded"
    );
    if config.session.token.is_none() {
        warn!("no session token configured, waiting for PUT /session");
    }

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let login = Arc::new(LoginRedirect::new(config.session.login_path.clone()));
    let pipeline = Arc::new(build_pipeline(&config, client, login.clone()));

    // Mirror the busy signal into logs and the pipeline_busy gauge
    let mut busy = pipeline.loading().subscribe();
    tokio::spawn(async move {
        while busy.changed().await.is_ok() {
            let value = *busy.borrow_and_update();
            metrics::set_busy(value);
            debug!(busy = value, "loading state changed");
        }
    });

    let service_metrics = ServiceMetrics::new();
    let app_state = AppState {
        pipeline,
        metrics: service_metrics.clone(),
        login,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown: stop accepting on SIGTERM/SIGINT, then give in-flight
    // requests DRAIN_TIMEOUT (counted from the signal) to finish.
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
            let remaining = service_metrics.in_flight.load(Ordering::Relaxed);
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

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Health endpoint: busy signal, session state, uptime, requests served.
async fn health_handler(State(state): State<AppState>) -> Response {
    let session = if state.pipeline.store().is_active() {
        "active"
    } else {
        "expired"
    };

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "busy": state.pipeline.loading().is_busy(),
            "in_flight": state.metrics.in_flight.load(Ordering::Relaxed),
            "session": session,
            "refreshing": state.pipeline.refresh().is_refreshing(),
            "session_invalidations": state.login.invalidations(),
            "login_path": state.login.login_path(),
            "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
            "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
            "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
        }),
    )
}

/// Prometheus metrics endpoint. Returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[derive(Deserialize)]
struct SessionRequest {
    token: String,
}

/// Install a credential issued by the login surface.
async fn put_session_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = new_request_id();
    let token = match serde_json::from_slice::<SessionRequest>(&body) {
        Ok(request) => request.token.trim().to_string(),
        Err(e) => {
            return error::Error::InvalidRequest(format!("expected {{\"token\": \"...\"}}: {e}"))
                .into_response_with_id(&request_id);
        }
    };
    if token.is_empty() {
        return error::Error::InvalidRequest("token must not be empty".into())
            .into_response_with_id(&request_id);
    }
    if HeaderValue::from_str(&format!("Bearer {token}")).is_err() {
        return error::Error::InvalidRequest("token is not a valid header value".into())
            .into_response_with_id(&request_id);
    }

    let generation = state.pipeline.store().set(Credential::new(token));
    info!(generation, "session credential installed");
    json_response(
        StatusCode::OK,
        serde_json::json!({ "session": "active", "generation": generation }),
    )
}

/// Log out: drop the credential without firing the invalidation effect.
async fn delete_session_handler(State(state): State<AppState>) -> Response {
    let generation = state.pipeline.store().clear();
    info!(generation, "session credential cleared");
    json_response(
        StatusCode::OK,
        serde_json::json!({ "session": "expired", "generation": generation }),
    )
}

/// Catch-all handler that sends every other request through the pipeline.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::forward(&state.pipeline, &state.metrics, request, new_request_id()).await
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
