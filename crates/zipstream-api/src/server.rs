//! Server wiring: shared state, router, health endpoint, shutdown.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use zipstream_core::breaker::CircuitBreaker;
use zipstream_core::db::ManifestStore;
use zipstream_core::storage::{ObjectBackend, ObjectStore};
use zipstream_core::{Error, Result};

use crate::admission::AdmissionController;
use crate::assembler::Assembler;
use crate::callback::CallbackDispatcher;
use crate::config::Config;
use crate::context;
use crate::download;
use crate::metrics::{HEALTH_CHECKS_FAILED_TOTAL, HEALTH_STATUS};
use crate::signature::Verifier;

/// Per-dependency deadline inside the health handler.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Name of the breaker guarding the object storage backend.
const STORAGE_BREAKER: &str = "storage";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
///
/// Everything here is process-wide: pools, clients, and breaker state are
/// constructed once at startup and never per request.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Manifest lookup backend.
    pub manifests: Arc<dyn ManifestStore>,
    /// Breaker-guarded object fetch front.
    pub storage: Arc<ObjectStore>,
    /// The archive assembler.
    pub assembler: Assembler,
    /// Global and per-IP admission gates.
    pub admission: AdmissionController,
    /// Signature/expiry verifier.
    pub verifier: Verifier,
    /// Outcome callback dispatcher.
    pub callbacks: CallbackDispatcher,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("manifests", &self.manifests.kind())
            .field("storage", &self.storage.kind())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires the shared state from configuration and connected backends.
    #[must_use]
    pub fn new(
        config: Config,
        manifests: Arc<dyn ManifestStore>,
        backend: Arc<dyn ObjectBackend>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(STORAGE_BREAKER, config.breaker_config()));
        let storage = Arc::new(ObjectStore::new(backend, breaker, config.retry_policy()));
        let assembler = Assembler::new(
            Arc::clone(&storage),
            config.max_concurrent_fetches,
            config.ignore_missing,
        );
        let admission =
            AdmissionController::new(config.max_active_downloads, config.rate_limit_per_ip);
        let verifier = Verifier::new(config.signing_secret.clone(), config.enforce_signing);
        let callbacks =
            CallbackDispatcher::new(config.callback_max_retries, config.callback_retry_delay);

        Self {
            config,
            manifests,
            storage,
            assembler,
            admission,
            verifier,
            callbacks,
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    checks: BTreeMap<String, String>,
    version: String,
}

/// Dependency health: 200 when both the manifest store and the object
/// backend probe healthy, 503 otherwise.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let mut checks = BTreeMap::new();
    let mut healthy = true;

    for (component, ok) in [
        (
            "database",
            probe(state.manifests.health()).await,
        ),
        ("storage", probe(state.storage.health()).await),
    ] {
        metrics::gauge!(HEALTH_STATUS, "component" => component).set(if ok { 1.0 } else { 0.0 });
        if ok {
            checks.insert(component.to_string(), "ok".to_string());
        } else {
            checks.insert(component.to_string(), "unavailable".to_string());
            metrics::counter!(HEALTH_CHECKS_FAILED_TOTAL, "component" => component).increment(1);
            tracing::warn!(component, "health check failed");
            healthy = false;
        }
    }

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        checks,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn probe(check: impl std::future::Future<Output = Result<()>>) -> bool {
    matches!(
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check).await,
        Ok(Ok(()))
    )
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let credentials = state
        .config
        .metrics_username
        .clone()
        .zip(state.config.metrics_password.clone());
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());
    crate::metrics::serve_metrics(credentials, authorization).await
}

// ============================================================================
// Server
// ============================================================================

/// The zipstream HTTP server.
pub struct Server {
    state: Arc<AppState>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("state", &self.state).finish()
    }
}

impl Server {
    /// Creates a server around connected backends.
    #[must_use]
    pub fn new(
        config: Config,
        manifests: Arc<dyn ManifestStore>,
        backend: Arc<dyn ObjectBackend>,
    ) -> Self {
        Self {
            state: Arc::new(AppState::new(config, manifests, backend)),
        }
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        let track = middleware::from_fn(crate::metrics::track_requests);

        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_endpoint))
            .route("/", get(download::missing_id).route_layer(track.clone()))
            .route("/:id", get(download::download).route_layer(track))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(context::request_id_middleware))
            .with_state(Arc::clone(&self.state))
    }

    /// Router for integration tests; identical wiring, no listener.
    #[doc(hidden)]
    #[must_use]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// On SIGINT/SIGTERM the listener stops accepting and in-flight
    /// requests get a bounded grace window before the process exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn serve(&self) -> Result<()> {
        crate::metrics::init_metrics();
        crate::metrics::spawn_runtime_metrics_collector();
        self.state.admission.spawn_sweeper();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::InvalidInput(format!("failed to bind to {addr}: {e}")))?;

        tracing::info!(port = self.state.config.port, "starting zipstream server");

        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                tracing::info!("shutdown signal received, draining connections");
                shutdown.cancel();
            });
        }

        let app = self
            .create_router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let graceful = {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        };
        let serve = axum::serve(listener, app).with_graceful_shutdown(graceful);

        tokio::select! {
            result = async { serve.await } => {
                result.map_err(|e| Error::InvalidInput(format!("server error: {e}")))?;
                tracing::info!("server stopped");
            }
            () = async {
                shutdown.cancelled().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                tracing::warn!(
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "drain window elapsed, forcing shutdown"
                );
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
