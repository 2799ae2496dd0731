//! Metrics registration and instrumentation.
//!
//! All metric names are part of the service's observable contract. They are
//! created once at startup with bucket layouts spanning the operational
//! ranges (seconds-to-half-hour requests, KiB-to-tens-of-GiB transfers) and
//! updated from the owning components.

use std::sync::OnceLock;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// ============================================================================
// Metric Names
// ============================================================================

/// HTTP requests on the download route, by status code.
pub const REQUESTS_TOTAL: &str = "requests_total";

/// Download attempts by outcome (completed, partial, failed).
pub const DOWNLOADS_TOTAL: &str = "downloads_total";

/// Per-object fetch outcomes (success, missing, error).
pub const FILES_FETCH_TOTAL: &str = "files_fetch_total";

/// Missing objects encountered across all downloads.
pub const MISSING_FILES_TOTAL: &str = "missing_files_total";

/// Failed signature verifications.
pub const SIGNATURE_FAILURES_TOTAL: &str = "signature_failures_total";

/// Requests rejected because their expiry passed.
pub const EXPIRED_REQUESTS_TOTAL: &str = "expired_requests_total";

/// Callback deliveries by terminal status (success, failure).
pub const CALLBACKS_TOTAL: &str = "callbacks_total";

/// Callback retry attempts.
pub const CALLBACK_RETRIES_TOTAL: &str = "callback_retries_total";

/// Clients that disconnected mid-download.
pub const CLIENT_DISCONNECTS_TOTAL: &str = "client_disconnects_total";

/// Failed dependency health checks, by component.
pub const HEALTH_CHECKS_FAILED_TOTAL: &str = "health_checks_failed_total";

/// Downloads currently streaming.
pub const ACTIVE_DOWNLOADS: &str = "active_downloads";

/// Dependency health (1=healthy, 0=unhealthy), by component.
pub const HEALTH_STATUS: &str = "health_status";

/// Download duration in seconds.
pub const REQUEST_DURATION: &str = "request_duration_seconds";

/// Compressed bytes written to clients per download.
pub const OUTGOING_BYTES: &str = "outgoing_bytes";

/// Uncompressed bytes read from storage per download.
pub const INCOMING_BYTES: &str = "incoming_bytes";

/// Compressed/uncompressed ratio per download.
pub const COMPRESSION_RATIO: &str = "compression_ratio";

/// Objects requested per download.
pub const FILES_REQUESTED: &str = "files_requested";

/// Objects successfully archived per download.
pub const FILES_SUCCESS: &str = "files_success";

/// Resident set size of the process.
pub const MEMORY_RESIDENT_BYTES: &str = "memory_resident_bytes";

/// Live tasks on the async runtime.
pub const RUNTIME_ALIVE_TASKS: &str = "runtime_alive_tasks";

// ============================================================================
// Recorder
// ============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    let mut buckets = Vec::with_capacity(count);
    let mut value = start;
    for _ in 0..count {
        buckets.push(value);
        value *= factor;
    }
    buckets
}

/// Installs the global Prometheus recorder and registers every metric.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Panics
///
/// Panics if the recorder cannot be installed. Metrics are part of the
/// service contract; the server must not start without them.
#[allow(clippy::panic, clippy::too_many_lines)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let file_counts = [
                1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 5000.0,
            ];
            let byte_buckets = exponential_buckets(1024.0, 2.0, 35);

            let builder = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Full(REQUEST_DURATION.to_string()),
                    &[
                        1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
                    ],
                )
                .expect("request duration buckets")
                .set_buckets_for_metric(Matcher::Full(OUTGOING_BYTES.to_string()), &byte_buckets)
                .expect("outgoing byte buckets")
                .set_buckets_for_metric(Matcher::Full(INCOMING_BYTES.to_string()), &byte_buckets)
                .expect("incoming byte buckets")
                .set_buckets_for_metric(
                    Matcher::Full(COMPRESSION_RATIO.to_string()),
                    &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0],
                )
                .expect("compression ratio buckets")
                .set_buckets_for_metric(Matcher::Full(FILES_REQUESTED.to_string()), &file_counts)
                .expect("files requested buckets")
                .set_buckets_for_metric(Matcher::Full(FILES_SUCCESS.to_string()), &file_counts)
                .expect("files success buckets")
                .set_buckets_for_metric(
                    Matcher::Full(zipstream_core::metrics::DATABASE_QUERY_DURATION.to_string()),
                    &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
                )
                .expect("database query buckets")
                .set_buckets_for_metric(
                    Matcher::Full(zipstream_core::metrics::STORAGE_FETCH_DURATION.to_string()),
                    &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
                )
                .expect("storage fetch buckets");

            let handle = builder
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

            describe_counter!(REQUESTS_TOTAL, "HTTP requests by status code");
            describe_counter!(DOWNLOADS_TOTAL, "Download attempts by outcome");
            describe_counter!(FILES_FETCH_TOTAL, "Per-object fetch outcomes");
            describe_counter!(MISSING_FILES_TOTAL, "Missing objects encountered");
            describe_counter!(SIGNATURE_FAILURES_TOTAL, "Failed signature verifications");
            describe_counter!(EXPIRED_REQUESTS_TOTAL, "Requests rejected as expired");
            describe_counter!(CALLBACKS_TOTAL, "Callback deliveries by terminal status");
            describe_counter!(CALLBACK_RETRIES_TOTAL, "Callback retry attempts");
            describe_counter!(CLIENT_DISCONNECTS_TOTAL, "Clients lost mid-download");
            describe_counter!(
                HEALTH_CHECKS_FAILED_TOTAL,
                "Failed dependency health checks by component"
            );
            describe_gauge!(ACTIVE_DOWNLOADS, "Downloads currently streaming");
            describe_gauge!(HEALTH_STATUS, "Dependency health (1=healthy, 0=unhealthy)");
            describe_gauge!(MEMORY_RESIDENT_BYTES, "Resident set size of the process");
            describe_gauge!(RUNTIME_ALIVE_TASKS, "Live tasks on the async runtime");
            describe_histogram!(REQUEST_DURATION, "Download duration in seconds");
            describe_histogram!(OUTGOING_BYTES, "Compressed bytes written per download");
            describe_histogram!(INCOMING_BYTES, "Uncompressed bytes read per download");
            describe_histogram!(COMPRESSION_RATIO, "Compressed/uncompressed ratio");
            describe_histogram!(FILES_REQUESTED, "Objects requested per download");
            describe_histogram!(FILES_SUCCESS, "Objects successfully archived per download");

            zipstream_core::metrics::register_metrics();

            tracing::info!("prometheus metrics recorder initialized");
            handle
        })
        .clone()
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// ============================================================================
// Middleware and Handlers
// ============================================================================

/// Route-scoped middleware recording `requests_total{status}` for the
/// download route.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();
    counter!(REQUESTS_TOTAL, "status" => status).increment(1);
    response
}

/// Handler for the `/metrics` endpoint.
///
/// Optionally gated by HTTP Basic Auth when credentials are configured.
pub async fn serve_metrics(
    credentials: Option<(String, String)>,
    authorization: Option<&str>,
) -> Response {
    if let Some((username, password)) = credentials {
        if !basic_auth_matches(authorization, &username, &password) {
            return (
                StatusCode::UNAUTHORIZED,
                [("www-authenticate", "Basic realm=\"metrics\"")],
                "Unauthorized",
            )
                .into_response();
        }
    }

    prometheus_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Metrics not initialized".to_string(),
            )
                .into_response()
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; charset=utf-8")],
                handle.render(),
            )
                .into_response()
        },
    )
}

fn basic_auth_matches(authorization: Option<&str>, username: &str, password: &str) -> bool {
    let Some(encoded) = authorization.and_then(|v| v.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    user == username && pass == password
}

// ============================================================================
// Runtime Gauges
// ============================================================================

/// Spawns the collector that refreshes runtime memory and task gauges.
pub fn spawn_runtime_metrics_collector() {
    tokio::spawn(async {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            if let Some(resident) = resident_memory_bytes() {
                metrics::gauge!(MEMORY_RESIDENT_BYTES).set(resident);
            }
            let tasks = tokio::runtime::Handle::current().metrics().num_alive_tasks();
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(RUNTIME_ALIVE_TASKS).set(tasks as f64);
        }
    });
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<f64> {
    None
}
