//! Metric names owned by the backend layer.
//!
//! The metrics are recorded where the work happens (storage, stores,
//! breaker) against the global recorder installed by the API crate, which
//! calls [`register_metrics`] once at startup.

use metrics::{describe_gauge, describe_histogram};

/// Storage fetch latency histogram, labeled by backend kind and result.
pub const STORAGE_FETCH_DURATION: &str = "storage_fetch_duration_seconds";

/// Manifest lookup latency histogram, labeled by backend kind.
pub const DATABASE_QUERY_DURATION: &str = "database_query_duration_seconds";

/// Gauge of object fetches currently in flight.
pub const ACTIVE_FILE_FETCHES: &str = "active_file_fetches";

/// Circuit breaker state gauge (0=closed, 1=open, 2=half-open), labeled by
/// backend name.
pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";

/// Registers descriptions for the backend-owned metrics.
pub fn register_metrics() {
    describe_histogram!(
        STORAGE_FETCH_DURATION,
        "Storage fetch duration per file in seconds"
    );
    describe_histogram!(
        DATABASE_QUERY_DURATION,
        "Manifest store query duration in seconds"
    );
    describe_gauge!(ACTIVE_FILE_FETCHES, "Number of currently active file fetches");
    describe_gauge!(
        CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0=closed, 1=open, 2=half-open)"
    );
}
