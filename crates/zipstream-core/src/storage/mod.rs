//! Object storage backends and the retrying fetch front.
//!
//! Backends implement the single-attempt [`ObjectBackend`] contract;
//! [`ObjectStore`] adds what every caller needs on top: per-attempt
//! timeouts, transient-only retries with exponential backoff, cancellation,
//! circuit breaker routing, and fetch metrics. Request code only ever talks
//! to [`ObjectStore`].

pub mod local;
pub mod memory;
pub mod s3;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result};
use crate::metrics::{ACTIVE_FILE_FETCHES, STORAGE_FETCH_DURATION};

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use s3::{S3Backend, S3Options};

/// A streaming object body.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// One object storage backend (S3-compatible, local filesystem, memory).
///
/// `open` is a single attempt with no retry or timeout policy of its own;
/// [`ObjectStore`] layers those on uniformly.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Opens one object's byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for missing objects, [`Error::Permanent`]
    /// for faults that will not resolve on retry (authorization, path
    /// traversal), and [`Error::Transient`] for everything else.
    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader>;

    /// Lightweight connectivity probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable.
    async fn health(&self) -> Result<()>;

    /// Backend kind label used in metrics (`s3`, `local`, `memory`).
    fn kind(&self) -> &'static str;
}

/// Retry tuning for object fetches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first (0 = single attempt).
    pub max_retries: u32,
    /// Base delay; attempt n sleeps `base_delay * 2^(n-1)`.
    pub base_delay: Duration,
    /// Deadline applied to each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// The process-wide object fetch front: backend + breaker + retry policy.
pub struct ObjectStore {
    backend: Arc<dyn ObjectBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("backend", &self.backend.kind())
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ObjectStore {
    /// Wires a backend behind the given breaker and retry policy.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            breaker,
            retry,
        }
    }

    /// Backend kind label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Fetches one object through the breaker with retries.
    ///
    /// The whole retry loop runs as a single breaker call so an exhausted
    /// retry budget counts as one backend failure, and a breaker rejection
    /// is never retried here.
    ///
    /// # Errors
    ///
    /// Propagates the terminal classification: [`Error::NotFound`],
    /// [`Error::Permanent`], [`Error::Transient`] (retries exhausted),
    /// [`Error::CircuitOpen`], or [`Error::Cancelled`].
    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectReader> {
        let start = Instant::now();
        let gauge = metrics::gauge!(ACTIVE_FILE_FETCHES);
        gauge.increment(1.0);

        let result = self
            .breaker
            .call(|| self.fetch_with_retries(bucket, key, cancel))
            .await;

        gauge.decrement(1.0);
        let label = if result.is_ok() { "success" } else { "error" };
        metrics::histogram!(
            STORAGE_FETCH_DURATION,
            "backend" => self.backend.kind(),
            "result" => label,
        )
        .record(start.elapsed().as_secs_f64());

        result
    }

    /// Delegates the connectivity probe to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unreachable.
    pub async fn health(&self) -> Result<()> {
        self.backend.health().await
    }

    async fn fetch_with_retries(
        &self,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectReader> {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let delay = self.retry.base_delay * 2u32.saturating_pow(attempt - 1);
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                res = tokio::time::timeout(
                    self.retry.attempt_timeout,
                    self.backend.open(bucket, key),
                ) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::transient(format!(
                        "fetch attempt timed out after {:?}",
                        self.retry.attempt_timeout
                    ))),
                },
            };

            match outcome {
                Ok(reader) => return Ok(reader),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        bucket,
                        key,
                        attempt,
                        error = %err,
                        "retrying object fetch"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};

    fn store_with(backend: MemoryBackend, retry: RetryPolicy) -> ObjectStore {
        ObjectStore::new(
            Arc::new(backend),
            Arc::new(CircuitBreaker::new("storage", BreakerConfig::default())),
            retry,
        )
    }

    fn quick_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        use tokio::io::AsyncReadExt as _;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_get_returns_object_bytes() {
        let backend = MemoryBackend::new();
        backend.insert("b", "a.txt", b"hello".as_slice());
        let store = store_with(backend, quick_retry(0));

        let reader = store
            .get("b", "a.txt", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(read_all(reader).await, b"hello");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = MemoryBackend::new();
        backend.insert("b", "a.txt", b"ok".as_slice());
        backend.inject_transient_failures(2);
        let store = store_with(backend, quick_retry(3));

        let reader = store
            .get("b", "a.txt", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(read_all(reader).await, b"ok");
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_surfaces_transient() {
        let backend = MemoryBackend::new();
        backend.insert("b", "a.txt", b"ok".as_slice());
        backend.inject_transient_failures(5);
        let store = store_with(backend, quick_retry(2));

        let err = store
            .get("b", "a.txt", &CancellationToken::new())
            .await
            .err()
            .expect("expected failure");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let backend = MemoryBackend::new();
        let store = store_with(backend, quick_retry(5));

        let err = store
            .get("b", "gone.txt", &CancellationToken::new())
            .await
            .err()
            .expect("expected failure");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_exhausted_retries_trip_breaker_once() {
        let backend = MemoryBackend::new();
        backend.insert("b", "a.txt", b"ok".as_slice());
        backend.inject_transient_failures(100);

        let breaker = Arc::new(CircuitBreaker::new(
            "storage",
            BreakerConfig {
                failure_threshold: 2,
                open_timeout: Duration::from_secs(60),
                max_probes: 1,
            },
        ));
        let store = ObjectStore::new(Arc::new(backend), Arc::clone(&breaker), quick_retry(1));
        let cancel = CancellationToken::new();

        // Each exhausted retry loop counts as one breaker failure.
        assert!(store.get("b", "a.txt", &cancel).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(store.get("b", "a.txt", &cancel).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = store.get("b", "a.txt", &cancel).await.err().expect("expected failure");
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let backend = MemoryBackend::new();
        backend.insert("b", "a.txt", b"ok".as_slice());
        backend.inject_transient_failures(100);
        let store = store_with(
            backend,
            RetryPolicy {
                max_retries: 50,
                base_delay: Duration::from_secs(10),
                attempt_timeout: Duration::from_secs(5),
            },
        );

        let cancel = CancellationToken::new();
        cancel.cancel();

        // First attempt fails, the backoff sleep observes cancellation.
        let err = store.get("b", "a.txt", &cancel).await.err().expect("expected failure");
        assert!(matches!(err, Error::Cancelled));
    }
}
