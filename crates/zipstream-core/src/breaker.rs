//! Circuit breaker guarding backend calls.
//!
//! Finite state machine per named backend:
//!
//! - `closed`: calls pass through; consecutive failures are counted and a
//!   success resets the count. Reaching the threshold opens the breaker.
//! - `open`: calls fail fast with [`Error::CircuitOpen`] until the open
//!   timeout elapses, then the breaker goes half-open.
//! - `half_open`: at most `max_probes` concurrent calls are admitted; a
//!   probe success closes the breaker, any probe failure reopens it with a
//!   fresh timestamp.
//!
//! State, counters, and timestamp are updated together under one mutex, and
//! every transition publishes the numeric state (0/1/2) to the
//! `circuit_breaker_state{backend}` gauge.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::metrics::CIRCUIT_BREAKER_STATE;

/// Circuit breaker tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting probes.
    pub open_timeout: Duration,
    /// Maximum concurrent probe calls while half-open.
    pub max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            max_probes: 2,
        }
    }
}

/// Breaker states, in gauge encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Testing whether the backend recovered.
    HalfOpen,
}

impl BreakerState {
    fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    in_flight_probes: u32,
}

/// A circuit breaker for one named backend.
///
/// Process-wide and shared; all mutation happens atomically under the
/// internal mutex.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker for the given backend name.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        publish_state(&name, BreakerState::Closed);
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                in_flight_probes: 0,
            }),
        }
    }

    /// Returns the backend name this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Runs `op` through the breaker.
    ///
    /// # Errors
    ///
    /// Fails fast with [`Error::CircuitOpen`] without invoking `op` when the
    /// breaker is open or the half-open probe budget is exhausted; otherwise
    /// propagates the result of `op`.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let as_probe = self.admit()?;
        let result = op().await;
        match &result {
            Ok(_) => self.record_success(as_probe),
            Err(err) if err.counts_against_breaker() => self.record_failure(as_probe),
            // The backend answered (missing key) or the caller went away.
            Err(_) => self.record_success(as_probe),
        }
        result
    }

    /// Admits a call, returning whether it runs as a half-open probe.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed < self.config.open_timeout {
                    return Err(Error::CircuitOpen {
                        backend: self.name.clone(),
                    });
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.in_flight_probes = 1;
                Ok(true)
            }
            BreakerState::HalfOpen => {
                if inner.in_flight_probes >= self.config.max_probes {
                    return Err(Error::CircuitOpen {
                        backend: self.name.clone(),
                    });
                }
                inner.in_flight_probes += 1;
                Ok(true)
            }
        }
    }

    fn record_success(&self, as_probe: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if as_probe {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Closed);
                inner.consecutive_failures = 0;
                inner.in_flight_probes = 0;
                inner.opened_at = None;
                tracing::info!(backend = %self.name, "circuit breaker closed");
            }
            // A call admitted before the breaker opened finished late.
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self, as_probe: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if as_probe {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        backend = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
                inner.opened_at = Some(Instant::now());
                inner.in_flight_probes = 0;
                tracing::warn!(backend = %self.name, "probe failed, circuit breaker reopened");
            }
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        inner.state = to;
        publish_state(&self.name, to);
    }
}

fn publish_state(name: &str, state: BreakerState) {
    metrics::gauge!(CIRCUIT_BREAKER_STATE, "backend" => name.to_string()).set(state.as_gauge());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout: Duration, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "storage",
            BreakerConfig {
                failure_threshold: threshold,
                open_timeout: timeout,
                max_probes: probes,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err::<(), _>(Error::transient("boom")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let b = breaker(3, Duration::from_secs(60), 1);

        for _ in 0..3 {
            assert!(fail(&b).await.is_err());
        }
        assert_eq!(b.state(), BreakerState::Open);

        // Next call fails fast without invoking the inner function.
        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let err = b
            .call(|| {
                let invoked = std::sync::Arc::clone(&invoked);
                async move {
                    invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .err()
            .expect("expected failure");
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, Duration::from_secs(60), 1);

        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert!(succeed(&b).await.is_ok());
        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let b = breaker(1, Duration::from_millis(20), 1);

        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // First call after the timeout runs as a probe and closes on success.
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let b = breaker(1, Duration::from_millis(20), 1);

        assert!(fail(&b).await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), BreakerState::Open);

        // Reopened with a fresh timestamp, so calls fail fast again.
        let err = succeed(&b).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_half_open_bounds_concurrent_probes() {
        let b = std::sync::Arc::new(breaker(1, Duration::from_millis(10), 1));

        assert!(fail(&b).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (unblock_tx, unblock_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = std::sync::Arc::clone(&b);
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = unblock_rx.await;
                    Ok(())
                })
                .await
            })
        };

        // Give the probe a moment to occupy the single probe slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = succeed(&b).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));

        let _ = unblock_tx.send(());
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_not_found_does_not_trip() {
        let b = breaker(2, Duration::from_secs(60), 1);

        for _ in 0..5 {
            let err = b
                .call(|| async { Err::<(), _>(Error::not_found("missing.txt")) })
                .await
                .unwrap_err();
            assert!(err.is_not_found());
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
