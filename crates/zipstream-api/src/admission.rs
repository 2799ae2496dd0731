//! Admission control: global concurrency cap and per-IP rate limiting.
//!
//! Both gates apply at request entry and fail fast — there is no queueing.
//! The global gate is a counted semaphore; the per-IP gate is a token
//! bucket (rate `RATE_LIMIT_PER_IP`/s, burst 1) created lazily per client.
//! Idle buckets are swept periodically so adversarial IP churn cannot grow
//! the map without bound.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::{Clock as _, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::metrics::ACTIVE_DOWNLOADS;

/// Buckets idle longer than this are dropped by the sweeper.
const BUCKET_IDLE_TTL: Duration = Duration::from_secs(600);

/// How often the sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Outcome of a per-IP rate check.
#[derive(Debug)]
pub enum RateDecision {
    /// A token was taken; proceed.
    Allowed,
    /// No token available; reject with 429.
    Limited {
        /// Seconds until the client may retry.
        retry_after_secs: u64,
    },
}

struct IpBucket {
    limiter: DirectLimiter,
    last_seen: Mutex<Instant>,
}

/// Per-IP token bucket map.
pub struct IpRateLimiter {
    quota: Quota,
    buckets: RwLock<HashMap<String, Arc<IpBucket>>>,
}

impl IpRateLimiter {
    /// Creates a limiter admitting `rate_per_second` tokens with burst 1.
    ///
    /// Returns `None` when the rate is zero or would not fit a quota
    /// (rate limiting disabled).
    #[must_use]
    pub fn new(rate_per_second: f64) -> Option<Self> {
        if rate_per_second <= 0.0 {
            return None;
        }
        let period = Duration::from_secs_f64(1.0 / rate_per_second);
        let quota = Quota::with_period(period)?.allow_burst(NonZeroU32::MIN);
        Some(Self {
            quota,
            buckets: RwLock::new(HashMap::new()),
        })
    }

    async fn bucket_for(&self, ip: &str) -> Arc<IpBucket> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(ip) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get(ip) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(IpBucket {
            limiter: RateLimiter::direct(self.quota),
            last_seen: Mutex::new(Instant::now()),
        });
        buckets.insert(ip.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Takes a token for `ip` without blocking.
    pub async fn check(&self, ip: &str) -> RateDecision {
        let bucket = self.bucket_for(ip).await;
        if let Ok(mut last_seen) = bucket.last_seen.lock() {
            *last_seen = Instant::now();
        }
        match bucket.limiter.check() {
            Ok(()) => RateDecision::Allowed,
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                RateDecision::Limited {
                    retry_after_secs: wait.as_secs().max(1),
                }
            }
        }
    }

    /// Drops buckets idle longer than the TTL. Returns how many were kept.
    pub async fn sweep_idle(&self) -> usize {
        self.sweep_older_than(BUCKET_IDLE_TTL).await
    }

    async fn sweep_older_than(&self, ttl: Duration) -> usize {
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, bucket| {
            bucket
                .last_seen
                .lock()
                .is_ok_and(|last_seen| last_seen.elapsed() < ttl)
        });
        buckets.len()
    }
}

/// Holds one admitted download; releases the slot and gauge on drop, on
/// every outcome including panics.
#[derive(Debug)]
pub struct DownloadSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl DownloadSlot {
    fn acquired(permit: Option<OwnedSemaphorePermit>) -> Self {
        metrics::gauge!(ACTIVE_DOWNLOADS).increment(1.0);
        Self { _permit: permit }
    }
}

impl Drop for DownloadSlot {
    fn drop(&mut self) {
        metrics::gauge!(ACTIVE_DOWNLOADS).decrement(1.0);
    }
}

/// The process-wide admission gates.
pub struct AdmissionController {
    slots: Option<Arc<Semaphore>>,
    rate: Option<Arc<IpRateLimiter>>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("global_cap", &self.slots.as_ref().map(|s| s.available_permits()))
            .field("rate_limited", &self.rate.is_some())
            .finish()
    }
}

impl AdmissionController {
    /// Creates the gates; a zero cap or rate disables the matching gate.
    #[must_use]
    pub fn new(max_active_downloads: usize, rate_limit_per_ip: f64) -> Self {
        Self {
            slots: (max_active_downloads > 0)
                .then(|| Arc::new(Semaphore::new(max_active_downloads))),
            rate: IpRateLimiter::new(rate_limit_per_ip).map(Arc::new),
        }
    }

    /// Tries to take a global download slot without blocking; `None` means
    /// the server is at capacity.
    #[must_use]
    pub fn try_acquire_slot(&self) -> Option<DownloadSlot> {
        match &self.slots {
            None => Some(DownloadSlot::acquired(None)),
            Some(slots) => Arc::clone(slots)
                .try_acquire_owned()
                .ok()
                .map(|permit| DownloadSlot::acquired(Some(permit))),
        }
    }

    /// Takes a per-IP token without blocking.
    pub async fn check_ip(&self, ip: &str) -> RateDecision {
        match &self.rate {
            None => RateDecision::Allowed,
            Some(rate) => rate.check(ip).await,
        }
    }

    /// Spawns the periodic idle-bucket sweeper.
    pub fn spawn_sweeper(&self) {
        let Some(rate) = self.rate.as_ref().map(Arc::clone) else {
            return;
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let kept = rate.sweep_idle().await;
                tracing::debug!(buckets = kept, "swept idle rate-limit buckets");
            }
        });
    }
}
