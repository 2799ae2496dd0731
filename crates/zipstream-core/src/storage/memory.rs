//! In-memory object backend for testing.
//!
//! Thread-safe via `RwLock`. Not suitable for production. Supports failure
//! injection so retry, breaker, and partial-download paths can be exercised
//! without a real backend.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ObjectBackend, ObjectReader};
use crate::error::{Error, Result};

/// In-memory object backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<(String, String), Bytes>>>,
    transient_failures: Arc<AtomicU32>,
    unhealthy: Arc<AtomicU32>,
}

impl MemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object under `(bucket, key)`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects
            .write()
            .expect("memory backend lock poisoned")
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Makes the next `n` calls to [`ObjectBackend::open`] fail with a
    /// transient error before any lookup happens.
    pub fn inject_transient_failures(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Makes [`ObjectBackend::health`] report unhealthy when set.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(u32::from(unhealthy), Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let remaining = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(Error::transient("injected failure"));
        }

        let objects = self
            .objects
            .read()
            .map_err(|_| Error::backend("memory backend lock poisoned"))?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|body| Box::new(Cursor::new(body.to_vec())) as ObjectReader)
            .ok_or_else(|| Error::not_found(format!("{bucket}/{key}")))
    }

    async fn health(&self) -> Result<()> {
        if self.unhealthy.load(Ordering::SeqCst) != 0 {
            return Err(Error::transient("injected unhealthy state"));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
