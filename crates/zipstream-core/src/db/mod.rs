//! Manifest lookup backends.
//!
//! Two families behind one trait: tabular (Postgres/MySQL over `sqlx`) and
//! key-value (Redis). Lookup failures split into `NotFound` (the id does not
//! exist, a 404) and `Backend` (the store is broken, a 500, never retried by
//! the request path).

pub mod kv;
pub mod tabular;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::manifest::DownloadManifest;

pub use kv::KvStore;
pub use tabular::TabularStore;

/// A manifest lookup backend.
#[async_trait]
pub trait ManifestStore: Send + Sync + 'static {
    /// Looks up one manifest by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids and [`Error::Backend`]
    /// for store faults (timeouts, connection loss, malformed records).
    async fn lookup(&self, id: &str) -> Result<DownloadManifest>;

    /// Lightweight connectivity probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unreachable.
    async fn health(&self) -> Result<()>;

    /// Backend kind label used in metrics (`postgres`, `mysql`, `redis`).
    fn kind(&self) -> &'static str;
}

/// Supported manifest store engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// PostgreSQL (tabular family).
    Postgres,
    /// MySQL (tabular family).
    Mysql,
    /// Redis (key-value family).
    Redis,
}

impl Engine {
    /// Infers the engine from a connection URL scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for unsupported schemes.
    pub fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "redis" | "rediss" => Ok(Self::Redis),
            other => Err(Error::InvalidInput(format!(
                "unsupported database engine: {other}"
            ))),
        }
    }

    /// Metric/log label for this engine.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
        }
    }
}

/// Connection settings for a manifest store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection URL (engine inferred from the scheme unless overridden).
    pub url: String,
    /// Selected engine.
    pub engine: Engine,
    /// Table holding manifests (tabular family).
    pub table: String,
    /// Name of the id column (tabular family).
    pub id_field: String,
    /// Key prefix prepended to ids (key-value family).
    pub key_prefix: String,
    /// Connection pool size.
    pub max_connections: u32,
    /// Per-lookup deadline.
    pub query_timeout: Duration,
}

/// Connects the configured manifest store and verifies its schema.
///
/// # Errors
///
/// Returns [`Error::Backend`] when the store is unreachable and
/// [`Error::InvalidInput`] when required columns are missing.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn ManifestStore>> {
    match config.engine {
        Engine::Postgres | Engine::Mysql => {
            Ok(Arc::new(TabularStore::connect(config).await?))
        }
        Engine::Redis => Ok(Arc::new(KvStore::connect(config).await?)),
    }
}
