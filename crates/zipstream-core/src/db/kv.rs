//! Key-value manifest store (Redis).
//!
//! A single key `{prefix}{id}` holds a JSON document with the same field
//! names as the tabular columns; absent fields map to absence.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{ManifestStore, StoreConfig};
use crate::error::{Error, Result};
use crate::manifest::DownloadManifest;
use crate::metrics::DATABASE_QUERY_DURATION;

/// Manifest store backed by Redis.
pub struct KvStore {
    conn: ConnectionManager,
    key_prefix: String,
    query_timeout: Duration,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("key_prefix", &self.key_prefix)
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

impl KvStore {
    /// Connects and verifies reachability with a ping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] when the server is unreachable.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::backend_with_source("invalid redis url", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::backend_with_source("redis connect failed", e))?;

        let store = Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            query_timeout: config.query_timeout,
        };
        store.health().await?;
        Ok(store)
    }

    fn key_for(&self, id: &str) -> String {
        format!("{}{id}", self.key_prefix)
    }
}

#[async_trait]
impl ManifestStore for KvStore {
    async fn lookup(&self, id: &str) -> Result<DownloadManifest> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result = tokio::time::timeout(self.query_timeout, async {
            redis::cmd("GET")
                .arg(self.key_for(id))
                .query_async::<Option<String>>(&mut conn)
                .await
        })
        .await;
        metrics::histogram!(DATABASE_QUERY_DURATION, "backend" => self.kind())
            .record(start.elapsed().as_secs_f64());

        let document = match result {
            Ok(Ok(document)) => document,
            Ok(Err(e)) => return Err(Error::backend_with_source("manifest lookup failed", e)),
            Err(_) => {
                return Err(Error::backend(format!(
                    "manifest lookup timed out after {:?}",
                    self.query_timeout
                )))
            }
        };

        let Some(document) = document else {
            return Err(Error::not_found(format!("manifest {id}")));
        };
        DownloadManifest::from_json_document(id, &document)
    }

    async fn health(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(self.query_timeout, async {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map_err(|_| Error::backend("redis health probe timed out"))?
        .map_err(|e| Error::backend_with_source("redis health probe failed", e))?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}
