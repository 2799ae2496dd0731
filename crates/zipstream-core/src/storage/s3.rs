//! S3-compatible object backend.
//!
//! Built on `object_store`, which scopes a client to one bucket. Manifests
//! name their bucket per request, so clients are built lazily from the
//! shared credentials and cached per bucket; request code never constructs
//! clients itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt as _;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore as _;
use tokio::sync::RwLock;

use super::{ObjectBackend, ObjectReader};
use crate::error::{Error, Result};

/// Key used by the health probe; a NotFound answer still proves
/// connectivity and credentials.
const HEALTH_PROBE_KEY: &str = "__zipstream/health-probe";

/// Connection options shared by every bucket client.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    /// Custom endpoint (MinIO, Wasabi, etc.); AWS when unset.
    pub endpoint: Option<String>,
    /// Region; many S3-compatible providers accept anything here.
    pub region: String,
    /// Static access key id, typical for S3-compatible providers.
    pub access_key_id: Option<String>,
    /// Static secret access key.
    pub secret_access_key: Option<String>,
    /// Use path-style addressing instead of virtual-hosted style.
    pub use_path_style: bool,
}

/// S3-compatible object storage with per-bucket client caching.
pub struct S3Backend {
    options: S3Options,
    clients: RwLock<HashMap<String, Arc<AmazonS3>>>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("endpoint", &self.options.endpoint)
            .field("region", &self.options.region)
            .field("use_path_style", &self.options.use_path_style)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Creates a backend from shared connection options.
    #[must_use]
    pub fn new(options: S3Options) -> Self {
        Self {
            options,
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn build_client(&self, bucket: &str) -> Result<Arc<AmazonS3>> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(self.options.region.as_str())
            .with_virtual_hosted_style_request(!self.options.use_path_style);

        if let Some(endpoint) = self.options.endpoint.as_deref() {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let (Some(key), Some(secret)) = (
            self.options.access_key_id.as_deref(),
            self.options.secret_access_key.as_deref(),
        ) {
            builder = builder.with_access_key_id(key).with_secret_access_key(secret);
        }

        builder
            .build()
            .map(Arc::new)
            .map_err(|e| Error::permanent_with_source(format!("s3 client for bucket {bucket}"), e))
    }

    async fn client_for(&self, bucket: &str) -> Result<Arc<AmazonS3>> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(bucket) {
                return Ok(Arc::clone(client));
            }
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(bucket) {
            return Ok(Arc::clone(client));
        }
        let client = self.build_client(bucket)?;
        clients.insert(bucket.to_string(), Arc::clone(&client));
        Ok(client)
    }

    fn classify(bucket: &str, key: &str, err: object_store::Error) -> Error {
        match err {
            object_store::Error::NotFound { .. } => Error::not_found(format!("{bucket}/{key}")),
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::InvalidPath { .. } => Error::permanent_with_source(
                format!("s3 rejected {bucket}/{key}"),
                err,
            ),
            other => {
                Error::transient_with_source(format!("s3 fetch failed for {bucket}/{key}"), other)
            }
        }
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        if bucket.is_empty() {
            return Err(Error::permanent("s3 fetch requires a bucket name"));
        }
        let client = self.client_for(bucket).await?;
        let path = ObjectPath::from(key);

        let result = client
            .get(&path)
            .await
            .map_err(|e| Self::classify(bucket, key, e))?;

        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(tokio_util::io::StreamReader::new(stream)))
    }

    async fn health(&self) -> Result<()> {
        // Probe any cached bucket client; before any download has run there
        // is nothing to check against, which counts as healthy.
        let client = {
            let clients = self.clients.read().await;
            clients.values().next().map(Arc::clone)
        };
        let Some(client) = client else {
            return Ok(());
        };

        match client.head(&ObjectPath::from(HEALTH_PROBE_KEY)).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::transient_with_source("s3 connectivity check failed", e)),
        }
    }

    fn kind(&self) -> &'static str {
        "s3"
    }
}
