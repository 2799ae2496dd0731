//! Local filesystem object backend.
//!
//! The bucket is an optional path prefix under the configured base
//! directory. Paths are normalized lexically before any file descriptor is
//! opened; anything resolving outside the base directory is rejected as a
//! permanent path traversal error.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::{ObjectBackend, ObjectReader};
use crate::error::{Error, Result};

/// Filesystem-backed object storage rooted at a base directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when `base` does not exist or is not
    /// a directory.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        let meta = std::fs::metadata(&base).map_err(|e| {
            Error::InvalidInput(format!("storage path {}: {e}", base.display()))
        })?;
        if !meta.is_dir() {
            return Err(Error::InvalidInput(format!(
                "storage path {} is not a directory",
                base.display()
            )));
        }
        let base = base
            .canonicalize()
            .map_err(|e| Error::InvalidInput(format!("storage path {}: {e}", base.display())))?;
        Ok(Self { base })
    }

    /// Resolves `{base}/{bucket}/{key}` lexically, rejecting any `.`/`..`
    /// combination (or absolute component) that escapes the base directory.
    ///
    /// Purely lexical on purpose: no filesystem access happens before the
    /// check, so a traversal attempt never opens a descriptor.
    fn resolve(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut relative = PathBuf::new();
        for part in [bucket, key] {
            if part.is_empty() {
                continue;
            }
            for component in Path::new(part).components() {
                match component {
                    Component::Normal(segment) => relative.push(segment),
                    Component::CurDir => {}
                    Component::ParentDir => {
                        if !relative.pop() {
                            return Err(traversal_error(bucket, key));
                        }
                    }
                    Component::RootDir | Component::Prefix(_) => {
                        return Err(traversal_error(bucket, key));
                    }
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(traversal_error(bucket, key));
        }
        Ok(self.base.join(relative))
    }
}

fn traversal_error(bucket: &str, key: &str) -> Error {
    Error::permanent(format!(
        "path traversal attempt detected: bucket={bucket}, key={key}"
    ))
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    async fn open(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let path = self.resolve(bucket, key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found(format!("{bucket}/{key}")))
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(Error::permanent_with_source(
                format!("permission denied opening {}", path.display()),
                e,
            )),
            Err(e) => Err(Error::transient_with_source(
                format!("failed to open {}", path.display()),
                e,
            )),
        }
    }

    async fn health(&self) -> Result<()> {
        tokio::fs::metadata(&self.base).await.map_err(|e| {
            Error::transient_with_source(
                format!("base path {} unavailable", self.base.display()),
                e,
            )
        })?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
