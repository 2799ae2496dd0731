//! Error types and result aliases for zipstream.
//!
//! The taxonomy matters operationally: `Transient` failures are retried and
//! may trip the circuit breaker, `Permanent` failures fail fast, `NotFound`
//! is only fatal when `IGNORE_MISSING` is off, and `CircuitOpen` is
//! transient to callers but never retried inside the object store.

use std::fmt;

/// The result type used throughout zipstream.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in zipstream backend operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested manifest or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A failure that is expected to resolve on retry (network, 5xx,
    /// throttling, attempt timeout).
    #[error("transient error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A failure that will not resolve on retry (authorization, invalid
    /// path, path traversal).
    #[error("permanent error: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The circuit breaker for the named backend is open; the call was
    /// rejected without invoking the backend.
    #[error("circuit breaker open for backend {backend}")]
    CircuitOpen {
        /// Name of the guarded backend.
        backend: String,
    },

    /// A manifest store failure (connection loss, query timeout). Surfaced
    /// as a 500, never retried by the lookup path.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid input or configuration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation was cancelled (client disconnect or request deadline).
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Creates a transient error with the given message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transient error with a source cause.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a permanent error with the given message.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a permanent error with a source cause.
    #[must_use]
    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a manifest store backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a manifest store backend error with a source cause.
    #[must_use]
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a not-found error for the given resource.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display) -> Self {
        Self::NotFound(resource.to_string())
    }

    /// Returns true when the error is worth retrying.
    ///
    /// `CircuitOpen` is deliberately excluded: retrying a fast-failed call
    /// inside the object store would defeat the breaker.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true when the error is transient from the caller's point of
    /// view (including breaker rejections).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::CircuitOpen { .. })
    }

    /// Returns true for missing manifests or objects.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true when the error indicates a backend fault for circuit
    /// breaker accounting.
    ///
    /// `NotFound` is excluded: the backend answered, the key just does not
    /// exist. Cancellations are excluded: the caller went away.
    #[must_use]
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Permanent { .. } | Self::Backend { .. }
        )
    }
}
