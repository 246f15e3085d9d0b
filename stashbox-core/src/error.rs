//! Classified error kinds surfaced by every cache backend.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cloneable wrapper around an underlying error.
///
/// A single backend failure must complete every waiter of a merged batch,
/// so the wrapped error is reference-counted and the whole [`CacheError`]
/// stays `Clone`.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl SharedError {
    /// Wraps an error for shared fan-out.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SharedError(Arc::new(err))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Error type for cache operations.
///
/// No stringly-typed errors cross the contract boundary; backend failures
/// carry the wrapped source error.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The requested key is absent or expired.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The cache has been disposed; no further operations are accepted.
    #[error("cache has been disposed")]
    Disposed,

    /// A caller-supplied argument is invalid (e.g. an empty key).
    #[error("invalid argument: {0}")]
    ArgumentInvalid(&'static str),

    /// A typed payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[source] SharedError),

    /// The underlying store rejected an operation.
    #[error("backend failure: {0}")]
    BackendFailure(#[source] SharedError),

    /// The payload protector rejected an operation (encrypted caches only).
    #[error("payload protection failed: {0}")]
    ProtectionFailed(#[source] SharedError),
}

impl CacheError {
    /// Wraps an underlying store error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::BackendFailure(SharedError::new(err))
    }

    /// Wraps a payload codec error.
    pub fn serialization<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::SerializationFailed(SharedError::new(err))
    }

    /// Wraps a payload protector error.
    pub fn protection<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::ProtectionFailed(SharedError::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_are_cloneable() {
        let err = CacheError::backend(std::io::Error::other("disk on fire"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn shared_error_preserves_display() {
        let shared = SharedError::new(std::io::Error::other("boom"));
        assert_eq!(shared.to_string(), "boom");
    }
}
