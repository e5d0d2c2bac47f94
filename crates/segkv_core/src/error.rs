//! Error types for the segment registry.
//!
//! Every caller-visible outcome maps onto a small vocabulary:
//!
//! - `Ok(..)` - the operation succeeded
//! - [`RegistryError::Busy`] - transient; retry with backoff
//! - [`RegistryError::Closed`] - the registry is no longer usable
//! - any other variant - an unrecoverable error
//!
//! Expected and transient conditions are always error *variants*; nothing
//! panics across the registry boundary. Internal cache-state violations,
//! by contrast, are programming errors and fail loudly.

use segkv_store::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors produced by the bounded concurrent cache.
///
/// Load failures are shared: every waiter blocked on the same load episode
/// observes the same captured error.
#[derive(Debug, Error)]
pub enum CacheError<E: std::error::Error + Send + Sync + 'static> {
    /// The entry is concurrently unloading; retry shortly.
    #[error("entry {key} is busy unloading")]
    Busy {
        /// The contended key.
        key: String,
    },

    /// The loader failed; the entry was removed so a later call may retry.
    #[error("load of {key} failed: {source}")]
    Load {
        /// The key whose load failed.
        key: String,
        /// The captured loader error, shared with all waiters.
        source: Arc<E>,
    },

    /// A synchronous unload failed; the entry is left stuck in its
    /// unloading state rather than risking a double-unload.
    #[error("unload of {key} failed: {source}")]
    Unload {
        /// The key whose unload failed.
        key: String,
        /// The unloader error.
        source: Arc<E>,
    },

    /// Draining did not settle within the configured deadline.
    #[error("drain timed out with {pending} entries still resident")]
    DrainTimedOut {
        /// Entries still present when the deadline expired.
        pending: usize,
    },
}

impl<E: std::error::Error + Send + Sync + 'static> CacheError<E> {
    /// Returns `true` for transient conditions worth retrying.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Errors that can occur in segment registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Transient contention; the caller should retry with backoff.
    #[error("registry busy: {context}")]
    Busy {
        /// What was contended.
        context: String,
    },

    /// The registry has been closed (or is closing); no further operations
    /// are possible.
    #[error("registry is closed")]
    Closed,

    /// The registry failed to close cleanly and is unusable.
    #[error("registry failed: {message}")]
    Failed {
        /// Description of the terminal failure.
        message: String,
    },

    /// A runtime limit update was rejected.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Why the update was rejected.
        message: String,
    },

    /// An error from the segment store.
    #[error("segment store error: {source}")]
    Store {
        /// The underlying store error.
        source: Arc<StoreError>,
    },
}

impl RegistryError {
    /// Creates a busy error.
    pub fn busy(context: impl Into<String>) -> Self {
        Self::Busy {
            context: context.into(),
        }
    }

    /// Creates a terminal failure error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns `true` for transient conditions worth retrying.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Returns `true` when the registry is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Locked { pid, hostname } => {
                Self::busy(format!("segment directory locked by pid {pid} on {hostname}"))
            }
            other => Self::Store {
                source: Arc::new(other),
            },
        }
    }
}

impl From<CacheError<StoreError>> for RegistryError {
    fn from(err: CacheError<StoreError>) -> Self {
        match err {
            CacheError::Busy { key } => Self::busy(format!("segment {key} is busy")),
            CacheError::Load { source, .. } => source.into(),
            CacheError::Unload { key, source } => {
                Self::failed(format!("unload of segment {key} failed: {source}"))
            }
            CacheError::DrainTimedOut { pending } => Self::failed(format!(
                "shutdown timed out with {pending} segments still resident"
            )),
        }
    }
}

impl From<Arc<StoreError>> for RegistryError {
    fn from(source: Arc<StoreError>) -> Self {
        if let StoreError::Locked { pid, hostname } = &*source {
            return Self::busy(format!(
                "segment directory locked by pid {pid} on {hostname}"
            ));
        }
        Self::Store { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_maps_to_busy() {
        let err: RegistryError = StoreError::Locked {
            pid: 7,
            hostname: "host".into(),
        }
        .into();
        assert!(err.is_busy());
    }

    #[test]
    fn other_store_errors_are_not_busy() {
        let err: RegistryError = StoreError::invalid_format("bad").into();
        assert!(!err.is_busy());
        assert!(!err.is_closed());
    }
}
