//! Error types for the segment store.

use crate::types::SegmentId;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in segment store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The segment directory is locked by a live owner.
    ///
    /// This is a transient condition: the caller may retry once the owner
    /// releases the lock.
    #[error("segment directory locked by pid {pid} on {hostname}")]
    Locked {
        /// Owner process id recorded in the lock file.
        pid: u32,
        /// Owner hostname recorded in the lock file.
        hostname: String,
    },

    /// Attempted to release a lock owned by a different session.
    #[error("lock at {path} is owned by another session")]
    ForeignLock {
        /// Path of the lock file.
        path: String,
    },

    /// The segment directory or manifest does not exist.
    #[error("segment not found: {id}")]
    SegmentNotFound {
        /// The missing segment.
        id: SegmentId,
    },

    /// The segment handle has already been closed.
    #[error("segment is closed: {id}")]
    SegmentClosed {
        /// The closed segment.
        id: SegmentId,
    },

    /// Manifest or delta file is corrupted or has an incompatible layout.
    #[error("invalid segment format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl StoreError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns `true` if the error is a transient lock-contention condition.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_is_transient() {
        let err = StoreError::Locked {
            pid: 1,
            hostname: "host".into(),
        };
        assert!(err.is_locked());
        assert!(!StoreError::invalid_format("bad").is_locked());
    }
}
