//! Error types for named mutex acquisition.

use std::time::Duration;

/// Alias for `Result<T, hkit_mutex::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`acquire`](crate::acquire).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The [`Spec`](crate::Spec) failed validation.
    #[error("invalid mutex spec: {0}")]
    InvalidSpec(String),

    /// The lock stayed contended for longer than the spec's timeout.
    #[error("timed out after {waited:?} waiting for mutex {name:?}")]
    Timeout {
        /// Mutex name.
        name: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The spec's cancellation signal fired before the lock was acquired.
    #[error("acquisition of mutex {name:?} was cancelled")]
    Cancelled {
        /// Mutex name.
        name: String,
    },

    /// The file system holding the lock file does not support locking.
    #[error("file locking unsupported for mutex {name:?}: {source}")]
    Unsupported {
        /// Mutex name.
        name: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Any other I/O failure while opening or locking the lock file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for errors that mean the spec can never be satisfied on
    /// this host: a malformed spec or a platform without locking support.
    pub const fn is_invalid_spec(&self) -> bool {
        matches!(self, Self::InvalidSpec(_) | Self::Unsupported { .. })
    }

    /// Returns `true` if this is a [`Timeout`](Self::Timeout).
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a [`Cancelled`](Self::Cancelled).
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
