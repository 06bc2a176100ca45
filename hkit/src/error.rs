//! Error types for hkit operations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Alias for `Result<T, hkit::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by hkit VM operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The VM configuration violates an invariant.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No hyperkit executable could be located.
    #[error("hyperkit executable not found: {0}")]
    HypervisorNotFound(String),

    /// An I/O operation on a specific path failed.
    #[error("{op} {}: {source}", .path.display())]
    File {
        /// What was being done.
        op: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// An I/O error without path context (spawn, stream copy).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The state-directory mutex could not be acquired.
    #[error(transparent)]
    Lock(#[from] hkit_mutex::Error),

    /// A caller-supplied wait for process exit ran out.
    #[error("pid {pid} still alive after {waited:?}")]
    WaitTimeout {
        /// Process being waited on.
        pid: u32,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The state document's PID disagrees with the PID file or the process table.
    #[error("pid mismatch: state document has {state}, pid file has {file:?}")]
    PidMismatch {
        /// PID recorded in the state document.
        state: u32,
        /// PID read from the hypervisor's PID file, if any.
        file: Option<u32>,
    },

    /// The state directory has no state document.
    #[error("no state document in {}", .0.display())]
    NoState(PathBuf),

    /// The state document exists but cannot be parsed.
    #[error("corrupt state document {}: {source}", .path.display())]
    CorruptState {
        /// Path of the state document.
        path: PathBuf,
        /// Parse error.
        source: serde_json::Error,
    },

    /// Removal was requested while the hypervisor is alive.
    #[error("hyperkit (pid {0}) is still running")]
    StillRunning(u32),

    /// A start was requested while a hypervisor already runs for this state directory.
    #[error("hyperkit already running as pid {0}")]
    AlreadyRunning(u32),

    /// The provisioner refused to overwrite an existing disk image.
    #[error("disk image already exists: {}", .0.display())]
    DiskExists(PathBuf),

    /// A panic was trapped inside a controller operation.
    #[error("{op} panicked: {message}")]
    Panicked {
        /// Controller operation that panicked.
        op: &'static str,
        /// Panic payload followed by a backtrace.
        message: String,
    },
}

impl Error {
    /// Returns `true` if retrying the same call could succeed without
    /// changing the configuration.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::File { .. } | Self::Io(_) | Self::WaitTimeout { .. } | Self::StillRunning(_) => {
                true
            }
            Self::Lock(e) => !e.is_invalid_spec(),
            _ => false,
        }
    }

    /// Attaches an operation name and path to an I/O error.
    pub(crate) fn file(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::File { op, path, source }
    }
}
