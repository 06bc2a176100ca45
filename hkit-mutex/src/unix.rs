//! `flock(2)` backend.
//!
//! Each acquisition opens its own file description, so two acquirers
//! conflict even inside a single process. The kernel drops the lock when the
//! holder exits, cleanly or not.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};

/// A held `flock` on an open lock file.
#[derive(Debug)]
pub struct Held(Flock<File>);

/// One acquisition in progress: the lock file, opened once and retried.
#[derive(Debug)]
pub struct Locker {
    /// Mutex name, for error reports.
    name: String,
    /// The lock file; taken once the lock is held.
    file: Option<File>,
}

impl Locker {
    /// Opens (creating if needed) the lock file at `path`.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        Ok(Self {
            name: name.to_owned(),
            file: Some(file),
        })
    }

    /// Makes one non-blocking attempt. Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(&mut self) -> Result<Option<Held>> {
        let Some(file) = self.file.take() else {
            return Err(Error::Io(io::Error::other("lock file already handed out")));
        };
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Held(lock))),
            Err((file, Errno::EWOULDBLOCK | Errno::EINTR)) => {
                self.file = Some(file);
                Ok(None)
            }
            Err((_, errno @ (Errno::ENOLCK | Errno::EOPNOTSUPP))) => Err(Error::Unsupported {
                name: self.name.clone(),
                source: io::Error::from(errno),
            }),
            Err((_, errno)) => Err(Error::Io(errno.into())),
        }
    }
}

impl Held {
    /// Unlocks and closes the lock file.
    pub fn release(self) {
        if let Err((lock, errno)) = self.0.unlock() {
            tracing::warn!(%errno, "explicit unlock failed; closing descriptor");
            drop(lock);
        }
    }
}
