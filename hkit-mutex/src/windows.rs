//! Thread-pinned backend for Windows hosts.
//!
//! Windows lock ownership is tied to the thread that took it, so one
//! dedicated worker thread makes every attempt of an acquisition and, once
//! it succeeds, holds the lock until told to release it. [`Locker`] and
//! [`Held`] are message-passing proxies to that worker.

use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

/// Outcome reported by the worker for one attempt.
enum Attempt {
    /// The worker holds the lock and waits for a release message.
    Acquired,
    /// Another holder has the lock; the worker waits for the next attempt.
    Contended,
    /// The attempt failed.
    Failed(io::Error),
}

/// One acquisition in progress, backed by its worker thread.
#[derive(Debug)]
pub struct Locker {
    /// Mutex name, for error reports.
    name: String,
    /// Attempt requests; after acquisition, the release channel.
    control: Option<mpsc::Sender<()>>,
    /// Attempt outcomes.
    report: mpsc::Receiver<Attempt>,
    /// The worker thread.
    worker: Option<JoinHandle<()>>,
}

/// Proxy to the worker thread that holds the lock.
#[derive(Debug)]
pub struct Held {
    /// Dropping or sending on this wakes the worker to unlock.
    release: mpsc::Sender<()>,
    /// The worker thread.
    worker: JoinHandle<()>,
}

impl Locker {
    /// Opens the lock file at `path` and starts the worker that will lock it.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let (control_tx, control_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("hkit-mutex-{name}"))
            .spawn(move || worker(&file, &control_rx, &report_tx))?;
        Ok(Self {
            name: name.to_owned(),
            control: Some(control_tx),
            report: report_rx,
            worker: Some(worker),
        })
    }

    /// Asks the worker for one non-blocking attempt.
    ///
    /// Returns `Ok(None)` when another holder has the lock.
    pub fn try_acquire(&mut self) -> Result<Option<Held>> {
        let sent = self.control.as_ref().is_some_and(|c| c.send(()).is_ok());
        let outcome = if sent { self.report.recv().ok() } else { None };
        match outcome {
            Some(Attempt::Acquired) => match (self.control.take(), self.worker.take()) {
                (Some(release), Some(worker)) => Ok(Some(Held { release, worker })),
                _ => Err(Error::Io(io::Error::other("mutex worker already handed out"))),
            },
            Some(Attempt::Contended) => Ok(None),
            Some(Attempt::Failed(source)) if source.kind() == io::ErrorKind::Unsupported => {
                Err(Error::Unsupported {
                    name: self.name.clone(),
                    source,
                })
            }
            Some(Attempt::Failed(source)) => Err(Error::Io(source)),
            None => Err(Error::Io(io::Error::other("mutex worker exited unexpectedly"))),
        }
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        // Closing the control channel ends an idle worker.
        self.control.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Worker body: lock attempts on request, then hold until told to release.
fn worker(file: &File, control: &mpsc::Receiver<()>, report: &mpsc::Sender<Attempt>) {
    while control.recv().is_ok() {
        let outcome = match file.try_lock() {
            Ok(()) => Attempt::Acquired,
            Err(TryLockError::WouldBlock) => Attempt::Contended,
            Err(TryLockError::Error(e)) => Attempt::Failed(e),
        };
        let acquired = matches!(outcome, Attempt::Acquired);
        if report.send(outcome).is_err() {
            if acquired {
                unlock(file);
            }
            return;
        }
        if acquired {
            // Either an explicit message or the sender being dropped means release.
            let _ = control.recv();
            unlock(file);
            return;
        }
    }
}

/// Unlocks on the owning thread.
fn unlock(file: &File) {
    if let Err(e) = file.unlock() {
        tracing::warn!(error = %e, "explicit unlock failed; closing handle");
    }
}

impl Held {
    /// Asks the worker to unlock and waits for it to finish.
    pub fn release(self) {
        let _ = self.release.send(());
        let _ = self.worker.join();
    }
}
