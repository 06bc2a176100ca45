//! Host-wide named mutex.
//!
//! A [`Spec`] names a lock; [`acquire`] blocks until no other acquirer of
//! the same name (in this or any other process) holds it, then returns a
//! [`LockHandle`]. The lock is released when the handle is released or
//! dropped, and by the kernel if the holding process dies.
//!
//! On Unix the lock is an `flock(2)` on `hkit-mutex-<name>.lock` in the
//! per-user runtime directory. On Windows a thread-pinned worker owns the
//! lock for its whole lifetime.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let spec = hkit_mutex::Spec::new("vm-state").timeout(Duration::from_secs(5));
//! let mut handle = hkit_mutex::acquire(&spec)?;
//! // ... exclusive section ...
//! handle.release();
//! # Ok::<(), hkit_mutex::Error>(())
//! ```

mod cancel;
mod clock;
mod error;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use cancel::Cancel;
pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};

/// Longest accepted mutex name.
pub const MAX_NAME_LEN: usize = 40;

/// Retry interval used by [`Spec::new`].
const DEFAULT_DELAY: Duration = Duration::from_millis(20);

/// Describes one named mutex and how to wait for it.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Spec {
    /// Lock identifier matching `[a-zA-Z][-a-zA-Z0-9]*`, at most 40 bytes.
    pub name: String,
    /// Give up with [`Error::Timeout`] after this long. Zero waits forever.
    pub timeout: Duration,
    /// Minimum pause between attempts while contended. Must be non-zero.
    pub delay: Duration,
    /// Optional external cancellation.
    pub cancel: Option<Cancel>,
    /// Time source. Must be set.
    pub clock: Option<Arc<dyn Clock>>,
    /// Directory for lock files. Defaults to [`default_lock_dir`].
    pub dir: Option<PathBuf>,
}

impl Spec {
    /// Creates a spec that waits forever with the system clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::ZERO,
            delay: DEFAULT_DELAY,
            cancel: None,
            clock: Some(Arc::new(SystemClock)),
            dir: None,
        }
    }

    /// Sets the acquisition timeout (zero means wait indefinitely).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry interval under contention.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Attaches a cancellation signal.
    #[must_use]
    pub fn cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Replaces the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Places lock files in `dir` instead of the default location.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Checks the name, clock and delay.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.clock.is_none() {
            return Err(Error::InvalidSpec("missing clock".into()));
        }
        if self.delay.is_zero() {
            return Err(Error::InvalidSpec("delay must be positive".into()));
        }
        Ok(())
    }

    /// Path of the lock file backing this mutex.
    pub fn lock_path(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(default_lock_dir)
            .join(format!("hkit-mutex-{}.lock", self.name))
    }
}

/// Checks `name` against `[a-zA-Z][-a-zA-Z0-9]*` and the length limit.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(Error::InvalidSpec("name is empty".into()));
    };
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidSpec(format!(
            "name {name:?} longer than {MAX_NAME_LEN} characters"
        )));
    }
    if !first.is_ascii_alphabetic() || !chars.all(|c| c == '-' || c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidSpec(format!(
            "name {name:?} must match [a-zA-Z][-a-zA-Z0-9]*"
        )));
    }
    Ok(())
}

/// Default lock directory: the per-user runtime dir, else the temp dir.
pub fn default_lock_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Exclusive ownership of a named mutex.
///
/// Released by [`release`](Self::release) or on drop, whichever comes first.
#[derive(Debug)]
pub struct LockHandle {
    /// Mutex name, for diagnostics.
    name: String,
    /// The OS resource; `None` once released.
    held: Option<sys::Held>,
}

impl LockHandle {
    /// Releases the mutex. Calls after the first are no-ops.
    pub fn release(&mut self) {
        if let Some(held) = self.held.take() {
            held.release();
            tracing::debug!(name = %self.name, "released mutex");
        }
    }

    /// Returns `true` until the handle is released.
    pub const fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// The mutex name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires the mutex described by `spec`, blocking while it is contended.
///
/// Fails with [`Error::Cancelled`] if the spec's signal has fired (checked
/// before the first attempt and during every pause), or with
/// [`Error::Timeout`] once a non-zero timeout has elapsed. Among concurrent
/// acquirers of one name at most one holds the lock; fairness is not
/// guaranteed.
pub fn acquire(spec: &Spec) -> Result<LockHandle> {
    spec.validate()?;
    let Some(clock) = spec.clock.as_deref() else {
        return Err(Error::InvalidSpec("missing clock".into()));
    };
    let cancelled = || Error::Cancelled {
        name: spec.name.clone(),
    };
    if spec.cancel.as_ref().is_some_and(Cancel::is_cancelled) {
        return Err(cancelled());
    }

    let path = spec.lock_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut locker = sys::Locker::open(&path, &spec.name)?;
    let start = clock.now();
    loop {
        if let Some(held) = locker.try_acquire()? {
            tracing::debug!(name = %spec.name, path = %path.display(), "acquired mutex");
            return Ok(LockHandle {
                name: spec.name.clone(),
                held: Some(held),
            });
        }

        let waited = clock.now().saturating_duration_since(start);
        let pause = if spec.timeout.is_zero() {
            spec.delay
        } else if waited >= spec.timeout {
            return Err(Error::Timeout {
                name: spec.name.clone(),
                waited,
            });
        } else {
            spec.delay.min(spec.timeout - waited)
        };

        tracing::trace!(name = %spec.name, ?waited, "mutex contended");
        if clock.wait(pause, spec.cancel.as_ref()) {
            return Err(cancelled());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::process::{Command, Stdio};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;

    /// Virtual clock: `wait` advances time instead of sleeping.
    #[derive(Debug)]
    struct FakeClock {
        now: Mutex<Instant>,
        waits: AtomicUsize,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
                waits: AtomicUsize::new(0),
            })
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }

        fn wait(&self, pause: Duration, cancel: Option<&Cancel>) -> bool {
            self.waits.fetch_add(1, Ordering::SeqCst);
            *self.now.lock() += pause;
            cancel.is_some_and(Cancel::is_cancelled)
        }
    }

    fn spec(dir: &TempDir, name: &str) -> Spec {
        Spec::new(name).dir(dir.path())
    }

    #[test]
    fn name_length_boundary() {
        assert!(validate_name(&format!("a{}", "b".repeat(39))).is_ok());
        let err = validate_name(&format!("a{}", "b".repeat(40))).unwrap_err();
        assert!(err.is_invalid_spec());
    }

    #[test]
    fn name_pattern() {
        assert!(validate_name("vm-1").is_ok());
        assert!(validate_name("A").is_ok());
        for bad in ["", "1vm", "-vm", "vm_1", "vm.1", "vm 1", "vm/x"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn validate_rejects_missing_clock_and_zero_delay() {
        let mut s = Spec::new("ok");
        s.clock = None;
        assert!(s.validate().unwrap_err().is_invalid_spec());

        let s = Spec::new("ok").delay(Duration::ZERO);
        assert!(s.validate().unwrap_err().is_invalid_spec());

        assert!(Spec::new("ok").timeout(Duration::ZERO).validate().is_ok());
        assert!(Spec::new("ok").timeout(Duration::from_nanos(1)).validate().is_ok());
    }

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let s = spec(&dir, "basic");
        let mut h = acquire(&s).unwrap();
        assert!(h.is_held());
        assert_eq!(h.name(), "basic");
        assert!(s.lock_path().exists());

        h.release();
        assert!(!h.is_held());
        h.release(); // idempotent

        let _again = acquire(&s).unwrap();
    }

    #[test]
    fn drop_releases() {
        let dir = TempDir::new().unwrap();
        let s = spec(&dir, "dropped");
        {
            let _h = acquire(&s).unwrap();
        }
        let _h = acquire(&s.clone().timeout(Duration::from_millis(200))).unwrap();
    }

    #[test]
    fn contended_times_out() {
        let dir = TempDir::new().unwrap();
        let _held = acquire(&spec(&dir, "busy")).unwrap();

        let start = Instant::now();
        let err = acquire(&spec(&dir, "busy").timeout(Duration::from_nanos(1))).unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timeout_follows_injected_clock() {
        let dir = TempDir::new().unwrap();
        let _held = acquire(&spec(&dir, "clocked")).unwrap();

        let clock = FakeClock::new();
        let s = spec(&dir, "clocked")
            .timeout(Duration::from_secs(3600))
            .delay(Duration::from_secs(60))
            .clock(Arc::clone(&clock) as Arc<dyn Clock>);
        let err = acquire(&s).unwrap_err();
        assert!(err.is_timeout());
        // 60 one-minute pauses cover the hour.
        assert_eq!(clock.waits.load(Ordering::SeqCst), 60);
    }

    #[test]
    fn different_names_are_independent() {
        let dir = TempDir::new().unwrap();
        let _a = acquire(&spec(&dir, "alpha")).unwrap();
        let _b = acquire(&spec(&dir, "beta").timeout(Duration::from_nanos(1))).unwrap();
    }

    #[test]
    fn pre_cancelled_fails_fast() {
        let dir = TempDir::new().unwrap();
        let cancel = Cancel::new();
        cancel.cancel();
        let err = acquire(&spec(&dir, "never").cancel(cancel)).unwrap_err();
        assert!(err.is_cancelled());
        // The fast path runs before the lock file is touched.
        assert!(!spec(&dir, "never").lock_path().exists());
    }

    #[test]
    fn cancel_interrupts_wait() {
        let dir = TempDir::new().unwrap();
        let _held = acquire(&spec(&dir, "waiting")).unwrap();

        let cancel = Cancel::new();
        let s = spec(&dir, "waiting").cancel(cancel.clone());
        let waiter = thread::spawn(move || acquire(&s));

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let dir = TempDir::new().unwrap();
        let mut first = acquire(&spec(&dir, "handoff")).unwrap();

        let s = spec(&dir, "handoff");
        let waiter = thread::spawn(move || acquire(&s).map(|h| h.is_held()));

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        first.release();
        assert!(waiter.join().unwrap().unwrap());
    }

    /// Turns the test binary into a lock holder for `holder_death_releases`.
    const HOLDER_ENV: &str = "HKIT_MUTEX_TEST_HOLDER";

    #[test]
    fn holder_death_releases() {
        if let Some(dir) = std::env::var_os(HOLDER_ENV) {
            let dir = PathBuf::from(dir);
            let _held = acquire(&Spec::new("orphan").dir(&dir)).unwrap();
            std::fs::write(dir.join("held"), b"").unwrap();
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }

        let dir = TempDir::new().unwrap();
        let mut holder = Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "tests::holder_death_releases", "--test-threads=1"])
            .env(HOLDER_ENV, dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !dir.path().join("held").exists() {
            assert!(Instant::now() < deadline, "holder process never took the lock");
            thread::sleep(Duration::from_millis(10));
        }

        // Another process holds it.
        let err = acquire(&spec(&dir, "orphan").timeout(Duration::from_nanos(1))).unwrap_err();
        assert!(err.is_timeout(), "{err}");

        holder.kill().unwrap();
        holder.wait().unwrap();
        let mut h = acquire(&spec(&dir, "orphan").timeout(Duration::from_secs(5))).unwrap();
        assert!(h.is_held());
        h.release();
    }

    #[test]
    fn at_most_one_holder() {
        let dir = Arc::new(TempDir::new().unwrap());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let dir = Arc::clone(&dir);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let s = Spec::new("shared").dir(dir.path()).delay(Duration::from_millis(1));
                        let mut h = acquire(&s).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        h.release();
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
