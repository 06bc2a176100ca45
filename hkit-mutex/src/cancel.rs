//! One-shot cancellation signal shared between an acquirer and its caller.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A cloneable, one-shot cancellation signal.
///
/// All clones observe the same signal. Once [`cancel`](Self::cancel) has been
/// called the token stays fired forever.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    /// Shared flag and wakeup.
    inner: Arc<Inner>,
}

/// Flag guarded by a mutex, paired with a condvar for waiters.
#[derive(Debug, Default)]
struct Inner {
    /// `true` once fired.
    fired: Mutex<bool>,
    /// Notified when `fired` flips.
    cond: Condvar,
}

impl Cancel {
    /// Creates an unfired token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal and wakes every waiter.
    pub fn cancel(&self) {
        let mut fired = self.inner.fired.lock();
        *fired = true;
        self.inner.cond.notify_all();
    }

    /// Returns `true` if the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.fired.lock()
    }

    /// Blocks for up to `timeout` or until the signal fires.
    ///
    /// Returns `true` if the signal has fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.inner.fired.lock();
        if !*fired {
            let _ = self.inner.cond.wait_for(&mut fired, timeout);
        }
        *fired
    }
}
