//! Injectable time source.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::Cancel;

/// Time source used by [`acquire`](crate::acquire) for deadlines and retry
/// pauses. Swap in a fake for deterministic tests.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Pauses for `pause`, returning early if `cancel` fires.
    ///
    /// Returns `true` if the pause ended because of cancellation.
    fn wait(&self, pause: Duration, cancel: Option<&Cancel>) -> bool;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wait(&self, pause: Duration, cancel: Option<&Cancel>) -> bool {
        match cancel {
            Some(c) => c.wait_timeout(pause),
            None => {
                thread::sleep(pause);
                false
            }
        }
    }
}
