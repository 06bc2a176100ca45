//! Process-table queries and signals by PID.
//!
//! Liveness is decided by looking the PID up in the host process table
//! rather than by `kill(pid, 0)`, and zombies count as dead.

use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessStatus, System};

use crate::error::{Error, Result};

/// Interval between liveness polls while waiting for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Returns `true` if `pid` is a live (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = sysinfo::Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Sends `sig` to `pid`. A process that is already gone is not an error.
pub fn signal(pid: u32, sig: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno).into()),
    }
}

/// Polls until `pid` leaves the process table.
///
/// `None` waits forever; otherwise fails with [`Error::WaitTimeout`].
pub fn wait_for_exit(pid: u32, timeout: Option<Duration>) -> Result<()> {
    let start = Instant::now();
    while is_alive(pid) {
        if let Some(limit) = timeout
            && start.elapsed() >= limit
        {
            return Err(Error::WaitTimeout {
                pid,
                waited: start.elapsed(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

/// Reads a decimal PID file. Missing or malformed files yield `None`.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
