//! The [`Hyperkit`] controller: one VM, one state directory.
//!
//! Every verb that touches the state directory runs under a host-wide
//! mutex named after that directory, so controllers in different processes
//! pointed at the same directory never interleave. Controllers for
//! different directories are independent.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fs;
use std::io::{self, IsTerminal};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hkit_mutex::{Cancel, LockHandle, Spec};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::VmConfig;
use crate::console::LineSink;
use crate::error::{Error, Result};
use crate::layout::StateLayout;
use crate::supervisor::{self, Launch, Running};
use crate::{args, disk, process, state};

/// Lifecycle position of a [`Hyperkit`] controller.
///
/// ```text
/// Configured -> Starting -> Running -> Stopping -> Exited
///      \____________\___________\__________\_______-> Removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum VmState {
    /// Built or recovered, no live hypervisor.
    Configured,
    /// Validated and spawning.
    Starting,
    /// Hypervisor spawned and recorded.
    Running,
    /// Termination requested, not yet observed.
    Stopping,
    /// Hypervisor gone.
    Exited,
    /// State directory cleared.
    Removed,
}

/// Controller for one hyperkit VM.
///
/// ```no_run
/// use hkit::{Console, DiskSpec, Hyperkit, VmConfig};
///
/// let config = VmConfig::new("/tmp/vm1")
///     .kernel("/boot/vmlinuz", "/boot/initrd.img")
///     .disk(DiskSpec::new(1024))
///     .console(Console::File);
/// let mut vm = Hyperkit::new(config);
/// vm.start("console=ttyS0")?;
/// assert!(vm.is_running()?);
/// vm.stop()?;
/// vm.remove(false)?;
/// # Ok::<(), hkit::Error>(())
/// ```
#[derive(Debug)]
pub struct Hyperkit {
    /// Configuration plus runtime snapshot.
    config: VmConfig,
    /// Where the controller is in the lifecycle.
    state: VmState,
    /// Receives hyperkit's stdout/stderr lines.
    sink: Option<Arc<dyn LineSink>>,
    /// Mutex acquisition timeout; zero waits forever.
    lock_timeout: Duration,
    /// Mutex acquisition cancellation.
    cancel: Option<Cancel>,
    /// Lock file directory override.
    lock_dir: Option<PathBuf>,
}

impl Hyperkit {
    /// A controller for a VM that has not been started.
    pub const fn new(config: VmConfig) -> Self {
        Self {
            config,
            state: VmState::Configured,
            sink: None,
            lock_timeout: Duration::ZERO,
            cancel: None,
            lock_dir: None,
        }
    }

    /// Attaches to the VM recorded in `state_dir`.
    ///
    /// Fails with [`Error::PidMismatch`] unless the recorded hypervisor is
    /// alive and agrees with its PID file.
    pub fn from_state(state_dir: impl AsRef<Path>) -> Result<Self> {
        let config = state::load(state_dir.as_ref())?;
        tracing::debug!(state_dir = %state_dir.as_ref().display(), pid = config.pid, "attached to running VM");
        Ok(Self {
            state: VmState::Running,
            ..Self::new(config)
        })
    }

    /// Like [`from_state`](Self::from_state), but a dead or mismatched
    /// hypervisor yields a [`VmState::Configured`] controller instead of an error.
    pub fn recover(state_dir: impl AsRef<Path>) -> Result<Self> {
        match Self::from_state(&state_dir) {
            Err(Error::PidMismatch { state: pid, file }) => {
                tracing::debug!(pid, ?file, "recorded hyperkit is gone");
                let mut config = state::read_document(state_dir.as_ref())?;
                config.pid = 0;
                Ok(Self::new(config))
            }
            other => other,
        }
    }

    /// Sends hyperkit's stdout/stderr to `sink` (file console modes only).
    #[must_use]
    pub fn with_logger(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Fails mutex acquisition with a timeout error after `timeout` (zero waits forever).
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Aborts mutex acquisition when `cancel` fires.
    #[must_use]
    pub fn lock_cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Keeps lock files in `dir` instead of the per-user runtime directory.
    #[must_use]
    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    /// The configuration and runtime snapshot.
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Hypervisor PID, 0 when none was started.
    pub const fn pid(&self) -> u32 {
        self.config.pid
    }

    /// Argument vector of the last start.
    pub fn argv(&self) -> &[String] {
        &self.config.argv
    }

    /// Kernel command line of the last start.
    pub fn cmdline(&self) -> &str {
        &self.config.cmdline
    }

    /// Current lifecycle state. A running VM whose hypervisor died reads as exited.
    pub fn state(&self) -> VmState {
        match self.state {
            VmState::Running | VmState::Stopping if !process::is_alive(self.config.pid) => {
                VmState::Exited
            }
            s => s,
        }
    }

    /// Boots the VM and blocks until hyperkit exits, returning its exit code.
    ///
    /// The mutex is held while starting, not while the VM runs, so other
    /// controllers can stop it.
    pub fn run(&mut self, cmdline: &str) -> Result<i32> {
        guarded("run", || {
            let running = self.launch(cmdline, true)?;
            let code = running.wait()?;
            self.state = VmState::Exited;
            Ok(code)
        })
    }

    /// Boots the VM in the background.
    pub fn start(&mut self, cmdline: &str) -> Result<()> {
        guarded("start", || {
            let running = self.launch(cmdline, false)?;
            running.detach()
        })
    }

    /// Sends SIGTERM and blocks until hyperkit exits.
    pub fn stop(&mut self) -> Result<()> {
        self.terminate(Signal::SIGTERM, None)
    }

    /// Sends SIGTERM and waits at most `timeout` for hyperkit to exit.
    ///
    /// Fails with [`Error::WaitTimeout`] if it is still alive; nothing is
    /// escalated.
    pub fn stop_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.terminate(Signal::SIGTERM, Some(timeout))
    }

    /// Sends SIGKILL and blocks until hyperkit is gone.
    pub fn kill(&mut self) -> Result<()> {
        self.terminate(Signal::SIGKILL, None)
    }

    /// Sends SIGKILL and waits at most `timeout`.
    pub fn kill_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.terminate(Signal::SIGKILL, Some(timeout))
    }

    /// Returns `true` if hyperkit is in the process table, whether this
    /// handle started it or another controller recorded it in the state
    /// directory.
    pub fn is_running(&self) -> Result<bool> {
        let _lock = self.lock()?;
        Ok(self.live_pid().is_some())
    }

    /// Deletes the state directory contents hkit and hyperkit created.
    ///
    /// Refuses with [`Error::StillRunning`] while hyperkit is alive, including
    /// one started by another controller. Provisioned disk images survive when
    /// `keep_disk` is set; disks supplied by path always survive.
    pub fn remove(&mut self, keep_disk: bool) -> Result<()> {
        let mut lock = self.lock()?;
        if let Some(pid) = self.live_pid() {
            return Err(Error::StillRunning(pid));
        }
        if let Some(dir) = &self.config.state_dir {
            state::clear_if_owned(dir, keep_disk)?;
            tracing::debug!(state_dir = %dir.display(), keep_disk, "removed VM state");
        }
        if let Some(lock) = &mut lock {
            lock.release();
        }
        self.state = VmState::Removed;
        Ok(())
    }

    /// Validates, provisions, spawns and records hyperkit.
    fn launch(&mut self, cmdline: &str, foreground: bool) -> Result<Running> {
        let stdout_tty = io::stdout().is_terminal();
        self.config.validate(stdout_tty)?;
        if matches!(self.state(), VmState::Running | VmState::Stopping) {
            return Err(Error::AlreadyRunning(self.config.pid));
        }
        self.config.resolve_vpnkit_sock()?;
        self.config.check_files()?;

        if let Some(dir) = &self.config.state_dir {
            state::ensure_dir(dir)?;
        }
        let mut lock = self.lock()?;

        if let Some(pid) = self.recorded_pid() {
            return Err(Error::AlreadyRunning(pid));
        }

        self.provision_disks()?;
        let program = supervisor::find_hyperkit(self.config.hyperkit.as_deref())?;
        let argv = args::build(&self.config, cmdline, stdout_tty);

        self.state = VmState::Starting;
        self.config.argv.clone_from(&argv);
        self.config.cmdline = cmdline.to_owned();
        let layout = self.config.state_dir.as_deref().map(StateLayout::new);
        let spec = Launch {
            program: &program,
            argv: &argv,
            console: self.config.console,
            stdout_tty,
            tty: layout.as_ref().map(StateLayout::tty),
            sink: self.sink.clone(),
            foreground,
        };

        let config = &mut self.config;
        let launched = supervisor::launch(&spec, |pid| {
            config.pid = pid;
            if config.state_dir.is_some() {
                state::save(config)?;
            }
            Ok(())
        });
        let running = match launched {
            Ok(r) => r,
            Err(e) => {
                self.config.pid = 0;
                self.state = VmState::Configured;
                return Err(e);
            }
        };

        self.state = VmState::Running;
        tracing::info!(pid = running.pid(), foreground, "hyperkit started");
        if let Some(lock) = &mut lock {
            lock.release();
        }
        Ok(running)
    }

    /// Creates missing images for disks that need one.
    ///
    /// A disk without a path gets `diskNN.img` in the state directory; a
    /// missing image at an explicit path is created when a size is given.
    /// Existing images are used as they are.
    fn provision_disks(&self) -> Result<()> {
        for (i, disk) in self.config.disks.iter().enumerate() {
            let Some(path) = self.config.disk_path(i) else {
                continue;
            };
            if path.exists() || disk.size_mib == 0 {
                continue;
            }
            let key = disk
                .ssh_public_key
                .as_deref()
                .map(|p| fs::read(p).map_err(Error::file("read ssh key", p)))
                .transpose()?;
            if let Err(e) = disk::create_raw(&path, disk.size_mib, key.as_deref(), false) {
                if !matches!(e, Error::DiskExists(_))
                    && let Err(rm) = fs::remove_file(&path)
                    && rm.kind() != io::ErrorKind::NotFound
                {
                    tracing::warn!(path = %path.display(), error = %rm, "failed to remove partial disk image");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Signals hyperkit and waits for it to leave the process table.
    fn terminate(&mut self, signal: Signal, timeout: Option<Duration>) -> Result<()> {
        let _lock = self.lock()?;
        if !process::is_alive(self.config.pid)
            && let Some(recorded) = self.recorded_pid()
        {
            tracing::debug!(pid = recorded, "adopting hyperkit recorded in state directory");
            self.config.pid = recorded;
        }
        let pid = self.config.pid;
        if !process::is_alive(pid) {
            if matches!(
                self.state,
                VmState::Starting | VmState::Running | VmState::Stopping
            ) {
                self.state = VmState::Exited;
            }
            return Ok(());
        }

        self.state = VmState::Stopping;
        tracing::debug!(pid, %signal, "terminating hyperkit");
        process::signal(pid, signal)?;
        match process::wait_for_exit(pid, timeout) {
            Ok(()) => {
                self.state = VmState::Exited;
                Ok(())
            }
            Err(e) => {
                self.state = VmState::Running;
                Err(e)
            }
        }
    }

    /// PID of a live hyperkit recorded in the state directory, if any.
    ///
    /// Callers hold the mutex.
    fn recorded_pid(&self) -> Option<u32> {
        let dir = self.config.state_dir.as_deref()?;
        let recorded = state::read_document(dir).ok()?;
        state::verify_pid(&recorded).ok()?;
        Some(recorded.pid)
    }

    /// This handle's hyperkit if alive, else the one the state directory records.
    fn live_pid(&self) -> Option<u32> {
        let pid = self.config.pid;
        if process::is_alive(pid) {
            Some(pid)
        } else {
            self.recorded_pid()
        }
    }

    /// Takes the state-directory mutex; no directory means nothing to guard.
    fn lock(&self) -> Result<Option<LockHandle>> {
        let Some(dir) = &self.config.state_dir else {
            return Ok(None);
        };
        let mut spec = Spec::new(mutex_name(dir)).timeout(self.lock_timeout);
        if let Some(cancel) = &self.cancel {
            spec = spec.cancel(cancel.clone());
        }
        if let Some(lock_dir) = &self.lock_dir {
            spec = spec.dir(lock_dir);
        }
        Ok(Some(hkit_mutex::acquire(&spec)?))
    }
}

/// Mutex name for a state directory: `vm-` plus 32 hex digits of the
/// SHA-256 of its canonical path.
pub fn mutex_name(state_dir: &Path) -> String {
    let canonical = canonical(state_dir);
    let digest = Sha256::digest(canonical.as_os_str().as_encoded_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("vm-{hex}")
}

/// Canonical form of `path`, tolerating a not-yet-created last component.
fn canonical(path: &Path) -> PathBuf {
    if let Ok(p) = fs::canonicalize(path) {
        return p;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        && let Ok(p) = fs::canonicalize(parent)
    {
        return p.join(name);
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_owned())
}

/// Runs `f`, turning a panic into [`Error::Panicked`].
fn guarded<T>(op: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let backtrace = Backtrace::force_capture();
        let message = format!("{}\n{backtrace}", panic_message(payload.as_ref()));
        tracing::error!(op, "panic trapped");
        Err(Error::Panicked { op, message })
    })
}

/// Extracts the text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::{Console, DiskSpec};

    #[test]
    fn mutex_names_are_valid_and_stable() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm1");

        let before = mutex_name(&dir);
        fs::create_dir(&dir).unwrap();
        let after = mutex_name(&dir);
        assert_eq!(before, after);
        assert_eq!(after.len(), 35);
        hkit_mutex::validate_name(&after).unwrap();

        let other = mutex_name(&tmp.path().join("vm2"));
        assert_ne!(after, other);
    }

    #[test]
    fn panics_become_errors() {
        let r: Result<()> = guarded("start", || panic!("boom"));
        match r {
            Err(Error::Panicked { op, message }) => {
                assert_eq!(op, "start");
                assert!(message.starts_with("boom"));
            }
            other => panic!("expected Panicked, got {other:?}"),
        }

        let r: Result<()> = guarded("run", || panic!("{}", String::from("owned")));
        assert!(matches!(r, Err(Error::Panicked { message, .. }) if message.starts_with("owned")));
    }

    #[test]
    fn invalid_config_is_rejected_before_anything_else() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm");
        let mut vm = Hyperkit::new(VmConfig::new(&dir).console(Console::File))
            .lock_dir(tmp.path().join("locks"));
        assert!(matches!(vm.start(""), Err(Error::InvalidConfig(_))));
        assert!(!dir.exists());
        assert_eq!(vm.state(), VmState::Configured);
    }

    #[test]
    fn missing_kernel_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut vm = Hyperkit::new(
            VmConfig::new(tmp.path().join("vm"))
                .kernel(tmp.path().join("nope"), tmp.path().join("nope"))
                .console(Console::File),
        );
        let err = vm.start("").unwrap_err();
        assert!(err.to_string().contains("kernel"));
    }

    #[test]
    fn provisions_only_missing_images() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("disk00.img"), b"existing").unwrap();
        let explicit = tmp.path().join("vols/data.img");

        let vm = Hyperkit::new(
            VmConfig::new(&dir)
                .disk(DiskSpec::new(4))
                .disk(DiskSpec::new(2))
                .disk(DiskSpec::at(&explicit).size_mib(1)),
        );
        vm.provision_disks().unwrap();

        assert_eq!(fs::read(dir.join("disk00.img")).unwrap(), b"existing");
        assert_eq!(fs::metadata(dir.join("disk01.img")).unwrap().len(), 2 << 20);
        assert_eq!(fs::metadata(&explicit).unwrap().len(), 1 << 20);
    }

    #[test]
    fn stopping_nothing_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let mut vm = Hyperkit::new(VmConfig::new(tmp.path().join("vm")))
            .lock_dir(tmp.path().join("locks"));
        vm.stop().unwrap();
        vm.kill().unwrap();
        assert!(!vm.is_running().unwrap());
        assert_eq!(vm.state(), VmState::Configured);
    }

    #[test]
    fn cancelled_lock_surfaces() {
        let tmp = TempDir::new().unwrap();
        let cancel = Cancel::new();
        cancel.cancel();
        let vm = Hyperkit::new(VmConfig::new(tmp.path().join("vm")))
            .lock_dir(tmp.path().join("locks"))
            .lock_cancel(cancel);
        match vm.is_running() {
            Err(Error::Lock(e)) => assert!(e.is_cancelled()),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
