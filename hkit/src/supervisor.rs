//! Hyperkit process supervision: discovery, spawn, console wiring, reaping.

#![allow(unsafe_code)]

use std::env;
use std::ffi::OsStr;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Console;
use crate::console::{self, LineSink, Stream, Workers};
use crate::error::{Error, Result};

/// Where hyperkit is looked for when no executable is configured, in order.
/// Bare names go through `PATH`.
pub const DEFAULT_HYPERKITS: &[&str] = &[
    "hyperkit",
    "com.docker.hyperkit",
    "/usr/local/bin/hyperkit",
    "/Applications/Docker.app/Contents/Resources/bin/hyperkit",
    "/Applications/Docker.app/Contents/MacOS/com.docker.hyperkit",
];

/// How long to wait for hyperkit to publish its console PTY.
pub const TTY_DEADLINE: Duration = Duration::from_secs(10);

/// Resolves the hyperkit executable.
///
/// An explicit path is resolved like a shell would (bare names through
/// `PATH`); otherwise [`DEFAULT_HYPERKITS`] is tried in order.
pub fn find_hyperkit(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return look_path(p.as_os_str())
            .ok_or_else(|| Error::HypervisorNotFound(p.display().to_string()));
    }
    DEFAULT_HYPERKITS
        .iter()
        .find_map(|c| look_path(OsStr::new(c)))
        .ok_or_else(|| {
            Error::HypervisorNotFound(format!("tried {}", DEFAULT_HYPERKITS.join(", ")))
        })
}

/// Searches `PATH` for `name` unless it already contains a separator.
fn look_path(name: &OsStr) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return is_executable(path).then(|| path.to_owned());
    }
    let dirs = env::var_os("PATH")?;
    env::split_paths(&dirs)
        .map(|d| d.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Returns `true` for a regular file with any execute bit set.
fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Everything needed to start one hyperkit process.
#[derive(Debug)]
pub struct Launch<'a> {
    /// Resolved executable.
    pub program: &'a Path,
    /// Arguments, without the program name.
    pub argv: &'a [String],
    /// Console mode.
    pub console: Console,
    /// Whether the caller's stdout is a terminal.
    pub stdout_tty: bool,
    /// PTY symlink hyperkit publishes; followed for a stdio console without a terminal.
    pub tty: Option<PathBuf>,
    /// Receives hyperkit's stdout and stderr lines.
    pub sink: Option<Arc<dyn LineSink>>,
    /// Keep hyperkit tied to this process instead of detaching it.
    pub foreground: bool,
}

impl Launch<'_> {
    /// Whether hyperkit talks to the caller's terminal directly.
    const fn inherits_stdio(&self) -> bool {
        matches!(self.console, Console::Stdio) && self.stdout_tty
    }
}

/// A spawned hyperkit with its copier threads.
#[derive(Debug)]
pub struct Running {
    /// The hyperkit child.
    child: Child,
    /// Console copiers tied to this child.
    workers: Workers,
}

/// Spawns hyperkit and records it through `persist` before returning.
///
/// If `persist` fails, or the console PTY never appears, hyperkit is killed
/// and the error returned.
pub fn launch(spec: &Launch<'_>, persist: impl FnOnce(u32) -> Result<()>) -> Result<Running> {
    let mut cmd = Command::new(spec.program);
    cmd.args(spec.argv);

    let inherit = spec.inherits_stdio();
    let sink = spec.sink.as_ref().filter(|_| !inherit);
    if inherit {
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    } else if sink.is_some() {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    }
    pre_exec(&mut cmd, spec.foreground);

    let mut child = cmd.spawn().map_err(Error::file("spawn", spec.program))?;
    let pid = child.id();
    tracing::debug!(pid, program = %spec.program.display(), foreground = spec.foreground, "spawned hyperkit");

    let mut workers = Workers::default();
    if let Some(sink) = sink {
        let pipes = [
            (child.stdout.take().map(|p| Box::new(p) as Box<dyn io::Read + Send>), Stream::Stdout),
            (child.stderr.take().map(|p| Box::new(p) as Box<dyn io::Read + Send>), Stream::Stderr),
        ];
        for (pipe, stream) in pipes {
            if let Some(pipe) = pipe
                && let Err(e) = workers.lines(pipe, stream, Arc::clone(sink))
            {
                tracing::warn!(stream = stream.as_str(), error = %e, "cannot forward hyperkit output");
            }
        }
    }
    let mut running = Running { child, workers };

    if let Err(e) = persist(pid) {
        running.abort();
        return Err(e);
    }

    if matches!(spec.console, Console::Stdio)
        && !spec.stdout_tty
        && let Some(tty) = &spec.tty
    {
        let follow = console::open_tty(tty, pid, TTY_DEADLINE)
            .map_err(Error::file("open console", tty))
            .and_then(|file| match file {
                Some(f) => Ok(running.workers.follow_tty(f, pid, io::stdout())?),
                // Exited before publishing a console; the exit status tells the rest.
                None => Ok(()),
            });
        if let Err(e) = follow {
            running.abort();
            return Err(e);
        }
    }

    Ok(running)
}

impl Running {
    /// PID of the hyperkit process.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Waits for hyperkit to exit, joins the copiers, returns the exit code.
    ///
    /// A signal death maps to `128 + signal`, the shell convention.
    pub fn wait(mut self) -> Result<i32> {
        let status = self.child.wait()?;
        self.workers.join();
        let code = exit_code(status);
        tracing::debug!(pid = self.child.id(), code, "hyperkit exited");
        Ok(code)
    }

    /// Hands the child to a detached reaper thread.
    pub fn detach(self) -> Result<()> {
        let Self { mut child, workers } = self;
        let pid = child.id();
        workers.detach();
        thread::Builder::new()
            .name(format!("hkit-reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => tracing::debug!(pid, code = exit_code(status), "hyperkit reaped"),
                Err(e) => tracing::debug!(pid, error = %e, "hyperkit wait failed"),
            })?;
        Ok(())
    }

    /// Kills and reaps the child after a failed launch.
    fn abort(&mut self) {
        let pid = self.child.id();
        if let Err(e) = self.child.kill() {
            tracing::warn!(pid, error = %e, "failed to kill hyperkit");
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!(pid, error = %e, "failed to reap hyperkit");
        }
        std::mem::take(&mut self.workers).join();
    }
}

/// Exit code of `status`, mapping signal deaths to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// Installs the fork-to-exec hooks.
///
/// Every child gets its inherited descriptors above stderr marked
/// close-on-exec, so they are gone once hyperkit runs while the spawn error
/// pipe still works until then. A
/// background child starts its own session so terminal signals aimed at the
/// caller do not reach it. A foreground child dies with its parent on Linux.
fn pre_exec(cmd: &mut Command, foreground: bool) {
    // SAFETY: only async-signal-safe syscalls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if foreground {
                #[cfg(target_os = "linux")]
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
            } else if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            cloexec_inherited_fds();
            Ok(())
        });
    }
}

/// Marks every file descriptor >= 3 close-on-exec.
fn cloexec_inherited_fds() {
    #[cfg(target_os = "linux")]
    {
        /// `CLOSE_RANGE_CLOEXEC` from `<linux/close_range.h>`.
        const CLOSE_RANGE_CLOEXEC: u32 = 1 << 2;
        // SAFETY: close_range is async-signal-safe.
        let ret = unsafe {
            libc::syscall(libc::SYS_close_range, 3_u32, u32::MAX, CLOSE_RANGE_CLOEXEC)
        };
        if ret == 0 {
            return;
        }
    }

    // SAFETY: sysconf and fcntl are async-signal-safe.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = i32::try_from(max_fd).ok().filter(|n| *n > 0).unwrap_or(1024);
    for fd in 3..limit {
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::process;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn launch_spec<'a>(program: &'a Path, argv: &'a [String]) -> Launch<'a> {
        Launch {
            program,
            argv,
            console: Console::File,
            stdout_tty: false,
            tty: None,
            sink: None,
            foreground: true,
        }
    }

    #[derive(Debug, Default)]
    struct Collect(Mutex<Vec<String>>);

    impl LineSink for Collect {
        fn line(&self, _: Stream, line: &str) {
            self.0.lock().unwrap().push(line.to_owned());
        }
    }

    #[test]
    fn explicit_paths_must_be_executable() {
        let tmp = TempDir::new().unwrap();
        let exe = script(tmp.path(), "hk", "exit 0");
        assert_eq!(find_hyperkit(Some(&exe)).unwrap(), exe);

        let plain = tmp.path().join("plain");
        fs::write(&plain, b"").unwrap();
        assert!(matches!(
            find_hyperkit(Some(&plain)),
            Err(Error::HypervisorNotFound(_))
        ));
        assert!(matches!(
            find_hyperkit(Some(Path::new("/nonexistent/hyperkit"))),
            Err(Error::HypervisorNotFound(_))
        ));
    }

    #[test]
    fn bare_names_search_path() {
        let sh = find_hyperkit(Some(Path::new("sh"))).unwrap();
        assert!(sh.is_absolute());
        assert!(find_hyperkit(Some(Path::new("no-such-hyperkit-binary"))).is_err());
    }

    #[test]
    fn exec_failure_is_reported() {
        let tmp = TempDir::new().unwrap();
        let exe = tmp.path().join("hk");
        fs::write(&exe, "#!/nonexistent/interpreter\nexit 0\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        let argv = Vec::new();

        let mut persisted = false;
        let err = launch(&launch_spec(&exe, &argv), |_| {
            persisted = true;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::File { op: "spawn", .. }), "{err:?}");
        assert!(!persisted);
    }

    #[test]
    fn foreground_returns_exit_code_and_lines() {
        let tmp = TempDir::new().unwrap();
        let exe = script(tmp.path(), "hk", "echo booting\necho oops >&2\nexit 7");
        let sink = Arc::new(Collect::default());
        let argv = Vec::new();
        let mut spec = launch_spec(&exe, &argv);
        spec.sink = Some(Arc::clone(&sink) as Arc<dyn LineSink>);

        let mut recorded = 0;
        let running = launch(&spec, |pid| {
            recorded = pid;
            Ok(())
        })
        .unwrap();
        assert_eq!(running.pid(), recorded);
        assert_eq!(running.wait().unwrap(), 7);

        let mut lines = sink.0.lock().unwrap().clone();
        lines.sort();
        assert_eq!(lines, ["booting", "oops"]);
    }

    #[test]
    fn failed_persist_kills_the_child() {
        let tmp = TempDir::new().unwrap();
        let exe = script(tmp.path(), "hk", "exec sleep 30");
        let argv = Vec::new();
        let spec = launch_spec(&exe, &argv);

        let mut pid = 0;
        let err = launch(&spec, |p| {
            pid = p;
            Err(Error::InvalidConfig("disk full".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!process::is_alive(pid));
    }

    #[test]
    fn background_child_is_reaped() {
        let tmp = TempDir::new().unwrap();
        let exe = script(tmp.path(), "hk", "exit 0");
        let argv = Vec::new();
        let mut spec = launch_spec(&exe, &argv);
        spec.foreground = false;

        let running = launch(&spec, |_| Ok(())).unwrap();
        let pid = running.pid();
        running.detach().unwrap();
        process::wait_for_exit(pid, Some(Duration::from_secs(5))).unwrap();
    }

    #[test]
    fn signal_deaths_map_to_shell_codes() {
        let tmp = TempDir::new().unwrap();
        let exe = script(tmp.path(), "hk", "kill -9 $$");
        let argv = Vec::new();
        let running = launch(&launch_spec(&exe, &argv), |_| Ok(())).unwrap();
        assert_eq!(running.wait().unwrap(), 137);
    }

    #[test]
    fn stdio_without_terminal_tolerates_early_exit() {
        let tmp = TempDir::new().unwrap();
        let exe = script(tmp.path(), "hk", "exit 3");
        let argv = Vec::new();
        let mut spec = launch_spec(&exe, &argv);
        spec.console = Console::Stdio;
        spec.tty = Some(tmp.path().join("tty"));

        // No PTY is ever published; the exit is noticed instead of timing out.
        let running = launch(&spec, |_| Ok(())).unwrap();
        assert_eq!(running.wait().unwrap(), 3);
    }
}
