//! Console plumbing: hypervisor output forwarding and PTY following.
//!
//! Every copier runs on its own thread and ends when its source reaches EOF
//! or the hypervisor exits. Copy errors are logged, never returned.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::AsFd;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, OutputFlags, SetArg};

use crate::process;

/// Pause between attempts to open the PTY symlink.
const TTY_RETRY: Duration = Duration::from_millis(50);

/// How long a PTY read waits before rechecking the hypervisor.
const TTY_POLL_MS: u16 = 100;

/// Which hypervisor stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl Stream {
    /// Short name used for thread names and log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Receives hypervisor output one line at a time.
///
/// Attach one with [`Hyperkit::with_logger`](crate::Hyperkit::with_logger).
/// Without a sink the hypervisor's streams go to the null device.
pub trait LineSink: Send + Sync + fmt::Debug {
    /// Handles one line, without its terminator.
    fn line(&self, stream: Stream, line: &str);
}

/// Forwards hypervisor output into `tracing`.
///
/// Stdout lines are DEBUG events under target `hyperkit:stdout`; stderr
/// lines are WARN events under `hyperkit:stderr`. ANSI escapes are stripped.
#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn line(&self, stream: Stream, line: &str) {
        let clean = strip_ansi(line);
        match stream {
            Stream::Stdout => tracing::debug!(target: "hyperkit:stdout", "{clean}"),
            Stream::Stderr => tracing::warn!(target: "hyperkit:stderr", "{clean}"),
        }
    }
}

/// Removes `ESC [ ... m` color sequences.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        if chars.next() == Some('[') {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        }
    }
    out
}

/// Copier threads owned by one hypervisor run.
#[derive(Debug, Default)]
pub struct Workers {
    /// Running copiers.
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Starts forwarding `reader` to `sink` line by line.
    pub fn lines<R: Read + Send + 'static>(
        &mut self,
        reader: R,
        stream: Stream,
        sink: std::sync::Arc<dyn LineSink>,
    ) -> io::Result<()> {
        let handle = thread::Builder::new()
            .name(format!("hkit-{}", stream.as_str()))
            .spawn(move || {
                for line in BufReader::new(reader).lines() {
                    match line {
                        Ok(line) => sink.line(stream, &line),
                        Err(e) => {
                            tracing::warn!(stream = stream.as_str(), error = %e, "hyperkit pipe read failed");
                            break;
                        }
                    }
                }
                tracing::debug!(stream = stream.as_str(), "hyperkit pipe closed");
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Starts copying the hypervisor's PTY to `out` until `pid` exits.
    pub fn follow_tty<W: Write + Send + 'static>(
        &mut self,
        tty: File,
        pid: u32,
        out: W,
    ) -> io::Result<()> {
        let handle = thread::Builder::new()
            .name("hkit-tty".into())
            .spawn(move || {
                if let Err(e) = copy_tty(&tty, pid, out) {
                    tracing::warn!(pid, error = %e, "console copy stopped");
                }
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Waits for every copier to finish.
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("copier").to_owned();
            if handle.join().is_err() {
                tracing::warn!(thread = %name, "console copier panicked");
            }
        }
    }

    /// Lets the copiers run on unobserved; they end with the hypervisor.
    pub fn detach(self) {
        drop(self.handles);
    }
}

/// Opens the PTY symlink the hypervisor publishes at `path`.
///
/// Retries until `deadline` elapses. Returns `Ok(None)` if `pid` exits before
/// the PTY appears, and a `TimedOut` error on expiry.
pub fn open_tty(path: &Path, pid: u32, deadline: Duration) -> io::Result<Option<File>> {
    let start = Instant::now();
    loop {
        let err = match File::open(path) {
            Ok(f) => {
                make_raw(&f);
                return Ok(Some(f));
            }
            Err(e) => e,
        };
        if !process::is_alive(pid) {
            return Ok(None);
        }
        if start.elapsed() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} not ready after {deadline:?}: {err}", path.display()),
            ));
        }
        thread::sleep(TTY_RETRY);
    }
}

/// Clears ONLCR and switches the terminal to raw mode.
///
/// Anything that is not a terminal is left as is.
fn make_raw(tty: &File) {
    let mut attrs = match termios::tcgetattr(tty.as_fd()) {
        Ok(a) => a,
        Err(e) => {
            tracing::debug!(error = %e, "console is not a terminal");
            return;
        }
    };
    attrs.output_flags.remove(OutputFlags::ONLCR);
    termios::cfmakeraw(&mut attrs);
    if let Err(e) = termios::tcsetattr(tty.as_fd(), SetArg::TCSANOW, &attrs) {
        tracing::warn!(error = %e, "failed to put console in raw mode");
    }
}

/// Copies `tty` to `out` until EOF, a read error, or `pid` exiting.
fn copy_tty<W: Write>(mut tty: &File, pid: u32, mut out: W) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let ready = {
            let mut fds = [PollFd::new(tty.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(TTY_POLL_MS)).map_err(io::Error::from)?
        };
        if ready == 0 {
            if process::is_alive(pid) {
                continue;
            }
            return Ok(());
        }
        let n = match tty.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // A PTY whose master side closed reads as EIO.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(()),
            Err(e) => return Err(e),
        };
        out.write_all(&buf[..n])?;
        out.flush()?;
    }
}
