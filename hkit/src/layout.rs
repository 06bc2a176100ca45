//! State directory layout.
//!
//! ```text
//! {state_dir}/
//!   state.json       state document (authoritative)
//!   hyperkit.pid     written by hyperkit, cross-check only
//!   tty              symlink to the console PTY slave
//!   console-ring     console log
//!   disk00.img       provisioned disk images
//!   00000003.*       vsock forward sockets, named by hyperkit
//! ```

use std::path::{Path, PathBuf};

/// File names inside a state directory.
pub mod files {
    /// State document.
    pub const STATE: &str = "state.json";
    /// State document being written; renamed over [`STATE`] when complete.
    pub const STATE_TMP: &str = ".state.json.tmp";
    /// PID file written by hyperkit.
    pub const PID: &str = "hyperkit.pid";
    /// Console PTY symlink.
    pub const TTY: &str = "tty";
    /// Console log ring.
    pub const CONSOLE_RING: &str = "console-ring";
}

/// Paths of everything hkit and hyperkit keep in one state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    /// The state directory.
    dir: PathBuf,
}

impl StateLayout {
    /// Layout rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The state directory itself.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `state.json`.
    pub fn state_file(&self) -> PathBuf {
        self.dir.join(files::STATE)
    }

    /// `hyperkit.pid`.
    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(files::PID)
    }

    /// `tty`.
    pub fn tty(&self) -> PathBuf {
        self.dir.join(files::TTY)
    }

    /// `console-ring`.
    pub fn console_ring(&self) -> PathBuf {
        self.dir.join(files::CONSOLE_RING)
    }

    /// `diskNN.img` for disk `index`.
    pub fn disk_image(&self, index: usize) -> PathBuf {
        self.dir.join(format!("disk{index:02}.img"))
    }
}

/// Returns `true` for names of the form `diskNN.img`.
pub fn is_disk_image_name(name: &str) -> bool {
    name.strip_prefix("disk")
        .and_then(|rest| rest.strip_suffix(".img"))
        .is_some_and(|n| n.len() >= 2 && n.bytes().all(|b| b.is_ascii_digit()))
}
