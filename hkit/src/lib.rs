//! Lifecycle manager for hyperkit-backed local virtual machines.
//!
//! `hkit` launches one VM per state directory through the external
//! [`hyperkit`] hypervisor, watches it through the process table, and tears
//! it down again. Every operation on a state directory is serialized by a
//! host-wide [`hkit_mutex`] so several processes can manage the same VM.
//!
//! # Quick start
//!
//! ```no_run
//! use hkit::{Console, DiskSpec, Hyperkit, TracingSink, VmConfig};
//! use std::sync::Arc;
//!
//! let config = VmConfig::new("/tmp/vm1")
//!     .cpus(2)
//!     .memory_mib(2048)
//!     .kernel("/boot/vmlinuz", "/boot/initrd.img")
//!     .disk(DiskSpec::new(4096))
//!     .vsock(true)
//!     .vsock_port(2375)
//!     .console(Console::File);
//!
//! let mut vm = Hyperkit::new(config).with_logger(Arc::new(TracingSink));
//! vm.start("console=ttyS0")?;
//!
//! // Later, possibly from another process:
//! let mut vm = Hyperkit::from_state("/tmp/vm1")?;
//! vm.stop()?;
//! vm.remove(true)?;
//! # Ok::<(), hkit::Error>(())
//! ```
//!
//! [`hyperkit`]: https://github.com/moby/hyperkit

pub mod args;
mod config;
#[cfg(unix)]
mod console;
#[cfg(unix)]
pub mod disk;
mod error;
pub mod layout;
#[cfg(unix)]
pub mod process;
#[cfg(unix)]
mod runtime;
#[cfg(unix)]
pub mod state;
#[cfg(unix)]
mod supervisor;

pub use config::{
    Console, DEFAULT_DISK_DRIVER, DEFAULT_VSOCK_GUEST_CID, DiskSpec, Mount9p, VPNKIT_AUTO, VmConfig,
};
#[cfg(unix)]
pub use console::{LineSink, Stream, TracingSink, strip_ansi};
pub use error::{Error, Result};
pub use hkit_mutex::Cancel;
pub use layout::StateLayout;
#[cfg(unix)]
pub use runtime::{Hyperkit, VmState, mutex_name};
#[cfg(unix)]
pub use supervisor::{DEFAULT_HYPERKITS, find_hyperkit};
