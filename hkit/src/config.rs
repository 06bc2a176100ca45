//! VM configuration model.
//!
//! A [`VmConfig`] is both what callers build before starting a VM and what
//! the state store persists afterwards: the runtime snapshot (`pid`, `argv`,
//! `cmdline`) rides along in the same document.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::layout::StateLayout;

/// Default virtio-blk driver tag for disks.
pub const DEFAULT_DISK_DRIVER: &str = "virtio-blk";

/// Default guest CID of the virtio-socket device.
pub const DEFAULT_VSOCK_GUEST_CID: u32 = 3;

/// Sentinel for [`VmConfig::vpnkit_sock`] meaning "Docker Desktop's socket".
pub const VPNKIT_AUTO: &str = "auto";

/// Location of Docker Desktop's vpnkit socket, relative to the home directory.
const DEFAULT_VPNKIT_SOCK: &str = "Library/Containers/com.docker.docker/Data/s50";

/// Where the guest serial console goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Console {
    /// Attach to the caller's stdio (a PTY log when stdout is not a terminal).
    #[default]
    Stdio,
    /// PTY plus ring-buffer log inside the state directory.
    File,
}

/// One disk exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DiskSpec {
    /// Image path. `None` (or an empty path) means "provision `diskNN.img`
    /// in the state directory".
    #[serde(default, deserialize_with = "empty_path_as_none")]
    pub path: Option<PathBuf>,
    /// Size in MiB, used when the image has to be created.
    #[serde(default)]
    pub size_mib: u64,
    /// Image format tag appended as `format=<fmt>`.
    #[serde(default)]
    pub format: Option<String>,
    /// Device driver tag.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Public key seeded into a freshly provisioned image.
    #[serde(default)]
    pub ssh_public_key: Option<PathBuf>,
}

/// Serde default for [`DiskSpec::driver`].
fn default_driver() -> String {
    DEFAULT_DISK_DRIVER.to_owned()
}

/// Reads `""` (and `null`) as no path.
fn empty_path_as_none<'de, D>(de: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<PathBuf>::deserialize(de)?.filter(|p| !p.as_os_str().is_empty()))
}

impl DiskSpec {
    /// A disk of `size_mib` provisioned inside the state directory.
    pub fn new(size_mib: u64) -> Self {
        Self {
            path: None,
            size_mib,
            format: None,
            driver: default_driver(),
            ssh_public_key: None,
        }
    }

    /// A disk backed by an image at `path`. An empty path provisions
    /// `diskNN.img` like [`new`](Self::new).
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        Self {
            path: Some(path).filter(|p| !p.as_os_str().is_empty()),
            ..Self::new(0)
        }
    }

    /// The caller-supplied image path, if any. Empty paths count as unset.
    pub fn image_path(&self) -> Option<&Path> {
        self.path.as_deref().filter(|p| !p.as_os_str().is_empty())
    }

    /// Sets the size used when the image has to be created.
    #[must_use]
    pub const fn size_mib(mut self, size_mib: u64) -> Self {
        self.size_mib = size_mib;
        self
    }

    /// Sets the format tag.
    #[must_use]
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Sets the driver tag.
    #[must_use]
    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Seeds a freshly provisioned image with this public key.
    #[must_use]
    pub fn ssh_public_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_public_key = Some(path.into());
        self
    }
}

/// A host directory shared with the guest over 9P.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Mount9p {
    /// Host directory.
    pub path: PathBuf,
    /// Mount tag the guest uses.
    pub tag: String,
}

/// Declarative description of one VM plus its runtime snapshot.
///
/// Defaults: 1 vCPU, 1024 MiB, stdio console, vsock CID 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct VmConfig {
    /// BIOS DMI product UUID, passed through verbatim.
    pub uuid: Option<String>,
    /// Directory owning state, PID file, console and provisioned disks.
    pub state_dir: Option<PathBuf>,
    /// Explicit hyperkit executable (searched on `PATH` if relative).
    pub hyperkit: Option<PathBuf>,

    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mib: u32,

    /// Kernel image for kexec boot.
    pub kernel: Option<PathBuf>,
    /// Initial ramdisk for kexec boot.
    pub initrd: Option<PathBuf>,
    /// Firmware image; when set it replaces kexec boot.
    pub bootrom: Option<PathBuf>,

    /// Disks in slot order.
    pub disks: Vec<DiskSpec>,
    /// CD image attached over AHCI.
    pub iso: Option<PathBuf>,

    /// Unix socket of the vpnkit user-mode networking daemon, or `"auto"`.
    pub vpnkit_sock: Option<PathBuf>,
    /// Key vpnkit uses to hand out a stable guest IP.
    pub vpnkit_key: Option<String>,
    /// Address the guest would like vpnkit to assign.
    pub vpnkit_preferred_ipv4: Option<Ipv4Addr>,
    /// Attach a vmnet bridged interface.
    pub vmnet: bool,

    /// Enable the virtio-socket device.
    pub vsock: bool,
    /// Guest CID of the virtio-socket device.
    pub vsock_guest_cid: u32,
    /// Guest ports exposed as Unix sockets in the state directory.
    pub vsock_ports: Vec<u32>,
    /// 9P shares in slot order.
    pub mounts_9p: Vec<Mount9p>,

    /// Console attachment mode.
    pub console: Console,

    /// Hyperkit PID, 0 when not started.
    pub pid: u32,
    /// Argument vector of the last start.
    pub argv: Vec<String>,
    /// Kernel command line of the last start.
    pub cmdline: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            state_dir: None,
            hyperkit: None,
            cpus: 1,
            memory_mib: 1024,
            kernel: None,
            initrd: None,
            bootrom: None,
            disks: Vec::new(),
            iso: None,
            vpnkit_sock: None,
            vpnkit_key: None,
            vpnkit_preferred_ipv4: None,
            vmnet: false,
            vsock: false,
            vsock_guest_cid: DEFAULT_VSOCK_GUEST_CID,
            vsock_ports: Vec::new(),
            mounts_9p: Vec::new(),
            console: Console::Stdio,
            pid: 0,
            argv: Vec::new(),
            cmdline: String::new(),
        }
    }
}

impl VmConfig {
    /// A default configuration owning `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            ..Self::default()
        }
    }

    /// Sets the DMI product UUID.
    #[must_use]
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Sets the hyperkit executable.
    #[must_use]
    pub fn hyperkit(mut self, path: impl Into<PathBuf>) -> Self {
        self.hyperkit = Some(path.into());
        self
    }

    /// Sets the vCPU count (default: 1).
    #[must_use]
    pub const fn cpus(mut self, n: u32) -> Self {
        self.cpus = n;
        self
    }

    /// Sets memory in MiB (default: 1024).
    #[must_use]
    pub const fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Sets the kexec kernel and initrd.
    #[must_use]
    pub fn kernel(mut self, kernel: impl Into<PathBuf>, initrd: impl Into<PathBuf>) -> Self {
        self.kernel = Some(kernel.into());
        self.initrd = Some(initrd.into());
        self
    }

    /// Boots from a firmware image instead of kexec.
    #[must_use]
    pub fn bootrom(mut self, path: impl Into<PathBuf>) -> Self {
        self.bootrom = Some(path.into());
        self
    }

    /// Appends a disk.
    #[must_use]
    pub fn disk(mut self, disk: DiskSpec) -> Self {
        self.disks.push(disk);
        self
    }

    /// Attaches an ISO image.
    #[must_use]
    pub fn iso(mut self, path: impl Into<PathBuf>) -> Self {
        self.iso = Some(path.into());
        self
    }

    /// Enables vpnkit networking on `sock` (or [`VPNKIT_AUTO`]).
    #[must_use]
    pub fn vpnkit(mut self, sock: impl Into<PathBuf>) -> Self {
        self.vpnkit_sock = Some(sock.into());
        self
    }

    /// Sets the vpnkit UUID key.
    #[must_use]
    pub fn vpnkit_key(mut self, key: impl Into<String>) -> Self {
        self.vpnkit_key = Some(key.into());
        self
    }

    /// Sets the vpnkit preferred guest address.
    #[must_use]
    pub const fn vpnkit_preferred_ipv4(mut self, ip: Ipv4Addr) -> Self {
        self.vpnkit_preferred_ipv4 = Some(ip);
        self
    }

    /// Enables or disables the vmnet interface.
    #[must_use]
    pub const fn vmnet(mut self, enable: bool) -> Self {
        self.vmnet = enable;
        self
    }

    /// Enables or disables the virtio-socket device.
    #[must_use]
    pub const fn vsock(mut self, enable: bool) -> Self {
        self.vsock = enable;
        self
    }

    /// Sets the virtio-socket guest CID (default: 3).
    #[must_use]
    pub const fn vsock_guest_cid(mut self, cid: u32) -> Self {
        self.vsock_guest_cid = cid;
        self
    }

    /// Exposes a guest vsock port as a host socket.
    #[must_use]
    pub fn vsock_port(mut self, port: u32) -> Self {
        self.vsock_ports.push(port);
        self
    }

    /// Shares a host directory over 9P.
    #[must_use]
    pub fn mount_9p(mut self, path: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        self.mounts_9p.push(Mount9p {
            path: path.into(),
            tag: tag.into(),
        });
        self
    }

    /// Sets the console mode.
    #[must_use]
    pub const fn console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Image path of disk `index`, assigning `diskNN.img` when unset.
    pub fn disk_path(&self, index: usize) -> Option<PathBuf> {
        let disk = self.disks.get(index)?;
        match (disk.image_path(), &self.state_dir) {
            (Some(p), _) => Some(p.to_owned()),
            (None, Some(dir)) => Some(StateLayout::new(dir).disk_image(index)),
            (None, None) => None,
        }
    }

    /// Checks structural invariants that need no file system access.
    ///
    /// `stdout_tty` says whether the caller's stdout is a terminal, which
    /// decides whether a stdio console needs a state directory.
    pub fn validate(&self, stdout_tty: bool) -> Result<()> {
        let has_dir = self
            .state_dir
            .as_deref()
            .is_some_and(|d| !d.as_os_str().is_empty());

        if self.cpus == 0 {
            return Err(invalid("cpus must be at least 1"));
        }
        if self.memory_mib == 0 {
            return Err(invalid("memory must be at least 1 MiB"));
        }
        match self.console {
            Console::File if !has_dir => {
                return Err(invalid("file console requires a state directory"));
            }
            Console::Stdio if !stdout_tty && !has_dir => {
                return Err(invalid(
                    "stdio console without a terminal requires a state directory",
                ));
            }
            _ => {}
        }
        if self.bootrom.is_none() && (self.kernel.is_none() || self.initrd.is_none()) {
            return Err(invalid("kernel and initrd are required without a bootrom"));
        }
        if self.vpnkit_sock.is_some() && self.vmnet {
            return Err(invalid("vpnkit and vmnet networking are mutually exclusive"));
        }
        if self.vsock && !has_dir {
            return Err(invalid("virtio-sockets require a state directory"));
        }
        if !self.vsock_ports.is_empty() && !self.vsock {
            return Err(invalid("vsock ports require the vsock device"));
        }
        for (i, disk) in self.disks.iter().enumerate() {
            if disk.driver.is_empty() {
                return Err(invalid(format!("disk {i}: empty driver")));
            }
            if disk.image_path().is_none() {
                if !has_dir {
                    return Err(invalid(format!(
                        "disk {i}: no path and no state directory to provision into"
                    )));
                }
                if disk.size_mib == 0 {
                    return Err(invalid(format!("disk {i}: size required when path is empty")));
                }
            }
        }
        for m in &self.mounts_9p {
            if m.tag.is_empty() {
                return Err(invalid(format!("9p mount {}: empty tag", m.path.display())));
            }
        }
        Ok(())
    }

    /// Checks that every referenced host file exists.
    pub fn check_files(&self) -> Result<()> {
        let required = [
            ("kernel", self.kernel.as_deref()),
            ("initrd", self.initrd.as_deref()),
            ("bootrom", self.bootrom.as_deref()),
            ("iso", self.iso.as_deref()),
            ("vpnkit socket", self.vpnkit_sock.as_deref()),
        ];
        for (what, path) in required {
            if let Some(p) = path {
                require_exists(what, p)?;
            }
        }
        for (i, disk) in self.disks.iter().enumerate() {
            if let Some(p) = disk.image_path()
                && disk.size_mib == 0
            {
                require_exists(&format!("disk {i}"), p)?;
            }
        }
        Ok(())
    }

    /// Replaces a `"auto"` vpnkit socket with Docker Desktop's location.
    pub fn resolve_vpnkit_sock(&mut self) -> Result<()> {
        if self.vpnkit_sock.as_deref() == Some(Path::new(VPNKIT_AUTO)) {
            let home = dirs::home_dir()
                .ok_or_else(|| invalid("cannot resolve home directory for vpnkit socket"))?;
            self.vpnkit_sock = Some(home.join(DEFAULT_VPNKIT_SOCK));
        }
        Ok(())
    }
}

/// Shorthand for [`Error::InvalidConfig`].
fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

/// Fails unless `path` exists.
fn require_exists(what: &str, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(invalid(format!("{what} {} does not exist", path.display())))
    }
}
