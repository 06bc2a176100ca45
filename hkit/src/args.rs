//! Hyperkit argument vector rendering.
//!
//! Pure: the same configuration, command line and terminal flag always
//! render the same argv. PCI slots 0 (hostbridge) and 31 (LPC) are fixed;
//! the remaining devices take slots from 1 upwards in this order:
//!
//! | Order | Device                         | Present when            |
//! |-------|--------------------------------|-------------------------|
//! | 1     | `virtio-vpnkit`                | vpnkit socket set       |
//! | 2     | `virtio-net`                   | vmnet enabled           |
//! | 3     | one per disk                   | always, insertion order |
//! | 4     | `virtio-sock`                  | vsock enabled           |
//! | 5     | `ahci-cd`                      | ISO set                 |
//! | 6     | `virtio-rnd`                   | always                  |
//! | 7     | `virtio-9p`, one per mount     | insertion order         |

use std::path::Path;

use crate::config::{Console, VmConfig};
use crate::layout::StateLayout;

/// Renders the hyperkit argv (without the program name).
///
/// `stdout_tty` says whether the caller's stdout is a terminal; with a stdio
/// console it selects `com1,stdio` over the PTY plus ring-log form.
pub fn build(config: &VmConfig, cmdline: &str, stdout_tty: bool) -> Vec<String> {
    let layout = config.state_dir.as_deref().map(StateLayout::new);
    let mut argv = Argv::default();

    argv.push(["-A", "-u"]);
    if let Some(l) = &layout {
        argv.push(["-F".to_owned(), display(&l.pid_file())]);
    }
    argv.push(["-c".to_owned(), config.cpus.to_string()]);
    argv.push(["-m".to_owned(), format!("{}M", config.memory_mib)]);
    argv.push(["-s", "0:0,hostbridge", "-s", "31,lpc"]);

    if let Some(sock) = &config.vpnkit_sock {
        let mut dev = format!("virtio-vpnkit,path={}", sock.display());
        if let Some(key) = &config.vpnkit_key {
            dev.push_str(&format!(",uuid={key}"));
        }
        if let Some(ip) = config.vpnkit_preferred_ipv4 {
            dev.push_str(&format!(",preferred_ipv4={ip}"));
        }
        argv.device_fn0(&dev);
    }
    if config.vmnet {
        argv.device_fn0("virtio-net");
    }
    if let Some(uuid) = &config.uuid {
        argv.push(["-U", uuid.as_str()]);
    }

    for (i, disk) in config.disks.iter().enumerate() {
        let path = config.disk_path(i).unwrap_or_default();
        let mut dev = format!("{},{}", disk.driver, path.display());
        if let Some(fmt) = disk.format.as_deref().filter(|f| !f.is_empty()) {
            dev.push_str(&format!(",format={fmt}"));
        }
        argv.device_fn0(&dev);
    }

    if config.vsock {
        let dir = config.state_dir.as_deref().map(display).unwrap_or_default();
        let mut dev = format!("virtio-sock,guest_cid={},path={dir}", config.vsock_guest_cid);
        if !config.vsock_ports.is_empty() {
            let ports: Vec<String> = config.vsock_ports.iter().map(u32::to_string).collect();
            dev.push_str(&format!(",guest_forwards={}", ports.join(";")));
        }
        argv.device(&dev);
    }
    if let Some(iso) = &config.iso {
        argv.device(&format!("ahci-cd,{}", iso.display()));
    }
    argv.device("virtio-rnd");
    for m in &config.mounts_9p {
        argv.device(&format!("virtio-9p,path={},tag={}", m.path.display(), m.tag));
    }

    let com1 = match (&config.console, &layout) {
        (Console::Stdio, _) if stdout_tty => "com1,stdio".to_owned(),
        (_, Some(l)) => format!(
            "com1,autopty={},log={}",
            display(&l.tty()),
            display(&l.console_ring())
        ),
        // Rejected by validation; render the only form that needs no directory.
        (_, None) => "com1,stdio".to_owned(),
    };
    argv.push(["-l".to_owned(), com1]);

    let boot = match (&config.bootrom, &config.kernel, &config.initrd) {
        (Some(rom), ..) => format!("bootrom,{},,", rom.display()),
        (None, kernel, initrd) => format!(
            "kexec,{},{},earlyprintk=serial {cmdline}",
            kernel.as_deref().map(display).unwrap_or_default(),
            initrd.as_deref().map(display).unwrap_or_default(),
        ),
    };
    argv.push(["-f".to_owned(), boot]);

    argv.args
}

/// Lossy path rendering.
fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Argument accumulator with a PCI slot counter.
#[derive(Debug)]
struct Argv {
    /// Rendered arguments.
    args: Vec<String>,
    /// Next free PCI slot.
    next_slot: u32,
}

impl Default for Argv {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            next_slot: 1,
        }
    }
}

impl Argv {
    /// Appends literal arguments.
    fn push<S: Into<String>>(&mut self, args: impl IntoIterator<Item = S>) {
        self.args.extend(args.into_iter().map(Into::into));
    }

    /// Appends `-s <slot>,<dev>` and advances the slot.
    fn device(&mut self, dev: &str) {
        let arg = format!("{},{dev}", self.take_slot());
        self.push(["-s".to_owned(), arg]);
    }

    /// Appends `-s <slot>:0,<dev>` (explicit function 0) and advances the slot.
    fn device_fn0(&mut self, dev: &str) {
        let arg = format!("{}:0,{dev}", self.take_slot());
        self.push(["-s".to_owned(), arg]);
    }

    /// Returns the next slot number.
    const fn take_slot(&mut self) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::DiskSpec;

    fn base() -> VmConfig {
        VmConfig::new("/tmp/vm1").kernel("/k", "/i")
    }

    /// Values of every `-s` flag, in order.
    fn slots(argv: &[String]) -> Vec<&str> {
        argv.windows(2)
            .filter(|w| w[0] == "-s")
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn minimal_tty_argv() {
        let argv = build(&base(), "console=ttyS0", true);
        assert_eq!(
            argv,
            [
                "-A",
                "-u",
                "-F",
                "/tmp/vm1/hyperkit.pid",
                "-c",
                "1",
                "-m",
                "1024M",
                "-s",
                "0:0,hostbridge",
                "-s",
                "31,lpc",
                "-s",
                "1,virtio-rnd",
                "-l",
                "com1,stdio",
                "-f",
                "kexec,/k,/i,earlyprintk=serial console=ttyS0",
            ]
        );
    }

    #[test]
    fn slot_order_with_every_device() {
        let cfg = base()
            .uuid("c0ffee00-0000-4000-8000-000000000001")
            .vpnkit("/var/run/vpnkit.sock")
            .vpnkit_key("c0ffee00-0000-4000-8000-000000000002")
            .disk(DiskSpec::new(100))
            .disk(DiskSpec::at("/vols/data.img").format("qcow"))
            .vsock(true)
            .vsock_port(5000)
            .vsock_port(6000)
            .mount_9p("/Users", "home");
        let argv = build(&cfg, "", true);

        assert_eq!(
            slots(&argv),
            [
                "0:0,hostbridge",
                "31,lpc",
                "1:0,virtio-vpnkit,path=/var/run/vpnkit.sock,uuid=c0ffee00-0000-4000-8000-000000000002",
                "2:0,virtio-blk,/tmp/vm1/disk00.img",
                "3:0,virtio-blk,/vols/data.img,format=qcow",
                "4,virtio-sock,guest_cid=3,path=/tmp/vm1,guest_forwards=5000;6000",
                "5,virtio-rnd",
                "6,virtio-9p,path=/Users,tag=home",
            ]
        );
        let forwards: Vec<_> = argv
            .iter()
            .filter(|a| a.contains("guest_forwards"))
            .collect();
        assert_eq!(forwards.len(), 1);

        // -U follows the network devices and precedes the disks.
        let u = argv.iter().position(|a| a == "-U").unwrap();
        assert_eq!(argv[u + 1], "c0ffee00-0000-4000-8000-000000000001");
        assert!(argv[u - 1].contains("virtio-vpnkit"));
        assert!(argv[u + 3].contains("disk00.img"));
    }

    #[test]
    fn vmnet_iso_and_bare_vsock() {
        let cfg = base().vmnet(true).vsock(true).vsock_guest_cid(7).iso("/boot.iso");
        let argv = build(&cfg, "", true);
        assert_eq!(
            slots(&argv)[2..],
            [
                "1:0,virtio-net",
                "2,virtio-sock,guest_cid=7,path=/tmp/vm1",
                "3,ahci-cd,/boot.iso",
                "4,virtio-rnd",
            ]
        );
    }

    #[test]
    fn preferred_ipv4_rides_on_vpnkit() {
        let cfg = base()
            .vpnkit("/s")
            .vpnkit_preferred_ipv4(std::net::Ipv4Addr::new(192, 168, 65, 9));
        let argv = build(&cfg, "", true);
        assert_eq!(slots(&argv)[2], "1:0,virtio-vpnkit,path=/s,preferred_ipv4=192.168.65.9");
    }

    #[test]
    fn console_without_tty_uses_autopty() {
        let argv = build(&base(), "", false);
        let l = argv.iter().position(|a| a == "-l").unwrap();
        assert_eq!(
            argv[l + 1],
            "com1,autopty=/tmp/vm1/tty,log=/tmp/vm1/console-ring"
        );

        let argv = build(&base().console(Console::File), "", true);
        let l = argv.iter().position(|a| a == "-l").unwrap();
        assert!(argv[l + 1].starts_with("com1,autopty="));
    }

    #[test]
    fn bootrom_replaces_kexec() {
        let cfg = VmConfig::new("/tmp/vm1").bootrom("/fw/UEFI.fd");
        let argv = build(&cfg, "ignored", true);
        assert_eq!(argv[argv.len() - 2..], ["-f", "bootrom,/fw/UEFI.fd,,"]);
    }

    #[test]
    fn no_state_dir_omits_pid_file() {
        let mut cfg = base();
        cfg.state_dir = None;
        let argv = build(&cfg, "", true);
        assert!(!argv.iter().any(|a| a == "-F"));
    }

    #[test]
    fn deterministic_and_local_to_one_device() {
        let a = base().disk(DiskSpec::new(10)).disk(DiskSpec::new(10)).cpus(2);
        assert_eq!(build(&a, "x", true), build(&a.clone(), "x", true));

        let mut b = a.clone();
        b.disks[1].driver = "ahci-hd".into();
        let (ra, rb) = (build(&a, "x", true), build(&b, "x", true));
        assert_eq!(ra.len(), rb.len());
        let diff: Vec<_> = ra.iter().zip(&rb).filter(|(x, y)| x != y).collect();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].1, "2:0,ahci-hd,/tmp/vm1/disk01.img");
    }
}
