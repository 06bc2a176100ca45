//! VM commands: `run`, `start`, `args`, `stop`, `kill`, `status`, `rm`.

use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use hkit::{Console, DiskSpec, Error, Hyperkit, TracingSink, VmConfig, VmState};
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

/// Environment variable naming the hyperkit executable.
const HYPERKIT_ENV: &str = "HKIT_HYPERKIT";

/// Arguments shared by `run`, `start` and `args`.
#[derive(clap::Args)]
pub struct BootArgs {
    /// State directory of the VM.
    #[arg(short = 's', long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// JSON VM configuration to start from; flags override it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Kernel command line.
    #[arg(long)]
    cmdline: Option<String>,

    /// Number of virtual CPUs.
    #[arg(long)]
    cpus: Option<u32>,

    /// Memory in MiB.
    #[arg(short = 'm', long)]
    memory: Option<u32>,

    /// Kernel image for kexec boot.
    #[arg(long, requires = "initrd")]
    kernel: Option<PathBuf>,

    /// Initial ramdisk for kexec boot.
    #[arg(long, requires = "kernel")]
    initrd: Option<PathBuf>,

    /// Firmware image to boot instead of a kernel.
    #[arg(long, conflicts_with = "kernel")]
    bootrom: Option<PathBuf>,

    /// Provision a disk of this many MiB in the state directory.
    #[arg(long = "disk", value_name = "MIB")]
    disks: Vec<u64>,

    /// Attach an existing disk image.
    #[arg(long = "disk-path", value_name = "PATH")]
    disk_paths: Vec<PathBuf>,

    /// Public key seeded into provisioned disks.
    #[arg(long, value_name = "PATH")]
    ssh_key: Option<PathBuf>,

    /// CD image to attach.
    #[arg(long)]
    iso: Option<PathBuf>,

    /// vpnkit socket, or `auto` for Docker Desktop's.
    #[arg(long, value_name = "SOCK", conflicts_with = "vmnet")]
    vpnkit: Option<PathBuf>,

    /// Key vpnkit uses to hand out a stable address.
    #[arg(long, requires = "vpnkit")]
    vpnkit_key: Option<String>,

    /// Attach a vmnet bridged interface.
    #[arg(long)]
    vmnet: bool,

    /// Enable the virtio-socket device.
    #[arg(long)]
    vsock: bool,

    /// Guest vsock port to expose as a socket in the state directory.
    #[arg(long = "vsock-port", value_name = "PORT", requires = "vsock")]
    vsock_ports: Vec<u32>,

    /// Share a host directory over 9P (format: hostPath:tag).
    #[arg(long = "mount", value_name = "HOST:TAG")]
    mounts: Vec<String>,

    /// DMI product UUID.
    #[arg(long)]
    uuid: Option<String>,

    /// Console mode.
    #[arg(long, value_enum)]
    console: Option<ConsoleArg>,

    /// hyperkit executable [env: HKIT_HYPERKIT].
    #[arg(long, value_name = "PATH")]
    hyperkit: Option<PathBuf>,

    /// Give up waiting for the state-directory lock after this many seconds.
    #[arg(long, value_name = "SECS")]
    lock_timeout: Option<u64>,
}

/// Console mode flag values.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum ConsoleArg {
    /// Attach to this terminal.
    Stdio,
    /// PTY plus a ring log in the state directory.
    File,
}

impl From<ConsoleArg> for Console {
    fn from(c: ConsoleArg) -> Self {
        match c {
            ConsoleArg::Stdio => Self::Stdio,
            ConsoleArg::File => Self::File,
        }
    }
}

/// One or more state directories.
#[derive(clap::Args)]
pub struct TargetArgs {
    /// State directories (default: the default VM).
    #[arg(value_name = "DIR")]
    targets: Vec<PathBuf>,

    /// Give up waiting for the state-directory lock after this many seconds.
    #[arg(long, value_name = "SECS")]
    lock_timeout: Option<u64>,
}

/// Arguments for `hkit stop`.
#[derive(clap::Args)]
pub struct StopArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Fail if the VM is still up after this many seconds.
    #[arg(short = 't', long, value_name = "SECS")]
    time: Option<u64>,
}

/// Arguments for `hkit status`.
#[derive(clap::Args)]
pub struct StatusArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Output format.
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
}

/// Arguments for `hkit rm`.
#[derive(clap::Args)]
pub struct RmArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Keep provisioned disk images.
    #[arg(long)]
    keep_disk: bool,

    /// Kill a running VM before removing it.
    #[arg(short = 'f', long)]
    force: bool,
}

/// Output format for `status`.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

/// Default state directory: `<local data dir>/hkit/default`.
fn default_state_dir() -> Result<PathBuf> {
    Ok(dirs::data_local_dir()
        .context("no platform data directory")?
        .join("hkit")
        .join("default"))
}

impl BootArgs {
    /// Builds the VM configuration from `--config` plus flag overrides.
    fn config(&self) -> Result<VmConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let data =
                    fs::read(path).with_context(|| format!("read {}", path.display()))?;
                serde_json::from_slice::<VmConfig>(&data)
                    .with_context(|| format!("parse {}", path.display()))?
            }
            None => VmConfig::default(),
        };
        // A config file describes a VM; any runtime snapshot in it is stale.
        cfg.pid = 0;
        cfg.argv.clear();

        cfg.state_dir = Some(match (&self.state_dir, cfg.state_dir.take()) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => dir,
            (None, None) => default_state_dir()?,
        });

        if let Some(n) = self.cpus {
            cfg = cfg.cpus(n);
        }
        if let Some(mib) = self.memory {
            cfg = cfg.memory_mib(mib);
        }
        if let (Some(k), Some(i)) = (&self.kernel, &self.initrd) {
            cfg = cfg.kernel(k, i);
        }
        if let Some(rom) = &self.bootrom {
            cfg = cfg.bootrom(rom);
        }
        for size in &self.disks {
            let mut disk = DiskSpec::new(*size);
            if let Some(key) = &self.ssh_key {
                disk = disk.ssh_public_key(key);
            }
            cfg = cfg.disk(disk);
        }
        for path in &self.disk_paths {
            cfg = cfg.disk(DiskSpec::at(path));
        }
        if let Some(iso) = &self.iso {
            cfg = cfg.iso(iso);
        }
        if let Some(sock) = &self.vpnkit {
            cfg = cfg.vpnkit(sock);
        }
        if let Some(key) = &self.vpnkit_key {
            cfg = cfg.vpnkit_key(key);
        }
        if self.vmnet {
            cfg = cfg.vmnet(true);
        }
        if self.vsock {
            cfg = cfg.vsock(true);
        }
        for port in &self.vsock_ports {
            cfg = cfg.vsock_port(*port);
        }
        for m in &self.mounts {
            let (host, tag) = m
                .split_once(':')
                .with_context(|| format!("invalid mount '{m}', expected hostPath:tag"))?;
            cfg = cfg.mount_9p(host, tag);
        }
        if let Some(uuid) = &self.uuid {
            cfg = cfg.uuid(uuid);
        }
        if let Some(console) = self.console {
            cfg = cfg.console(console.into());
        }
        if let Some(h) = &self.hyperkit {
            cfg = cfg.hyperkit(h);
        } else if cfg.hyperkit.is_none()
            && let Some(h) = env::var_os(HYPERKIT_ENV)
        {
            cfg = cfg.hyperkit(h);
        }
        Ok(cfg)
    }

    /// Kernel command line: the flag, else the one in `--config`.
    fn cmdline(&self, cfg: &VmConfig) -> String {
        self.cmdline.clone().unwrap_or_else(|| cfg.cmdline.clone())
    }

    /// A controller for the configured VM.
    fn controller(&self, cfg: VmConfig) -> Hyperkit {
        with_lock_timeout(
            Hyperkit::new(cfg).with_logger(Arc::new(TracingSink)),
            self.lock_timeout,
        )
    }
}

/// Applies `--lock-timeout` to a controller.
fn with_lock_timeout(vm: Hyperkit, secs: Option<u64>) -> Hyperkit {
    match secs {
        Some(s) => vm.lock_timeout(Duration::from_secs(s)),
        None => vm,
    }
}

/// `hkit run`: boots in the foreground and returns hyperkit's exit code.
pub fn run(args: &BootArgs) -> Result<i32> {
    let cfg = args.config()?;
    let cmdline = args.cmdline(&cfg);
    let state_dir = cfg.state_dir.clone().context("no state directory")?;
    let mut vm = args.controller(cfg);

    let signals = forward_signals(state_dir)?;
    let code = vm.run(&cmdline);
    signals.close();
    Ok(code?)
}

/// `hkit start`: boots in the background and prints the PID.
pub fn start(args: &BootArgs) -> Result<()> {
    let cfg = args.config()?;
    let cmdline = args.cmdline(&cfg);
    let mut vm = args.controller(cfg);
    vm.start(&cmdline)?;
    println!("{}", vm.pid());
    Ok(())
}

/// `hkit args`: prints the command line `start` would run.
pub fn print_args(args: &BootArgs) -> Result<()> {
    let mut cfg = args.config()?;
    let tty = io::stdout().is_terminal();
    cfg.validate(tty)?;
    cfg.resolve_vpnkit_sock()?;
    let program = hkit::find_hyperkit(cfg.hyperkit.as_deref())
        .unwrap_or_else(|_| PathBuf::from("hyperkit"));
    let argv = hkit::args::build(&cfg, &args.cmdline(&cfg), tty);

    let mut line = quote(&program.to_string_lossy());
    for a in &argv {
        line.push(' ');
        line.push_str(&quote(a));
    }
    println!("{line}");
    Ok(())
}

/// Single-quotes `s` for a POSIX shell when it needs quoting.
fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=,@%+".contains(&b));
    if plain {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Forwards SIGINT/SIGTERM to the hyperkit recorded in `state_dir`.
fn forward_signals(state_dir: PathBuf) -> Result<Handle> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("install signal handlers")?;
    let handle = signals.handle();
    thread::Builder::new()
        .name("hkit-signals".into())
        .spawn(move || {
            for raw in signals.forever() {
                let Ok(sig) = Signal::try_from(raw) else {
                    continue;
                };
                let target = hkit::state::read_document(&state_dir)
                    .ok()
                    .filter(|doc| hkit::state::verify_pid(doc).is_ok());
                match target {
                    Some(doc) => {
                        tracing::debug!(pid = doc.pid, signal = %sig, "forwarding signal");
                        if let Err(e) = hkit::process::signal(doc.pid, sig) {
                            tracing::warn!(pid = doc.pid, error = %e, "failed to forward signal");
                        }
                    }
                    None => tracing::debug!(signal = %sig, "no hyperkit to forward to"),
                }
            }
        })
        .context("spawn signal forwarder")?;
    Ok(handle)
}

/// State directories named on the command line, or the default one.
fn targets(args: &TargetArgs) -> Result<Vec<PathBuf>> {
    if args.targets.is_empty() {
        Ok(vec![default_state_dir()?])
    } else {
        Ok(args.targets.clone())
    }
}

/// Attaches to `dir`, whether or not its VM is alive.
fn open(dir: &Path, lock_timeout: Option<u64>) -> hkit::Result<Hyperkit> {
    Hyperkit::recover(dir).map(|vm| with_lock_timeout(vm, lock_timeout))
}

/// Runs `op` on every target, printing the ones that succeed.
fn for_each_target(
    args: &TargetArgs,
    mut op: impl FnMut(&Path) -> hkit::Result<()>,
) -> Result<()> {
    let mut errors = Vec::new();
    for dir in targets(args)? {
        match op(&dir) {
            Ok(()) => println!("{}", dir.display()),
            Err(e) => errors.push(format!("{}: {e}", dir.display())),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        bail!("{}", errors.join("\n"))
    }
}

/// `hkit stop`.
pub fn stop(args: &StopArgs) -> Result<()> {
    for_each_target(&args.target, |dir| {
        let mut vm = open(dir, args.target.lock_timeout)?;
        match args.time {
            Some(secs) => vm.stop_timeout(Duration::from_secs(secs)),
            None => vm.stop(),
        }
    })
}

/// `hkit kill`.
pub fn kill(args: &TargetArgs) -> Result<()> {
    for_each_target(args, |dir| open(dir, args.lock_timeout)?.kill())
}

/// `hkit rm`.
pub fn rm(args: &RmArgs) -> Result<()> {
    let lock_timeout = args.target.lock_timeout;
    for_each_target(&args.target, |dir| {
        let mut vm = match open(dir, lock_timeout) {
            Ok(vm) => vm,
            // Nothing recorded: clear whatever hkit-named files are left.
            Err(Error::NoState(_)) => {
                with_lock_timeout(Hyperkit::new(VmConfig::new(dir)), lock_timeout)
            }
            Err(e) => return Err(e),
        };
        if args.force {
            vm.kill()?;
        }
        vm.remove(args.keep_disk)
    })
}

/// `hkit status`.
pub fn status(args: &StatusArgs) -> Result<()> {
    let mut rows = Vec::new();
    for dir in targets(&args.target)? {
        let (state, pid) = match Hyperkit::recover(&dir) {
            Ok(vm) => (state_label(vm.state()), vm.pid()),
            Err(Error::NoState(_)) => ("absent", 0),
            Err(e) => return Err(e).with_context(|| format!("{}", dir.display())),
        };
        rows.push((dir, state, pid));
    }

    if matches!(args.format, OutputFormat::Json) {
        let list: Vec<_> = rows
            .iter()
            .map(|(dir, state, pid)| {
                serde_json::json!({ "state_dir": dir, "state": state, "pid": pid })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    println!("{:<10} {:<8} STATE DIR", "STATE", "PID");
    for (dir, state, pid) in &rows {
        let pid = if *pid == 0 { "-".to_owned() } else { pid.to_string() };
        println!("{state:<10} {pid:<8} {}", dir.display());
    }
    Ok(())
}

/// Lower-case name of a lifecycle state.
const fn state_label(state: VmState) -> &'static str {
    match state {
        VmState::Configured => "stopped",
        VmState::Starting => "starting",
        VmState::Running => "running",
        VmState::Stopping => "stopping",
        VmState::Exited => "exited",
        VmState::Removed => "removed",
        _ => "unknown",
    }
}
