//! CLI for hkit hyperkit VMs.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod vm;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "HKIT_LOG";

#[derive(Parser)]
#[command(name = "hkit", version, about = "Run local VMs on hyperkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot a VM and stay attached until hyperkit exits.
    Run(Box<vm::BootArgs>),

    /// Boot a VM in the background.
    Start(Box<vm::BootArgs>),

    /// Print the hyperkit command line without starting anything.
    Args(Box<vm::BootArgs>),

    /// Stop one or more VMs with SIGTERM.
    Stop(vm::StopArgs),

    /// Force-kill one or more VMs.
    Kill(vm::TargetArgs),

    /// Show whether VMs are running.
    #[command(visible_alias = "ps")]
    Status(vm::StatusArgs),

    /// Remove the state of one or more stopped VMs.
    Rm(vm::RmArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    init_tracing();
    match Cli::parse().dispatch() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("hkit: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Installs a stderr subscriber filtered by `HKIT_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .try_init();
}

impl Cli {
    /// Runs the command, returning the process exit code.
    fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::Run(args) => vm::run(&args),
            Command::Start(args) => vm::start(&args).map(|()| 0),
            Command::Args(args) => vm::print_args(&args).map(|()| 0),
            Command::Stop(args) => vm::stop(&args).map(|()| 0),
            Command::Kill(args) => vm::kill(&args).map(|()| 0),
            Command::Status(args) => vm::status(&args).map(|()| 0),
            Command::Rm(args) => vm::rm(&args).map(|()| 0),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "hkit", &mut std::io::stdout());
                Ok(0)
            }
        }
    }
}
