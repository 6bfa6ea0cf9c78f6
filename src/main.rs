//! localvm CLI entry point.

use clap::{Parser, Subcommand};
use localvm::config::Settings;
use localvm::lifecycle::Controller;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cli;

/// localvm - lifecycle manager for local QEMU virtual machines
#[derive(Parser, Debug)]
#[command(name = "localvm")]
#[command(about = "Create, run and manage local QEMU virtual machines")]
#[command(
    long_about = "localvm manages QEMU virtual machines on a single host: disks, \
port forwards, shared folders and USB passthrough, with safe concurrent use.\n\n\
Quick start:\n  \
localvm create web --memory 4G --disk 20G\n  \
localvm port add web 8080:80\n  \
localvm start web --headless"
)]
#[command(version)]
struct Cli {
    /// Settings file (default: $LOCALVM_CONFIG or ~/.config/localvm/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// How long to wait for a busy lock (e.g. "10s", "2m")
    #[arg(long, global = true, value_name = "DURATION", value_parser = cli::parsers::parse_duration)]
    lock_timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a VM without starting it
    Create(cli::vm::CreateCmd),

    /// Start a VM
    Start(cli::vm::StartCmd),

    /// Stop a VM
    Stop(cli::vm::StopCmd),

    /// Delete a VM and all its files
    #[command(alias = "rm")]
    Delete(cli::vm::DeleteCmd),

    /// Grow the disk of a stopped VM
    Resize(cli::vm::ResizeCmd),

    /// Lock a VM against changes and deletion
    Lock(cli::vm::LockCmd),

    /// Unlock a VM
    Unlock(cli::vm::UnlockCmd),

    /// Change settings of a stopped VM
    Set(cli::vm::SetCmd),

    /// Show the configuration and state of a VM
    Status(cli::vm::StatusCmd),

    /// List all VMs
    #[command(alias = "ls")]
    List(cli::vm::ListCmd),

    /// Manage port forwards
    #[command(subcommand)]
    Port(cli::port::PortCmd),

    /// Manage shared folders
    #[command(subcommand)]
    Share(cli::share::ShareCmd),

    /// Manage USB passthrough
    #[command(subcommand)]
    Usb(cli::usb::UsbCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();
    localvm::process::install_interrupt_handler();

    tracing::debug!(version = localvm::VERSION, "starting localvm");

    let settings = match load_settings(&cli) {
        Ok(s) => s,
        Err(e) => exit_with(e),
    };
    let ctl = Controller::new(settings);

    // Execute command
    let result = match cli.command {
        Commands::Create(cmd) => cmd.run(&ctl),
        Commands::Start(cmd) => cmd.run(&ctl),
        Commands::Stop(cmd) => cmd.run(&ctl),
        Commands::Delete(cmd) => cmd.run(&ctl),
        Commands::Resize(cmd) => cmd.run(&ctl),
        Commands::Lock(cmd) => cmd.run(&ctl),
        Commands::Unlock(cmd) => cmd.run(&ctl),
        Commands::Set(cmd) => cmd.run(&ctl),
        Commands::Status(cmd) => cmd.run(&ctl),
        Commands::List(cmd) => cmd.run(&ctl),
        Commands::Port(cmd) => cmd.run(&ctl),
        Commands::Share(cmd) => cmd.run(&ctl),
        Commands::Usb(cmd) => cmd.run(&ctl),
    };

    ctl.locks().release_all();

    // Handle errors
    if let Err(e) = result {
        exit_with(e);
    }
}

fn load_settings(cli: &Cli) -> localvm::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    if let Some(timeout) = cli.lock_timeout {
        settings.lock_timeout = timeout;
    }
    Ok(settings)
}

fn exit_with(e: localvm::Error) -> ! {
    tracing::error!(error = %e, "command failed");
    eprintln!("Error: {}", e);
    std::process::exit(e.kind().exit_code());
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localvm=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
