//! VM lifecycle commands.
//!
//! - create: Create a stopped VM with a fresh disk image
//! - start: Launch the hypervisor
//! - stop: Stop a running VM
//! - delete: Remove a VM and all its files
//! - resize: Grow the disk image
//! - lock / unlock: Protect a VM against changes
//! - set: Change hardware or network settings
//! - status: Show one VM
//! - list: List all VMs

use crate::cli::parsers::{parse_disk, parse_keyword, parse_memory};
use crate::cli::{print_json, truncate, yes_no, NAME_WIDTH};
use clap::Args;
use localvm::lifecycle::{ConfigChange, Controller, CreateSpec, StartOptions, VmState};
use localvm::process::StopOutcome;
use localvm::record::{NetworkType, OsType};
use localvm::size::{format_bytes, format_mib};

// ============================================================================
// Create Command
// ============================================================================

/// Create a VM without starting it.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// VM name
    pub name: String,

    /// Number of vCPUs
    #[arg(long, value_name = "N")]
    pub cores: Option<u32>,

    /// Memory size (e.g. 4096, 4G)
    #[arg(long, value_name = "SIZE", value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// Disk size (e.g. 20G, 1T)
    #[arg(long, value_name = "SIZE", value_parser = parse_disk)]
    pub disk: Option<u64>,

    /// QEMU machine type
    #[arg(long)]
    pub machine: Option<String>,

    /// QEMU CPU model
    #[arg(long)]
    pub cpu: Option<String>,

    /// Network type: user, nat or none
    #[arg(long, value_parser = parse_keyword::<NetworkType>)]
    pub network: Option<NetworkType>,

    /// NIC model (default depends on --os)
    #[arg(long)]
    pub nic: Option<String>,

    /// Guest OS family: linux, windows or other
    #[arg(long, value_parser = parse_keyword::<OsType>)]
    pub os: Option<OsType>,
}

impl CreateCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let spec = CreateSpec {
            cores: self.cores,
            memory_mib: self.memory,
            disk_mib: self.disk,
            machine: self.machine,
            cpu_model: self.cpu,
            network: self.network,
            nic_model: self.nic,
            os_type: self.os,
        };
        let record = ctl.create(&self.name, &spec)?;
        println!(
            "Created vm '{}' (id {}, {} cores, {} memory, {} disk)",
            record.name,
            record.id.unwrap_or_default(),
            record.cores,
            format_mib(record.memory_mib),
            record.disk_mib.map(format_mib).unwrap_or_else(|| "-".into()),
        );
        Ok(())
    }
}

// ============================================================================
// Start / Stop Commands
// ============================================================================

/// Start a VM.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// VM name or id
    pub name: String,

    /// Run without a graphical display
    #[arg(long)]
    pub headless: bool,
}

impl StartCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        println!("Starting vm '{}'...", name);
        crate::cli::flush_output();
        let state = ctl.start(
            &name,
            &StartOptions {
                headless: self.headless,
            },
        )?;
        println!("Vm '{}' running (PID: {})", name, state.pid);
        Ok(())
    }
}

/// Stop a VM.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// VM name or id
    pub name: String,

    /// Kill immediately instead of waiting for a clean shutdown
    #[arg(short, long)]
    pub force: bool,
}

impl StopCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        match ctl.stop(&name, self.force)? {
            StopOutcome::NotRunning => println!("Vm '{}' is not running", name),
            StopOutcome::Exited => println!("Vm '{}' stopped", name),
            StopOutcome::Killed => println!("Vm '{}' killed", name),
        }
        Ok(())
    }
}

// ============================================================================
// Delete Command
// ============================================================================

/// Delete a VM and all its files.
#[derive(Args, Debug)]
pub struct DeleteCmd {
    /// VM name or id
    pub name: String,

    /// Skip confirmation, override the lock and stop a running VM first
    #[arg(short, long)]
    pub force: bool,
}

impl DeleteCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        ctl.delete(&name, self.force)?;
        println!("Deleted vm: {}", name);
        Ok(())
    }
}

// ============================================================================
// Resize Command
// ============================================================================

/// Grow the disk image of a stopped VM.
#[derive(Args, Debug)]
pub struct ResizeCmd {
    /// VM name or id
    pub name: String,

    /// New disk size (e.g. 40G); must be larger than the current size
    #[arg(value_parser = parse_disk)]
    pub size: u64,

    /// Resize even if the VM is locked (asks for confirmation)
    #[arg(short, long)]
    pub force: bool,
}

impl ResizeCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        ctl.resize(&name, self.size, self.force)?;
        println!(
            "Resized disk of vm '{}' to {}; grow the guest partition to use the space",
            name,
            format_mib(self.size)
        );
        Ok(())
    }
}

// ============================================================================
// Lock / Unlock Commands
// ============================================================================

/// Lock a VM against changes and deletion.
#[derive(Args, Debug)]
pub struct LockCmd {
    /// VM name or id
    pub name: String,
}

impl LockCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        if ctl.lock(&name)? {
            println!("Locked vm '{}'", name);
        } else {
            println!("Vm '{}' is already locked", name);
        }
        Ok(())
    }
}

/// Unlock a VM.
#[derive(Args, Debug)]
pub struct UnlockCmd {
    /// VM name or id
    pub name: String,
}

impl UnlockCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        if ctl.unlock(&name)? {
            println!("Unlocked vm '{}'", name);
        } else {
            println!("Vm '{}' is not locked", name);
        }
        Ok(())
    }
}

// ============================================================================
// Set Command
// ============================================================================

/// Change settings of a stopped VM.
#[derive(Args, Debug)]
pub struct SetCmd {
    /// VM name or id
    pub name: String,

    /// Number of vCPUs
    #[arg(long, value_name = "N")]
    pub cores: Option<u32>,

    /// Memory size (e.g. 4096, 4G)
    #[arg(long, value_name = "SIZE", value_parser = parse_memory)]
    pub memory: Option<u64>,

    /// QEMU machine type
    #[arg(long)]
    pub machine: Option<String>,

    /// QEMU CPU model
    #[arg(long)]
    pub cpu: Option<String>,

    /// Network type: user, nat or none
    #[arg(long, value_parser = parse_keyword::<NetworkType>)]
    pub network: Option<NetworkType>,

    /// NIC model
    #[arg(long)]
    pub nic: Option<String>,

    /// Guest OS family: linux, windows or other
    #[arg(long, value_parser = parse_keyword::<OsType>)]
    pub os: Option<OsType>,
}

impl SetCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        let change = ConfigChange {
            cores: self.cores,
            memory_mib: self.memory,
            machine: self.machine,
            cpu_model: self.cpu,
            network: self.network,
            nic_model: self.nic,
            os_type: self.os,
        };
        ctl.configure(&name, &change)?;
        println!("Updated vm '{}'", name);
        Ok(())
    }
}

// ============================================================================
// Status Command
// ============================================================================

/// Show the configuration and state of a VM.
#[derive(Args, Debug)]
pub struct StatusCmd {
    /// VM name or id
    pub name: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl StatusCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        let status = ctl.status(&name)?;
        if self.json {
            return print_json(&status);
        }

        let r = &status.record;
        println!("Name:       {}", r.name);
        println!("Id:         {}", r.id.unwrap_or_default());
        match status.pid {
            Some(pid) => println!("State:      {} (PID: {})", status.state, pid),
            None => println!("State:      {}", status.state),
        }
        println!("Locked:     {}", yes_no(r.locked));
        println!("Cores:      {}", r.cores);
        println!("Memory:     {}", format_mib(r.memory_mib));
        match status.disk {
            Some(disk) => println!(
                "Disk:       {} ({} used)",
                format_bytes(disk.virtual_size),
                format_bytes(disk.actual_size)
            ),
            None => println!(
                "Disk:       {}",
                r.disk_mib.map(format_mib).unwrap_or_else(|| "-".into())
            ),
        }
        println!("Machine:    {}", r.machine);
        println!("CPU:        {}", r.cpu_model.as_deref().unwrap_or("-"));
        println!("OS:         {}", r.os_type);
        println!("Network:    {}", r.network);
        if let Some(mac) = &r.mac {
            println!("MAC:        {}", mac);
        }
        for rule in &r.port_forwards {
            println!("  Port:     {}", rule);
        }
        for share in &r.shared_folders {
            println!(
                "  Share:    {} -> {} ({})",
                share.host_path.display(),
                share.tag,
                share.transport
            );
        }
        for device in &r.usb_devices {
            println!("  USB:      {}", device);
        }
        if let Some(created) = &r.created_at {
            println!("Created:    {}", created);
        }
        if let Some(started) = &status.started_at {
            println!("Started:    {}", started);
        }
        Ok(())
    }
}

// ============================================================================
// List Command
// ============================================================================

/// List all VMs.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let vms = ctl.list()?;
        if self.json {
            return print_json(&vms);
        }
        if vms.is_empty() {
            println!("No VMs found");
            return Ok(());
        }

        println!(
            "{:<4} {:<20} {:<8} {:<5} {:<8} {:<8} {:<7} {:<6}",
            "ID", "NAME", "STATE", "CORES", "MEMORY", "DISK", "NETWORK", "LOCKED"
        );
        println!("{}", "-".repeat(72));
        for vm in vms {
            let state = match vm.state {
                VmState::Running => "running",
                VmState::Stopped => "stopped",
            };
            println!(
                "{:<4} {:<20} {:<8} {:<5} {:<8} {:<8} {:<7} {:<6}",
                vm.id,
                truncate(&vm.name, NAME_WIDTH),
                state,
                vm.cores,
                format_mib(vm.memory_mib),
                vm.disk_mib.map(format_mib).unwrap_or_else(|| "-".into()),
                vm.network,
                yes_no(vm.locked),
            );
        }
        Ok(())
    }
}
