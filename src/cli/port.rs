//! Port forwarding commands.

use crate::cli::parsers::{parse_host_port, parse_port_forward};
use crate::cli::{print_json, truncate, NAME_WIDTH};
use clap::{Args, Subcommand};
use localvm::lifecycle::Controller;
use localvm::record::{PortForward, Protocol};

/// Manage host-to-guest port forwards (user networking only)
#[derive(Subcommand, Debug)]
pub enum PortCmd {
    /// Forward a host port to the guest
    Add(AddCmd),

    /// Remove a forward
    #[command(alias = "rm")]
    Remove(RemoveCmd),

    /// List forwards of one VM or of all VMs
    #[command(alias = "ls")]
    List(ListCmd),
}

impl PortCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        match self {
            PortCmd::Add(cmd) => cmd.run(ctl),
            PortCmd::Remove(cmd) => cmd.run(ctl),
            PortCmd::List(cmd) => cmd.run(ctl),
        }
    }
}

/// Forward a host port to the guest.
#[derive(Args, Debug)]
pub struct AddCmd {
    /// VM name or id
    pub name: String,

    /// Rule as HOST:GUEST[/tcp|udp]
    #[arg(value_parser = parse_port_forward)]
    pub rule: PortForward,
}

impl AddCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        if ctl.port_add(&name, self.rule)? {
            println!("Forwarding {} for vm '{}'", self.rule, name);
        } else {
            println!("Vm '{}' already forwards {}", name, self.rule);
        }
        Ok(())
    }
}

/// Remove a forward.
#[derive(Args, Debug)]
pub struct RemoveCmd {
    /// VM name or id
    pub name: String,

    /// Host port as PORT[/tcp|udp]
    #[arg(value_parser = parse_host_port)]
    pub port: (u16, Protocol),
}

impl RemoveCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        let (host_port, protocol) = self.port;
        let rule = ctl.port_remove(&name, host_port, protocol)?;
        println!("Removed {} from vm '{}'", rule, name);
        Ok(())
    }
}

/// List forwards.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// VM name or id (all VMs if omitted)
    pub name: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = self.name.as_deref().map(|n| ctl.resolve(n)).transpose()?;
        let forwards = ctl.port_list(name.as_deref())?;
        if self.json {
            return print_json(&forwards);
        }
        if forwards.is_empty() {
            println!("No port forwards");
            return Ok(());
        }
        println!("{:<20} {:<10} {:<10} {:<5}", "VM", "HOST", "GUEST", "PROTO");
        println!("{}", "-".repeat(48));
        for f in forwards {
            println!(
                "{:<20} {:<10} {:<10} {:<5}",
                truncate(&f.vm, NAME_WIDTH),
                f.rule.host_port,
                f.rule.guest_port,
                f.rule.protocol
            );
        }
        Ok(())
    }
}
