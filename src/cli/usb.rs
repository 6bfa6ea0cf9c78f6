//! USB passthrough commands.

use crate::cli::parsers::parse_usb_device;
use crate::cli::print_json;
use clap::{Args, Subcommand};
use localvm::lifecycle::{Controller, UsbTarget};
use localvm::record::UsbDevice;

/// Manage USB passthrough
#[derive(Subcommand, Debug)]
pub enum UsbCmd {
    /// Attach a host device (hot-plug if running, persist if stopped)
    Attach(AttachCmd),

    /// Detach a device (unplug if running, forget if stopped)
    Detach(DetachCmd),

    /// List host devices, or the devices assigned to a VM
    #[command(alias = "ls")]
    List(ListCmd),
}

impl UsbCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        match self {
            UsbCmd::Attach(cmd) => cmd.run(ctl),
            UsbCmd::Detach(cmd) => cmd.run(ctl),
            UsbCmd::List(cmd) => cmd.run(ctl),
        }
    }
}

/// Attach a host device.
#[derive(Args, Debug)]
pub struct AttachCmd {
    /// VM name or id
    pub name: String,

    /// Device as VVVV:PPPP[:SERIAL] (hex ids)
    #[arg(value_parser = parse_usb_device)]
    pub device: UsbDevice,
}

impl AttachCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        match ctl.usb_attach(&name, &self.device)? {
            UsbTarget::Live => println!("Attached {} to running vm '{}'", self.device, name),
            UsbTarget::Persisted => {
                println!("Vm '{}' will get {} on next start", name, self.device)
            }
        }
        Ok(())
    }
}

/// Detach a device.
#[derive(Args, Debug)]
pub struct DetachCmd {
    /// VM name or id
    pub name: String,

    /// Device as VVVV:PPPP[:SERIAL] (hex ids)
    #[arg(value_parser = parse_usb_device)]
    pub device: UsbDevice,
}

impl DetachCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        match ctl.usb_detach(&name, &self.device)? {
            UsbTarget::Live => println!("Detached {} from running vm '{}'", self.device, name),
            UsbTarget::Persisted => println!("Removed {} from vm '{}'", self.device, name),
        }
        Ok(())
    }
}

/// List devices.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// VM name or id (host devices if omitted)
    pub name: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        if let Some(reference) = &self.name {
            let name = ctl.resolve(reference)?;
            let devices = ctl.usb_list(&name)?;
            if self.json {
                return print_json(&devices);
            }
            if devices.is_empty() {
                println!("No USB devices assigned to vm '{}'", name);
            }
            for device in devices {
                println!("{}", device);
            }
            return Ok(());
        }

        let devices = ctl.usb_list_host()?;
        if self.json {
            return print_json(&devices);
        }
        if devices.is_empty() {
            println!("No USB devices found");
            return Ok(());
        }
        println!("{:<8} {:<24} {}", "BUS:DEV", "ID", "DESCRIPTION");
        for d in devices {
            let description = [d.manufacturer.as_deref(), d.product.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            println!(
                "{:<8} {:<24} {}",
                format!("{:03}:{:03}", d.bus, d.address),
                d.device.to_string(),
                description
            );
        }
        Ok(())
    }
}
