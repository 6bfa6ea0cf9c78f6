//! Shared folder commands.

use crate::cli::parsers::parse_keyword;
use crate::cli::print_json;
use clap::{Args, Subcommand};
use localvm::lifecycle::Controller;
use localvm::record::ShareTransport;
use std::path::PathBuf;

/// Manage folders shared from the host
#[derive(Subcommand, Debug)]
pub enum ShareCmd {
    /// Share a host directory with a stopped VM
    Add(AddCmd),

    /// Stop sharing a directory
    #[command(alias = "rm")]
    Remove(RemoveCmd),

    /// List shared folders of a VM
    #[command(alias = "ls")]
    List(ListCmd),
}

impl ShareCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        match self {
            ShareCmd::Add(cmd) => cmd.run(ctl),
            ShareCmd::Remove(cmd) => cmd.run(ctl),
            ShareCmd::List(cmd) => cmd.run(ctl),
        }
    }
}

/// Share a host directory.
#[derive(Args, Debug)]
pub struct AddCmd {
    /// VM name or id
    pub name: String,

    /// Host directory
    pub path: PathBuf,

    /// Mount tag seen by the guest (derived from the path if omitted)
    #[arg(long)]
    pub tag: Option<String>,

    /// Transport: virtiofs, 9p or smb
    #[arg(long, default_value = "virtiofs", value_parser = parse_keyword::<ShareTransport>)]
    pub transport: ShareTransport,
}

impl AddCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        let folder = ctl.share_add(&name, &self.path, self.tag.as_deref(), self.transport)?;
        println!(
            "Sharing {} with vm '{}' as '{}' ({})",
            folder.host_path.display(),
            name,
            folder.tag,
            folder.transport
        );
        Ok(())
    }
}

/// Stop sharing a directory.
#[derive(Args, Debug)]
pub struct RemoveCmd {
    /// VM name or id
    pub name: String,

    /// Mount tag of the share
    pub tag: String,
}

impl RemoveCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        let folder = ctl.share_remove(&name, &self.tag)?;
        println!("Stopped sharing {} with vm '{}'", folder.host_path.display(), name);
        Ok(())
    }
}

/// List shared folders.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// VM name or id
    pub name: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    pub fn run(self, ctl: &Controller) -> localvm::Result<()> {
        let name = ctl.resolve(&self.name)?;
        let folders = ctl.share_list(&name)?;
        if self.json {
            return print_json(&folders);
        }
        if folders.is_empty() {
            println!("No shared folders");
            return Ok(());
        }
        println!("{:<32} {:<10} {}", "TAG", "TRANSPORT", "PATH");
        for f in folders {
            println!("{:<32} {:<10} {}", f.tag, f.transport, f.host_path.display());
        }
        Ok(())
    }
}
