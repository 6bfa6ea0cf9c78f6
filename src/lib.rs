//! localvm - lifecycle manager for locally hosted QEMU virtual machines
//!
//! localvm is a library and CLI that creates, starts, stops, resizes and
//! deletes VMs on a single host, together with their port forwards, shared
//! folders and USB passthrough assignments.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  localvm CLI                                    │
//! ├─────────────────────────────────────────────────┤
//! │  Lifecycle controller (lifecycle)               │
//! ├──────────────┬──────────────┬───────────────────┤
//! │  Lock manager│  Registry    │  Ports / shares / │
//! │  (lock)      │  (registry)  │  USB (monitor)    │
//! ├──────────────┴──────────────┴───────────────────┤
//! │  Config store (store, record, runstate, kv)     │
//! ├─────────────────────────────────────────────────┤
//! │  QEMU, qemu-img, virtiofsd (external tools)     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use localvm::config::Settings;
//! use localvm::lifecycle::{Controller, CreateSpec, StartOptions};
//!
//! let ctl = Controller::new(Settings::load()?);
//! ctl.create("web", &CreateSpec { memory_mib: Some(4096), ..Default::default() })?;
//! ctl.port_add("web", "8080:80/tcp".parse()?)?;
//! ctl.start("web", &StartOptions { headless: true })?;
//! # Ok::<(), localvm::Error>(())
//! ```
//!
//! # On-disk layout
//!
//! ```text
//! <vm_dir>/
//!   .locks/global.lock/owner
//!   .locks/vm-<name>.lock/owner
//!   <name>/vm.conf          KEY=value record, 0600
//!   <name>/run.state        process handle while running, 0600
//!   <name>/disk.qcow2
//!   <name>/monitor.sock     QEMU human monitor
//!   <name>/fs-<tag>.sock    virtiofs daemon sockets
//!   <name>/console.log      guest serial console
//!   <name>/hypervisor.log   hypervisor and daemon output
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod disk;
pub mod error;
pub mod invocation;
pub mod kv;
pub mod lifecycle;
pub mod lock;
pub mod log_rotation;
pub mod monitor;
pub mod ports;
pub mod process;
pub mod record;
pub mod registry;
pub mod runstate;
pub mod share;
pub mod size;
pub mod store;
pub mod usb;

// Re-export main types for convenience
pub use config::Settings;
pub use error::{Error, ErrorKind, Result};
pub use lifecycle::{Controller, VmState};
pub use record::VmRecord;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
