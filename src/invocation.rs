//! Hypervisor argument construction.
//!
//! [`build`] is a pure function of the record and the launch context: the
//! same inputs always yield the same argument list, so two runs of a VM can
//! be diffed. The only filesystem access is the disk presence check.

use crate::error::{Error, Result};
use crate::record::{NetworkType, OsType, ShareTransport, VmRecord};
use crate::store::VmLayout;
use sha2::{Digest, Sha256};

/// CPU model used when the record leaves it unset.
pub const FALLBACK_CPU_MODEL: &str = "max";

/// Launch-time inputs that are not part of the record.
#[derive(Debug, Clone)]
pub struct InvocationContext<'a> {
    /// Artifact paths of the VM.
    pub layout: &'a VmLayout,
    /// Bridge used by `nat` networking.
    pub nat_bridge: &'a str,
    /// Attach a USB controller even without persisted devices.
    pub usb_controller: bool,
    /// Run without a display.
    pub headless: bool,
}

/// Escape a value embedded in a QEMU option list (commas are doubled).
fn opt(value: &str) -> String {
    value.replace(',', ",,")
}

/// NIC model for the record, defaulting by OS type.
pub fn nic_model(record: &VmRecord) -> &str {
    match (&record.nic_model, record.os_type) {
        (Some(model), _) => model.as_str(),
        (None, OsType::Windows) => "e1000",
        (None, _) => "virtio-net-pci",
    }
}

/// Build the hypervisor arguments (without the program itself).
pub fn build(record: &VmRecord, ctx: &InvocationContext<'_>) -> Result<Vec<String>> {
    let disk = ctx.layout.disk();
    if !disk.is_file() {
        return Err(Error::DiskNotFound { path: disk });
    }

    let mut args: Vec<String> = Vec::new();
    let mut push = |a: &str, b: String| {
        args.push(a.to_string());
        args.push(b);
    };

    push("-name", opt(&record.name));
    push("-machine", format!("{},accel=kvm:tcg", record.machine));
    push(
        "-cpu",
        record
            .cpu_model
            .clone()
            .unwrap_or_else(|| FALLBACK_CPU_MODEL.to_string()),
    );
    push("-smp", record.cores.to_string());
    push("-m", format!("{}M", record.memory_mib));

    // vhost-user-fs needs guest RAM shared with the daemon.
    let virtiofs = record
        .shared_folders
        .iter()
        .any(|s| s.transport == ShareTransport::Virtiofs);
    if virtiofs {
        push(
            "-object",
            format!("memory-backend-memfd,id=mem,size={}M,share=on", record.memory_mib),
        );
        push("-numa", "node,memdev=mem".to_string());
    }

    let disk_if = match record.os_type {
        OsType::Windows => "ide",
        _ => "virtio",
    };
    push(
        "-drive",
        format!(
            "file={},format=qcow2,if={}",
            opt(&disk.display().to_string()),
            disk_if
        ),
    );

    let mut device = format!("{},netdev=net0", nic_model(record));
    if let Some(mac) = &record.mac {
        device.push_str(&format!(",mac={}", mac));
    }
    match record.network {
        NetworkType::User => {
            let mut netdev = "user,id=net0".to_string();
            if record.port_forwarding {
                for rule in &record.port_forwards {
                    netdev.push_str(&format!(
                        ",hostfwd={}::{}-:{}",
                        rule.protocol, rule.host_port, rule.guest_port
                    ));
                }
            }
            if let Some(smb) = record
                .shared_folders
                .iter()
                .find(|s| s.transport == ShareTransport::Smb)
            {
                netdev.push_str(&format!(",smb={}", opt(&smb.host_path.display().to_string())));
            }
            push("-netdev", netdev);
            push("-device", device);
        }
        NetworkType::Nat => {
            push("-netdev", format!("bridge,id=net0,br={}", opt(ctx.nat_bridge)));
            push("-device", device);
        }
        NetworkType::None => push("-nic", "none".to_string()),
    }

    for share in &record.shared_folders {
        match share.transport {
            ShareTransport::Virtiofs => {
                let socket = ctx.layout.share_socket(&share.tag);
                push(
                    "-chardev",
                    format!(
                        "socket,id=fs-{},path={}",
                        share.tag,
                        opt(&socket.display().to_string())
                    ),
                );
                push(
                    "-device",
                    format!("vhost-user-fs-pci,chardev=fs-{},tag={}", share.tag, share.tag),
                );
            }
            ShareTransport::NineP => push(
                "-virtfs",
                format!(
                    "local,path={},mount_tag={},security_model=mapped-xattr,id=fs-{}",
                    opt(&share.host_path.display().to_string()),
                    share.tag,
                    share.tag
                ),
            ),
            // Carried on the user netdev above.
            ShareTransport::Smb => {}
        }
    }

    if ctx.usb_controller || !record.usb_devices.is_empty() {
        push("-device", "qemu-xhci,id=xhci".to_string());
    }

    push(
        "-monitor",
        format!("unix:{},server,nowait", opt(&ctx.layout.monitor().display().to_string())),
    );
    push(
        "-serial",
        format!("file:{}", ctx.layout.console_log().display()),
    );
    if ctx.headless {
        push("-display", "none".to_string());
    }

    Ok(args)
}

/// Generate a MAC address in the QEMU OUI (`52:54:00`) from `seed`.
pub fn generate_mac(seed: &str) -> String {
    let hash = Sha256::digest(seed.as_bytes());
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        hash[0], hash[1], hash[2]
    )
}
