//! Host USB enumeration and hot-plug command construction.

use crate::error::Result;
use crate::record::UsbDevice;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// A USB device present on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostUsbDevice {
    /// Vendor/product/serial identity.
    #[serde(flatten)]
    pub device: UsbDevice,
    /// Bus number.
    pub bus: u32,
    /// Device address on the bus.
    pub address: u32,
    /// Manufacturer string, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Product string, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

/// Source of host USB devices.
pub trait UsbHost: std::fmt::Debug {
    /// Every device currently attached to the host.
    fn devices(&self) -> Result<Vec<HostUsbDevice>>;

    /// First host device matching `wanted` (a missing serial matches any).
    fn find(&self, wanted: &UsbDevice) -> Result<Option<HostUsbDevice>> {
        Ok(self
            .devices()?
            .into_iter()
            .find(|d| wanted.matches(&d.device)))
    }
}

/// Enumerates devices from the sysfs USB tree.
#[derive(Debug, Clone)]
pub struct SysfsUsb {
    root: PathBuf,
}

impl SysfsUsb {
    /// Enumerate below `root` (normally `/sys/bus/usb/devices`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl UsbHost for SysfsUsb {
    fn devices(&self) -> Result<Vec<HostUsbDevice>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(root = %self.root.display(), "no usb sysfs tree");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Interfaces (1-1:1.0) and root hubs (usb1) are not passthrough candidates.
            if name.contains(':') || name.starts_with("usb") {
                continue;
            }
            let dir = entry.path();
            let hex = |attr: &str| read_attr(&dir, attr).and_then(|v| u16::from_str_radix(&v, 16).ok());
            let num = |attr: &str| read_attr(&dir, attr).and_then(|v| v.parse::<u32>().ok());
            let (Some(vendor_id), Some(product_id), Some(bus), Some(address)) =
                (hex("idVendor"), hex("idProduct"), num("busnum"), num("devnum"))
            else {
                continue;
            };
            devices.push(HostUsbDevice {
                device: UsbDevice {
                    vendor_id,
                    product_id,
                    serial: read_attr(&dir, "serial"),
                },
                bus,
                address,
                manufacturer: read_attr(&dir, "manufacturer"),
                product: read_attr(&dir, "product"),
            });
        }
        devices.sort_by_key(|d| (d.bus, d.address));
        Ok(devices)
    }
}

/// `device_add` command for `wanted`, pinned to `host` when a serial is given.
pub fn device_add_command(wanted: &UsbDevice, host: &HostUsbDevice) -> String {
    let selector = if wanted.serial.is_some() {
        format!("hostbus={},hostaddr={}", host.bus, host.address)
    } else {
        format!(
            "vendorid=0x{:04x},productid=0x{:04x}",
            wanted.vendor_id, wanted.product_id
        )
    };
    format!(
        "device_add usb-host,bus=xhci.0,{},id={}",
        selector,
        wanted.qdev_id()
    )
}

/// `device_del` command for `wanted`.
pub fn device_del_command(wanted: &UsbDevice) -> String {
    format!("device_del {}", wanted.qdev_id())
}
