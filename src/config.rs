//! Host-wide localvm settings.
//!
//! Settings are read from a TOML file at `$LOCALVM_CONFIG` or
//! `<config_dir>/localvm/config.toml`. A missing file yields defaults; a
//! present but unparseable file is an error rather than a silent fallback.
//!
//! ```toml
//! vm_dir = "/srv/vms"
//! stop_timeout = "45s"
//! hypervisor = ["qemu-system-x86_64"]
//!
//! [defaults]
//! cores = 4
//! memory = 4096
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the settings file location.
pub const CONFIG_ENV: &str = "LOCALVM_CONFIG";

/// Maximum number of VMs allowed in one VM directory by default.
pub const DEFAULT_MAX_VMS: usize = 64;
/// Default vCPU count for new VMs.
pub const DEFAULT_CORES: u32 = 2;
/// Default memory in MiB for new VMs.
pub const DEFAULT_MEMORY_MIB: u64 = 2048;
/// Default disk size in MiB for new VMs.
pub const DEFAULT_DISK_MIB: u64 = 20 * 1024;
/// Default QEMU machine type.
pub const DEFAULT_MACHINE: &str = "q35";
/// Default QEMU CPU model.
pub const DEFAULT_CPU: &str = "host";

/// Defaults applied to `create` when the caller leaves a field unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmDefaults {
    /// vCPU count.
    pub cores: u32,
    /// Memory in MiB.
    pub memory: u64,
    /// Disk size in MiB.
    pub disk: u64,
    /// Machine type.
    pub machine: String,
    /// CPU model.
    pub cpu: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            cores: DEFAULT_CORES,
            memory: DEFAULT_MEMORY_MIB,
            disk: DEFAULT_DISK_MIB,
            machine: DEFAULT_MACHINE.to_string(),
            cpu: DEFAULT_CPU.to_string(),
        }
    }
}

/// Host-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory holding one subdirectory per VM.
    pub vm_dir: PathBuf,
    /// Cap on the number of VMs.
    pub max_vms: usize,
    /// How long a command waits for a busy lock.
    #[serde(with = "duration_str")]
    pub lock_timeout: Duration,
    /// Age after which a lock held by a live process is reclaimed anyway.
    #[serde(with = "duration_str")]
    pub stale_lock_after: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop.
    #[serde(with = "duration_str")]
    pub stop_timeout: Duration,
    /// Window after launch during which an exit is a launch failure.
    #[serde(with = "duration_str")]
    pub launch_check: Duration,
    /// How long to wait for a shared-folder daemon socket.
    #[serde(with = "duration_str")]
    pub share_socket_timeout: Duration,
    /// Read/write timeout on the monitor socket.
    #[serde(with = "duration_str")]
    pub monitor_timeout: Duration,
    /// Lifetime of the in-process VM registry cache.
    #[serde(with = "duration_str")]
    pub registry_cache_ttl: Duration,
    /// Hypervisor command vector (program plus fixed leading arguments).
    pub hypervisor: Vec<String>,
    /// Disk image tool command vector.
    pub disk_tool: Vec<String>,
    /// Shared-folder daemon command vector.
    pub share_daemon: Vec<String>,
    /// Root of the USB device tree in sysfs.
    pub usb_sysfs: PathBuf,
    /// Bridge used by `nat` networking.
    pub nat_bridge: String,
    /// Optional cap on shared folders per VM.
    pub max_shared_folders: Option<usize>,
    /// Probe the host before accepting a port forward.
    pub check_host_ports: bool,
    /// Always attach a USB controller, even without persisted devices.
    pub usb_controller: bool,
    /// Defaults for `create`.
    pub defaults: VmDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        let vm_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("localvm")
            .join("vms");
        Self {
            vm_dir,
            max_vms: DEFAULT_MAX_VMS,
            lock_timeout: Duration::from_secs(30),
            stale_lock_after: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(30),
            launch_check: Duration::from_secs(2),
            share_socket_timeout: Duration::from_secs(5),
            monitor_timeout: Duration::from_secs(5),
            registry_cache_ttl: Duration::from_secs(2),
            hypervisor: vec!["qemu-system-x86_64".to_string()],
            disk_tool: vec!["qemu-img".to_string()],
            share_daemon: vec!["virtiofsd".to_string()],
            usb_sysfs: PathBuf::from("/sys/bus/usb/devices"),
            nat_bridge: "virbr0".to_string(),
            max_shared_folders: None,
            check_host_ports: true,
            usb_controller: false,
            defaults: VmDefaults::default(),
        }
    }
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(p) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(p));
        }
        dirs::config_dir().map(|d| d.join("localvm").join("config.toml"))
    }

    /// Load settings from the default location.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load settings from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::config("read", format!("{}: {}", path.display(), e))),
        };
        let settings = Self::parse(&contents)
            .map_err(|e| Error::config("parse", format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), vm_dir = %settings.vm_dir.display(), "loaded settings");
        Ok(settings)
    }

    /// Parse and validate settings from TOML text.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let settings: Settings = toml::from_str(contents).map_err(|e| e.to_string())?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        for (field, argv) in [
            ("hypervisor", &self.hypervisor),
            ("disk_tool", &self.disk_tool),
            ("share_daemon", &self.share_daemon),
        ] {
            if argv.is_empty() || argv[0].is_empty() {
                return Err(format!("{} must name a program", field));
            }
        }
        if self.max_vms == 0 {
            return Err("max_vms must be at least 1".into());
        }
        if self.max_shared_folders == Some(0) {
            return Err("max_shared_folders must be at least 1 when set".into());
        }
        Ok(())
    }
}

/// Serde adapter for humantime duration strings (`"30s"`, `"10m"`).
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
