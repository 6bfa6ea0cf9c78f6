//! Persisted VM record.
//!
//! A record is the typed view of a VM's `vm.conf` document. Conversion in
//! both directions goes through [`crate::kv::Document`]; the record never
//! touches the filesystem itself (see [`crate::store`]).

use crate::error::{Error, Result};
use crate::kv::Document;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Maximum length for VM names.
pub const MAX_NAME_LENGTH: usize = 40;
/// Maximum vCPU count.
pub const MAX_CORES: u32 = 64;
/// Maximum memory in MiB (1 TiB).
pub const MAX_MEMORY_MIB: u64 = 1024 * 1024;
/// Smallest memory in MiB accepted by `create`.
pub const MIN_MEMORY_MIB: u64 = 128;
/// Smallest disk in MiB accepted by `create`.
pub const MIN_DISK_MIB: u64 = 1024;
/// Largest disk in MiB (64 TiB).
pub const MAX_DISK_MIB: u64 = 64 * 1024 * 1024;

/// Validate a VM name.
///
/// 1-40 characters of `[A-Za-z0-9_-]`, starting with a letter or digit,
/// with no trailing or consecutive hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name(name, "name cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::invalid_name(
            name,
            format!(
                "name too long: {} characters (max {})",
                name.len(),
                MAX_NAME_LENGTH
            ),
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(Error::invalid_name(
            name,
            "name must start with a letter or digit",
        ));
    }
    if name.ends_with('-') {
        return Err(Error::invalid_name(name, "name cannot end with a hyphen"));
    }
    let mut prev_was_hyphen = false;
    for c in name.chars() {
        if c == '-' {
            if prev_was_hyphen {
                return Err(Error::invalid_name(
                    name,
                    "name cannot contain consecutive hyphens",
                ));
            }
            prev_was_hyphen = true;
        } else {
            prev_was_hyphen = false;
        }
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(Error::invalid_name(
                name,
                format!("name contains invalid character: '{}'", c),
            ));
        }
    }
    Ok(())
}

/// Validate a vCPU count.
pub fn validate_cores(cores: u32) -> Result<()> {
    if !(1..=MAX_CORES).contains(&cores) {
        return Err(Error::invalid(
            "cores",
            format!("{} is out of range (1-{})", cores, MAX_CORES),
        ));
    }
    Ok(())
}

/// Validate a memory size in MiB.
pub fn validate_memory(mib: u64) -> Result<()> {
    if !(MIN_MEMORY_MIB..=MAX_MEMORY_MIB).contains(&mib) {
        return Err(Error::invalid(
            "memory",
            format!(
                "{} MiB is out of range ({}-{} MiB)",
                mib, MIN_MEMORY_MIB, MAX_MEMORY_MIB
            ),
        ));
    }
    Ok(())
}

/// Validate a disk size in MiB.
pub fn validate_disk(mib: u64) -> Result<()> {
    if !(MIN_DISK_MIB..=MAX_DISK_MIB).contains(&mib) {
        return Err(Error::invalid(
            "disk size",
            format!(
                "{} MiB is out of range ({}-{} MiB)",
                mib, MIN_DISK_MIB, MAX_DISK_MIB
            ),
        ));
    }
    Ok(())
}

/// Values accepted by `-machine`/`-cpu`/NIC model fields.
///
/// `,` and `=` separate QEMU options, so only fields that take options
/// (CPU feature flags) may contain them.
fn validate_model(what: &str, value: &str, options: bool) -> Result<()> {
    let extra = if options { "._-+=," } else { "._-+" };
    let ok = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || extra.contains(c));
    if !ok {
        return Err(Error::invalid(what, format!("'{}' is not a valid value", value)));
    }
    Ok(())
}

/// Validate a machine type.
pub fn validate_machine(value: &str) -> Result<()> {
    validate_model("machine type", value, false)
}

/// Validate a CPU model, optionally followed by `,feature` flags.
pub fn validate_cpu_model(value: &str) -> Result<()> {
    validate_model("cpu model", value, true)
}

/// Validate a NIC model.
pub fn validate_nic_model(value: &str) -> Result<()> {
    validate_model("nic model", value, false)
}

// ============================================================================
// Enumerations
// ============================================================================

macro_rules! keyword_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Keyword used on disk and on the command line.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(Error::invalid(
                        $what,
                        format!("'{}' (expected one of: {})", s, [$($text),+].join(", ")),
                    )),
                }
            }
        }
    };
}

keyword_enum!(
    /// Guest network attachment.
    NetworkType, "network type" {
        User => "user",
        Nat => "nat",
        None => "none",
    }
);

keyword_enum!(
    /// Guest operating system family. Affects defaults only.
    OsType, "os type" {
        Linux => "linux",
        Windows => "windows",
        Other => "other",
    }
);

keyword_enum!(
    /// Transport protocol of a port forward.
    Protocol, "protocol" {
        Tcp => "tcp",
        Udp => "udp",
    }
);

keyword_enum!(
    /// Shared-folder transport.
    ShareTransport, "share transport" {
        Virtiofs => "virtiofs",
        NineP => "9p",
        Smb => "smb",
    }
);

// ============================================================================
// List entries
// ============================================================================

/// One host-to-guest port forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortForward {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the guest.
    pub guest_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host_port, self.guest_port, self.protocol)
    }
}

impl FromStr for PortForward {
    type Err = Error;

    /// Parse `HOST:GUEST[/PROTO]`; the protocol defaults to tcp.
    fn from_str(s: &str) -> Result<Self> {
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let (host, guest) = ports
            .split_once(':')
            .ok_or_else(|| Error::invalid("port forward", format!("'{}' (expected HOST:GUEST[/tcp|udp])", s)))?;
        Ok(PortForward {
            host_port: parse_port(host)?,
            guest_port: parse_port(guest)?,
            protocol,
        })
    }
}

/// Parse a port number in 1-65535.
pub fn parse_port(s: &str) -> Result<u16> {
    match s.trim().parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::invalid(
            "port",
            format!("'{}' is not in range 1-65535", s),
        )),
    }
}

/// One folder shared from host to guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedFolder {
    /// Canonical host directory.
    pub host_path: PathBuf,
    /// Guest-visible mount tag.
    pub tag: String,
    /// Transport.
    pub transport: ShareTransport,
}

impl SharedFolder {
    fn encode(&self) -> String {
        format!(
            "{}|{}|{}",
            self.host_path.display(),
            self.tag,
            self.transport
        )
    }

    fn decode(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, '|');
        let (Some(transport), Some(tag), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid(
                "shared folder",
                format!("'{}' (expected PATH|TAG|TRANSPORT)", s),
            ));
        };
        validate_tag(tag)?;
        if path.is_empty() {
            return Err(Error::invalid("shared folder", "empty host path"));
        }
        Ok(SharedFolder {
            host_path: PathBuf::from(path),
            tag: tag.to_string(),
            transport: transport.parse()?,
        })
    }
}

/// Maximum mount tag length (virtio-fs tag limit is 36 bytes; 9p is 31).
pub const MAX_TAG_LENGTH: usize = 31;

/// Validate a mount tag.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
        return Err(Error::invalid(
            "mount tag",
            format!("'{}' must be 1-{} characters", tag, MAX_TAG_LENGTH),
        ));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::invalid(
            "mount tag",
            format!("'{}' may only contain letters, digits, '-' and '_'", tag),
        ));
    }
    Ok(())
}

/// A USB device identified by vendor/product and optional serial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UsbDevice {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Serial number, when several identical devices are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl UsbDevice {
    /// True if `other` names the same device, treating a missing serial as a wildcard.
    pub fn matches(&self, other: &UsbDevice) -> bool {
        self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && match (&self.serial, &other.serial) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// Monitor device id (`usb-046d-c52b`, plus the serial when pinned).
    pub fn qdev_id(&self) -> String {
        let mut id = format!("usb-{:04x}-{:04x}", self.vendor_id, self.product_id);
        if let Some(serial) = &self.serial {
            id.push('-');
            id.extend(serial.chars().filter(|c| c.is_ascii_alphanumeric()));
        }
        id
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial {
            write!(f, ":{}", serial)?;
        }
        Ok(())
    }
}

impl FromStr for UsbDevice {
    type Err = Error;

    /// Parse `VVVV:PPPP[:SERIAL]` (hex ids).
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::invalid("usb device", format!("'{}' (expected VVVV:PPPP[:SERIAL])", s));
        let mut parts = s.splitn(3, ':');
        let vendor = parts.next().ok_or_else(bad)?;
        let product = parts.next().ok_or_else(bad)?;
        let serial = parts.next();
        let hex = |v: &str| {
            if v.len() != 4 {
                return Err(bad());
            }
            u16::from_str_radix(v, 16).map_err(|_| bad())
        };
        if let Some(serial) = serial {
            if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
                return Err(bad());
            }
        }
        Ok(UsbDevice {
            vendor_id: hex(vendor)?,
            product_id: hex(product)?,
            serial: serial.map(str::to_string),
        })
    }
}

// ============================================================================
// Record
// ============================================================================

/// Persisted configuration of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmRecord {
    /// VM name.
    pub name: String,
    /// Stable numeric id; `None` only for records written by hand.
    pub id: Option<u32>,
    /// Creation time, RFC 3339 UTC.
    pub created_at: Option<String>,
    /// vCPU count.
    pub cores: u32,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Disk size in MiB as last created or resized.
    pub disk_mib: Option<u64>,
    /// QEMU machine type.
    pub machine: String,
    /// QEMU CPU model; `None` uses the host default.
    pub cpu_model: Option<String>,
    /// Network attachment.
    pub network: NetworkType,
    /// NIC model; `None` picks one by OS type.
    pub nic_model: Option<String>,
    /// Guest MAC address.
    pub mac: Option<String>,
    /// Whether port forwarding is enabled.
    pub port_forwarding: bool,
    /// Port forwarding rules, in insertion order.
    pub port_forwards: Vec<PortForward>,
    /// Shared folders, in insertion order.
    pub shared_folders: Vec<SharedFolder>,
    /// Persisted USB passthrough devices.
    pub usb_devices: Vec<UsbDevice>,
    /// Locked against modification and deletion.
    pub locked: bool,
    /// Guest OS family.
    pub os_type: OsType,
}

impl VmRecord {
    /// A new, unlocked record with no forwards, shares or devices.
    pub fn new(name: impl Into<String>, cores: u32, memory_mib: u64, machine: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            created_at: None,
            cores,
            memory_mib,
            disk_mib: None,
            machine: machine.into(),
            cpu_model: None,
            network: NetworkType::User,
            nic_model: None,
            mac: None,
            port_forwarding: false,
            port_forwards: Vec::new(),
            shared_folders: Vec::new(),
            usb_devices: Vec::new(),
            locked: false,
            os_type: OsType::Linux,
        }
    }

    /// Find the rule forwarding `(host_port, protocol)`.
    pub fn forward_for(&self, host_port: u16, protocol: Protocol) -> Option<&PortForward> {
        self.port_forwards
            .iter()
            .find(|r| r.host_port == host_port && r.protocol == protocol)
    }

    /// Serialize into a document.
    pub fn to_document(&self) -> Result<Document> {
        let mut doc = Document::new();
        let mut set = |key: &str, value: String| {
            doc.set(key, value)
                .map_err(|e| Error::invalid("record field", e))
        };
        set("NAME", self.name.clone())?;
        if let Some(id) = self.id {
            set("ID", id.to_string())?;
        }
        if let Some(ts) = &self.created_at {
            set("CREATED_AT", ts.clone())?;
        }
        set("CORES", self.cores.to_string())?;
        set("MEMORY", self.memory_mib.to_string())?;
        if let Some(disk) = self.disk_mib {
            set("DISK_SIZE", disk.to_string())?;
        }
        set("MACHINE", self.machine.clone())?;
        if let Some(cpu) = &self.cpu_model {
            set("CPU_MODEL", cpu.clone())?;
        }
        set("NETWORK", self.network.to_string())?;
        if let Some(nic) = &self.nic_model {
            set("NIC_MODEL", nic.clone())?;
        }
        if let Some(mac) = &self.mac {
            set("MAC", mac.clone())?;
        }
        set("PORT_FORWARDING", yes_no(self.port_forwarding))?;
        for (i, rule) in self.port_forwards.iter().enumerate() {
            set(&format!("PORT_FORWARD_{}", i), rule.to_string())?;
        }
        for (i, share) in self.shared_folders.iter().enumerate() {
            set(&format!("SHARED_FOLDER_{}", i), share.encode())?;
        }
        for (i, dev) in self.usb_devices.iter().enumerate() {
            set(&format!("USB_DEVICE_{}", i), dev.to_string())?;
        }
        set("LOCKED", yes_no(self.locked))?;
        set("OS_TYPE", self.os_type.to_string())?;
        Ok(doc)
    }

    /// Deserialize from a document read from `path`.
    ///
    /// Missing required fields or malformed values are [`Error::Corrupted`];
    /// unknown keys are logged and ignored.
    pub fn from_document(mut doc: Document, path: &Path) -> Result<Self> {
        let corrupt = |reason: String| Error::corrupted(path, reason);
        let required = |doc: &mut Document, key: &str| {
            doc.take(key)
                .ok_or_else(|| corrupt(format!("missing required field {}", key)))
        };
        fn field<T: FromStr>(path: &Path, key: &str, raw: &str) -> Result<T> {
            raw.parse()
                .map_err(|_| Error::corrupted(path, format!("invalid value for {}: '{}'", key, raw)))
        }

        let name = required(&mut doc, "NAME")?;
        validate_name(&name).map_err(|e| corrupt(e.to_string()))?;
        let cores: u32 = field(path, "CORES", &required(&mut doc, "CORES")?)?;
        validate_cores(cores).map_err(|e| corrupt(e.to_string()))?;
        let memory_mib: u64 = field(path, "MEMORY", &required(&mut doc, "MEMORY")?)?;
        if memory_mib == 0 {
            return Err(corrupt("MEMORY must be positive".into()));
        }
        let machine = required(&mut doc, "MACHINE")?;
        validate_machine(&machine).map_err(|e| corrupt(e.to_string()))?;

        let mut record = VmRecord::new(name, cores, memory_mib, machine);
        if let Some(raw) = doc.take("ID") {
            record.id = Some(field(path, "ID", &raw)?);
        }
        record.created_at = doc.take("CREATED_AT");
        if let Some(raw) = doc.take("DISK_SIZE") {
            record.disk_mib = Some(field(path, "DISK_SIZE", &raw)?);
        }
        record.cpu_model = doc.take("CPU_MODEL");
        if let Some(cpu) = &record.cpu_model {
            validate_cpu_model(cpu).map_err(|e| corrupt(e.to_string()))?;
        }
        if let Some(raw) = doc.take("NETWORK") {
            record.network = raw.parse().map_err(|e: Error| corrupt(e.to_string()))?;
        }
        record.nic_model = doc.take("NIC_MODEL");
        if let Some(nic) = &record.nic_model {
            validate_nic_model(nic).map_err(|e| corrupt(e.to_string()))?;
        }
        record.mac = doc.take("MAC");
        if let Some(raw) = doc.take("PORT_FORWARDING") {
            record.port_forwarding = parse_bool(&raw).ok_or_else(|| corrupt(format!("invalid value for PORT_FORWARDING: '{}'", raw)))?;
        }
        if let Some(raw) = doc.take("LOCKED") {
            record.locked = parse_bool(&raw).ok_or_else(|| corrupt(format!("invalid value for LOCKED: '{}'", raw)))?;
        }
        if let Some(raw) = doc.take("OS_TYPE") {
            record.os_type = raw.parse().map_err(|e: Error| corrupt(e.to_string()))?;
        }

        record.port_forwards = take_list(&mut doc, "PORT_FORWARD", path, |s| s.parse())?;
        record.shared_folders = take_list(&mut doc, "SHARED_FOLDER", path, SharedFolder::decode)?;
        record.usb_devices = take_list(&mut doc, "USB_DEVICE", path, |s| s.parse())?;

        for key in doc.keys() {
            tracing::warn!(path = %path.display(), key, "ignoring unknown key in vm record");
        }
        Ok(record)
    }
}

fn take_list<T>(
    doc: &mut Document,
    prefix: &str,
    path: &Path,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for i in 0.. {
        let key = format!("{}_{}", prefix, i);
        let Some(raw) = doc.take(&key) else { break };
        let item = parse(&raw).map_err(|e| Error::corrupted(path, format!("{}: {}", key, e)))?;
        out.push(item);
    }
    Ok(out)
}

fn yes_no(v: bool) -> String {
    if v { "yes" } else { "no" }.to_string()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VmRecord {
        let mut r = VmRecord::new("web", 4, 4096, "q35");
        r.id = Some(3);
        r.created_at = Some("2026-01-02T03:04:05Z".into());
        r.disk_mib = Some(20480);
        r.mac = Some("52:54:00:12:34:56".into());
        r.port_forwarding = true;
        r.port_forwards.push("8080:80/tcp".parse().unwrap());
        r.port_forwards.push("5353:53/udp".parse().unwrap());
        r.shared_folders.push(SharedFolder {
            host_path: PathBuf::from("/srv/my data"),
            tag: "data".into(),
            transport: ShareTransport::Virtiofs,
        });
        r.usb_devices.push("046d:c52b".parse().unwrap());
        r
    }

    #[test]
    fn test_document_round_trip() {
        let record = sample();
        let doc = record.to_document().unwrap();
        let text = doc.render();
        assert!(text.contains("PORT_FORWARD_1=5353:53/udp\n"));
        assert!(text.contains("SHARED_FOLDER_0=\"/srv/my data|data|virtiofs\"\n"));
        let back =
            VmRecord::from_document(Document::parse(&text).unwrap(), Path::new("vm.conf")).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_missing_required_field_is_corrupted() {
        for missing in ["NAME", "CORES", "MEMORY", "MACHINE"] {
            let mut doc = sample().to_document().unwrap();
            doc.take(missing);
            let err = VmRecord::from_document(doc, Path::new("vm.conf")).unwrap_err();
            assert!(matches!(err, Error::Corrupted { .. }), "{}", missing);
            assert!(err.to_string().contains(missing));
        }
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let doc = Document::parse("NAME=a\nCORES=1\nMEMORY=512\nMACHINE=pc\nFUTURE_FIELD=1\n").unwrap();
        let record = VmRecord::from_document(doc, Path::new("vm.conf")).unwrap();
        assert_eq!(record.name, "a");
        assert_eq!(record.network, NetworkType::User);
        assert!(!record.locked);
    }

    #[test]
    fn test_bad_values_are_corrupted() {
        let doc = Document::parse("NAME=a\nCORES=lots\nMEMORY=512\nMACHINE=pc\n").unwrap();
        assert!(VmRecord::from_document(doc, Path::new("vm.conf")).is_err());
        let doc = Document::parse("NAME=a\nCORES=1\nMEMORY=512\nMACHINE=pc\nPORT_FORWARD_0=x\n").unwrap();
        assert!(VmRecord::from_document(doc, Path::new("vm.conf")).is_err());
        // Option separators would reach the hypervisor command line.
        let doc = Document::parse("NAME=a\nCORES=1\nMEMORY=512\nMACHINE=\"q35,accel=tcg\"\n").unwrap();
        assert!(VmRecord::from_document(doc, Path::new("vm.conf")).is_err());
        let doc = Document::parse("NAME=a\nCORES=1\nMEMORY=512\nMACHINE=pc\nNIC_MODEL=\"e1000,romfile=x\"\n").unwrap();
        assert!(VmRecord::from_document(doc, Path::new("vm.conf")).is_err());
    }

    // ========================================================================
    // Name validation
    // ========================================================================

    #[test]
    fn test_validate_name() {
        let longest = "x".repeat(40);
        let too_long = "x".repeat(41);
        for ok in ["a", "web-1", "db_primary", "9lives", longest.as_str()] {
            assert!(validate_name(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "-web", "web-", "a--b", "a/b", "../etc", "a b", "é", too_long.as_str()] {
            assert!(validate_name(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_port_forward_parse() {
        let rule: PortForward = "8080:80".parse().unwrap();
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.to_string(), "8080:80/tcp");
        assert!("0:80".parse::<PortForward>().is_err());
        assert!("65536:80".parse::<PortForward>().is_err());
        assert!("8080:80/sctp".parse::<PortForward>().is_err());
    }

    #[test]
    fn test_usb_device_parse_and_match() {
        let any: UsbDevice = "046D:C52B".parse().unwrap();
        let specific: UsbDevice = "046d:c52b:ABC123".parse().unwrap();
        assert_eq!(any.to_string(), "046d:c52b");
        assert_eq!(specific.serial.as_deref(), Some("ABC123"));
        assert!(any.matches(&specific));
        assert!(!specific.matches(&"046d:c52b:OTHER".parse().unwrap()));
        assert!("46d:c52b".parse::<UsbDevice>().is_err());
        assert!("zzzz:c52b".parse::<UsbDevice>().is_err());
        assert_eq!(any.qdev_id(), "usb-046d-c52b");
        assert_eq!(specific.qdev_id(), "usb-046d-c52b-ABC123");
    }

    #[test]
    fn test_model_values() {
        assert!(validate_machine("pc-q35-8.2").is_ok());
        assert!(validate_machine("q35,accel=tcg").is_err());
        assert!(validate_machine("pc=1").is_err());
        assert!(validate_nic_model("virtio-net-pci,romfile=x").is_err());
        assert!(validate_cpu_model("host,+vmx,kvm=off").is_ok());
        assert!(validate_cpu_model("host x").is_err());
    }

    #[test]
    fn test_tag_validation() {
        assert!(validate_tag("data_1").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("a|b").is_err());
        assert!(validate_tag(&"t".repeat(32)).is_err());
    }
}
