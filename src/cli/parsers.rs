//! Shared CLI argument parsers.
//!
//! Each parser returns `Result<T, String>` so clap reports the message next
//! to the offending argument.

use localvm::record::{parse_port, PortForward, Protocol, UsbDevice};
use std::time::Duration;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a memory size (`4096`, `4G`, `512MiB`) into MiB.
pub fn parse_memory(s: &str) -> Result<u64, String> {
    localvm::size::parse_mib("memory size", s).map_err(|e| e.to_string())
}

/// Parse a disk size (`20G`, `1T`, `8192`) into MiB.
pub fn parse_disk(s: &str) -> Result<u64, String> {
    localvm::size::parse_mib("disk size", s).map_err(|e| e.to_string())
}

/// Parse a port forward (`HOST:GUEST[/tcp|udp]`).
pub fn parse_port_forward(s: &str) -> Result<PortForward, String> {
    s.parse().map_err(|e: localvm::Error| e.to_string())
}

/// Parse the key of an existing forward (`HOST[/tcp|udp]`).
pub fn parse_host_port(s: &str) -> Result<(u16, Protocol), String> {
    let (port, protocol) = match s.split_once('/') {
        Some((port, proto)) => (port, proto.parse().map_err(|e: localvm::Error| e.to_string())?),
        None => (s, Protocol::Tcp),
    };
    let port = parse_port(port).map_err(|e| e.to_string())?;
    Ok((port, protocol))
}

/// Parse a USB device (`VVVV:PPPP[:SERIAL]`).
pub fn parse_usb_device(s: &str) -> Result<UsbDevice, String> {
    s.parse().map_err(|e: localvm::Error| e.to_string())
}

/// Parse any keyword enum (network type, OS type, transport).
pub fn parse_keyword<T>(s: &str) -> Result<T, String>
where
    T: std::str::FromStr<Err = localvm::Error>,
{
    s.parse().map_err(|e: localvm::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localvm::record::NetworkType;

    #[test]
    fn test_parse_sizes() {
        assert_eq!(parse_memory("4G").unwrap(), 4096);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert_eq!(parse_disk("1T").unwrap(), 1024 * 1024);
        assert!(parse_disk("lots").is_err());
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("8080").unwrap(), (8080, Protocol::Tcp));
        assert_eq!(parse_host_port("53/udp").unwrap(), (53, Protocol::Udp));
        assert!(parse_host_port("0").is_err());
        assert!(parse_host_port("53/sctp").is_err());
    }

    #[test]
    fn test_parse_keyword_and_devices() {
        assert_eq!(parse_keyword::<NetworkType>("NAT").unwrap(), NetworkType::Nat);
        assert!(parse_keyword::<NetworkType>("bridge").is_err());
        assert!(parse_usb_device("046d:c52b").is_ok());
        assert!(parse_port_forward("8080:80/tcp").is_ok());
        assert!(parse_duration("90s").is_ok());
    }
}
