//! Host-wide port-forward uniqueness.
//!
//! A `(host_port, protocol)` pair may appear in at most one forwarding rule
//! across every VM. Checks run against a freshly scanned registry while the
//! caller holds the global lock, so two concurrent `port add` invocations
//! cannot both pass.

use crate::error::{Error, Result};
use crate::record::{NetworkType, PortForward, Protocol, VmRecord};
use serde::Serialize;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};

/// A forwarding rule together with the VM that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnedForward {
    /// Owning VM.
    pub vm: String,
    /// The rule.
    #[serde(flatten)]
    pub rule: PortForward,
}

/// Result of planning an addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPlan {
    /// The rule is new and should be appended.
    Append,
    /// The exact rule already exists on the VM.
    AlreadyPresent,
}

/// Every rule of every VM in `records`, in record order.
pub fn all_forwards(records: &[VmRecord]) -> Vec<OwnedForward> {
    records
        .iter()
        .flat_map(|r| {
            r.port_forwards.iter().map(move |rule| OwnedForward {
                vm: r.name.clone(),
                rule: *rule,
            })
        })
        .collect()
}

/// Decide whether `rule` can be added to `record`.
///
/// `taken` holds every rule in use host-wide; those owned by `record`
/// itself are skipped.
pub fn plan_add(record: &VmRecord, rule: &PortForward, taken: &[OwnedForward]) -> Result<AddPlan> {
    if rule.host_port == 0 || rule.guest_port == 0 {
        return Err(Error::invalid("port", "must be between 1 and 65535"));
    }
    if record.network != NetworkType::User {
        return Err(Error::invalid(
            "port forward",
            format!(
                "vm '{}' uses {} networking; port forwarding requires user networking",
                record.name, record.network
            ),
        ));
    }

    if let Some(existing) = record.forward_for(rule.host_port, rule.protocol) {
        if existing == rule {
            return Ok(AddPlan::AlreadyPresent);
        }
        return Err(conflict(rule, &record.name));
    }
    if let Some(owner) = taken.iter().find(|f| {
        f.vm != record.name && f.rule.host_port == rule.host_port && f.rule.protocol == rule.protocol
    }) {
        return Err(conflict(rule, &owner.vm));
    }
    Ok(AddPlan::Append)
}

/// Remove the rule for `(host_port, protocol)` from `record`.
///
/// Clears `port_forwarding` once the last rule is gone.
pub fn remove(record: &mut VmRecord, host_port: u16, protocol: Protocol) -> Result<PortForward> {
    let pos = record
        .port_forwards
        .iter()
        .position(|r| r.host_port == host_port && r.protocol == protocol)
        .ok_or_else(|| {
            Error::item_not_found(
                "port forward",
                &record.name,
                format!("{}/{}", host_port, protocol),
            )
        })?;
    let rule = record.port_forwards.remove(pos);
    if record.port_forwards.is_empty() {
        record.port_forwarding = false;
    }
    Ok(rule)
}

/// Check that no host service is bound to `port`.
///
/// Ports this user may not bind (privileged ports) are not reported as busy.
pub fn probe_host(port: u16, protocol: Protocol) -> Result<()> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let result = match protocol {
        Protocol::Tcp => TcpListener::bind(addr).map(drop),
        Protocol::Udp => UdpSocket::bind(addr).map(drop),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(Error::PortInUse {
            host_port: port,
            protocol: protocol.to_string(),
        }),
        Err(e) => {
            tracing::debug!(port, %protocol, error = %e, "host port probe inconclusive");
            Ok(())
        }
    }
}

fn conflict(rule: &PortForward, owner: &str) -> Error {
    Error::PortConflict {
        host_port: rule.host_port,
        protocol: rule.protocol.to_string(),
        owner: owner.to_string(),
    }
}
