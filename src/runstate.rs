//! Process handle of a running VM (`run.state`).
//!
//! Written after a successful launch and removed on stop. Uses the same
//! `KEY=value` format as the VM record.

use crate::error::{Error, Result};
use crate::kv::Document;
use crate::process;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A shared-folder daemon started for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonHandle {
    /// Mount tag the daemon serves.
    pub tag: String,
    /// Daemon pid.
    pub pid: i32,
    /// Daemon start time for pid-reuse detection.
    pub start_time: Option<u64>,
    /// vhost-user socket path.
    pub socket: PathBuf,
}

impl DaemonHandle {
    /// True if the recorded daemon is still the process we started.
    pub fn is_alive(&self) -> bool {
        process::is_our_process(self.pid, self.start_time)
    }
}

/// Running hypervisor plus its auxiliary daemons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    /// Hypervisor pid.
    pub pid: i32,
    /// Hypervisor start time for pid-reuse detection.
    pub start_time: Option<u64>,
    /// Launch time, RFC 3339 UTC.
    pub started_at: Option<String>,
    /// Monitor (control) socket.
    pub monitor: PathBuf,
    /// Shared-folder daemons.
    pub daemons: Vec<DaemonHandle>,
}

impl RunState {
    /// True if the recorded hypervisor is still the process we started.
    pub fn is_alive(&self) -> bool {
        process::is_our_process(self.pid, self.start_time)
    }

    /// Serialize into a document.
    pub fn to_document(&self) -> Result<Document> {
        let mut doc = Document::new();
        let mut set = |key: &str, value: String| {
            doc.set(key, value)
                .map_err(|e| Error::invalid("run state field", e))
        };
        set("PID", self.pid.to_string())?;
        if let Some(st) = self.start_time {
            set("START_TIME", st.to_string())?;
        }
        if let Some(ts) = &self.started_at {
            set("STARTED_AT", ts.clone())?;
        }
        set("MONITOR", self.monitor.display().to_string())?;
        for (i, d) in self.daemons.iter().enumerate() {
            let start = d.start_time.map(|s| s.to_string()).unwrap_or_default();
            set(
                &format!("DAEMON_{}", i),
                format!("{}|{}|{}|{}", d.tag, d.pid, start, d.socket.display()),
            )?;
        }
        Ok(doc)
    }

    /// Deserialize from a document read from `path`.
    pub fn from_document(mut doc: Document, path: &Path) -> Result<Self> {
        let corrupt = |reason: String| Error::corrupted(path, reason);
        let pid: i32 = doc
            .take("PID")
            .ok_or_else(|| corrupt("missing required field PID".into()))?
            .parse()
            .map_err(|_| corrupt("invalid value for PID".into()))?;
        if pid <= 0 {
            return Err(corrupt(format!("invalid pid {}", pid)));
        }
        let start_time = match doc.take("START_TIME") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| corrupt("invalid value for START_TIME".into()))?,
            ),
            None => None,
        };
        let monitor = doc
            .take("MONITOR")
            .map(PathBuf::from)
            .ok_or_else(|| corrupt("missing required field MONITOR".into()))?;
        let started_at = doc.take("STARTED_AT");

        let mut daemons = Vec::new();
        for i in 0.. {
            let key = format!("DAEMON_{}", i);
            let Some(raw) = doc.take(&key) else { break };
            daemons.push(parse_daemon(&raw).ok_or_else(|| corrupt(format!("invalid value for {}", key)))?);
        }
        for key in doc.keys() {
            tracing::warn!(path = %path.display(), key, "ignoring unknown key in run state");
        }
        Ok(RunState {
            pid,
            start_time,
            started_at,
            monitor,
            daemons,
        })
    }
}

fn parse_daemon(raw: &str) -> Option<DaemonHandle> {
    let mut parts = raw.splitn(4, '|');
    let tag = parts.next()?.to_string();
    let pid: i32 = parts.next()?.parse().ok()?;
    let start_time = match parts.next()? {
        "" => None,
        s => Some(s.parse().ok()?),
    };
    let socket = PathBuf::from(parts.next()?);
    if tag.is_empty() || pid <= 0 {
        return None;
    }
    Some(DaemonHandle {
        tag,
        pid,
        start_time,
        socket,
    })
}
