//! Minimal QEMU human monitor (HMP) client.
//!
//! The hypervisor is started with `-monitor unix:<sock>,server,nowait`.
//! Commands are single text lines; a response is everything up to the next
//! `(qemu) ` prompt. Responses are only inspected for an error indication.

use crate::error::{Error, Result};
use crate::process;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

/// Prompt terminating every monitor response.
pub const PROMPT: &str = "(qemu) ";

/// Substrings that mark a failed monitor command.
const ERROR_MARKERS: &[&str] = &[
    "error",
    "could not",
    "failed",
    "not found",
    "duplicate id",
    "unknown command",
    "invalid",
];

/// Connected monitor session.
#[derive(Debug)]
pub struct Monitor {
    stream: UnixStream,
    timeout: Duration,
}

impl Monitor {
    /// Connect to the monitor socket and consume the greeting.
    pub fn connect(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            Error::monitor("connect", format!("{}: {}", path.display(), e))
        })?;
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;
        stream.set_write_timeout(Some(timeout))?;
        let mut monitor = Self { stream, timeout };
        monitor.read_response("greeting")?;
        tracing::debug!(socket = %path.display(), "connected to monitor");
        Ok(monitor)
    }

    /// Send one command and return its raw response text.
    pub fn command(&mut self, command: &str) -> Result<String> {
        if command.contains(['\n', '\r']) {
            return Err(Error::invalid("monitor command", "must be a single line"));
        }
        self.stream
            .write_all(format!("{}\n", command).as_bytes())
            .map_err(|e| Error::monitor(command, e.to_string()))?;
        let response = self.read_response(command)?;
        // Drop the echoed command line.
        let body = response
            .lines()
            .filter(|l| l.trim() != command.trim())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(body.trim().to_string())
    }

    /// Send one command and fail if the response reports an error.
    pub fn execute(&mut self, command: &str) -> Result<String> {
        let response = self.command(command)?;
        if let Some(line) = response_error(&response) {
            return Err(Error::monitor(command, line));
        }
        tracing::debug!(command, "monitor command succeeded");
        Ok(response)
    }

    fn read_response(&mut self, what: &str) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::monitor(what, "monitor closed the connection"));
                }
                Ok(n) => {
                    raw.extend_from_slice(&chunk[..n]);
                    let text = clean(&raw);
                    if let Some(body) = text.strip_suffix(PROMPT) {
                        return Ok(body.to_string());
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) => return Err(Error::monitor(what, e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(Error::monitor(what, "timed out waiting for monitor prompt"));
            }
            if process::interrupted() {
                return Err(Error::interrupted(format!("monitor {}", what)));
            }
        }
    }
}

/// First line of `response` that reports an error, if any.
pub fn response_error(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .find(|line| {
            let lower = line.to_ascii_lowercase();
            ERROR_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(str::to_string)
}

/// Strip terminal escape sequences and carriage returns.
fn clean(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    while let Some(&n) = chars.peek() {
                        chars.next();
                        if n.is_ascii_alphabetic() {
                            break;
                        }
                    }
                }
            }
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    /// A monitor stand-in: answers each command with `reply(command)` and
    /// reports every command it saw on the returned channel.
    pub(crate) fn fake_monitor(
        path: PathBuf,
        reply: fn(&str) -> String,
    ) -> (JoinHandle<()>, mpsc::Receiver<String>) {
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                stream
                    .write_all(b"QEMU 8.2.0 monitor - type 'help' for more information\r\n(qemu) ")
                    .unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
                    let cmd = line.trim().to_string();
                    line.clear();
                    let out = format!("{}\r\n\x1b[K{}\r\n(qemu) ", cmd, reply(&cmd));
                    if stream.write_all(out.as_bytes()).is_err() {
                        break;
                    }
                    if tx.send(cmd.clone()).is_err() || cmd == "quit" {
                        return;
                    }
                }
            }
        });
        (handle, rx)
    }

    #[test]
    fn test_command_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("monitor.sock");
        let (_h, seen) = fake_monitor(sock.clone(), |cmd| match cmd {
            "info status" => "VM status: running".into(),
            _ => String::new(),
        });

        let mut mon = Monitor::connect(&sock, Duration::from_secs(2)).unwrap();
        assert_eq!(mon.execute("info status").unwrap(), "VM status: running");
        assert_eq!(seen.recv().unwrap(), "info status");
    }

    #[test]
    fn test_error_response_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("monitor.sock");
        let (_h, _seen) = fake_monitor(sock.clone(), |_| {
            "Error: failed to find host usb device".into()
        });

        let mut mon = Monitor::connect(&sock, Duration::from_secs(2)).unwrap();
        let err = mon.execute("device_add usb-host,vendorid=0x1,productid=0x2").unwrap_err();
        assert!(matches!(err, Error::Monitor { .. }));
        assert!(err.to_string().contains("failed to find host usb device"));
    }

    #[test]
    fn test_connect_missing_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Monitor::connect(&tmp.path().join("absent.sock"), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Monitor { .. }));
    }

    #[test]
    fn test_response_error_and_clean() {
        assert_eq!(response_error(""), None);
        assert_eq!(response_error("VM status: running"), None);
        assert_eq!(
            response_error("ok\nDuplicate ID 'usb-046d-c52b' for device"),
            Some("Duplicate ID 'usb-046d-c52b' for device".into())
        );
        assert_eq!(clean(b"a\x1b[Kb\r\n"), "ab\n");
    }
}
