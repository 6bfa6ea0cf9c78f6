//! Disk image management through the external disk tool (`qemu-img`).
//!
//! Images are qcow2, created sparse at the requested virtual size. Only
//! growth is supported; the guest is responsible for extending its
//! partitions after a resize.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

/// Image format used for every VM disk.
pub const DISK_FORMAT: &str = "qcow2";

/// Sizes reported by `info --output=json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Size seen by the guest, in bytes.
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    /// Space used on the host, in bytes.
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
}

/// Handle on the configured disk tool command vector.
#[derive(Debug, Clone)]
pub struct DiskTool {
    argv: Vec<String>,
}

impl DiskTool {
    /// Disk tool invoked as `argv` followed by the subcommand.
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn run(&self, operation: &str, args: &[&str]) -> Result<Vec<u8>> {
        let (program, lead) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::invalid("disk tool", "empty command vector"))?;
        tracing::debug!(program = %program, operation, ?args, "running disk tool");

        let output = Command::new(program)
            .args(lead)
            .args(args)
            .output()
            .map_err(|e| Error::command_failed(program.as_str(), format!("{}: {}", operation, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = match stderr.trim() {
                "" => format!("{}: exited with {}", operation, output.status),
                msg => format!("{}: {}", operation, msg),
            };
            return Err(Error::command_failed(program.as_str(), reason));
        }
        Ok(output.stdout)
    }

    /// Create a sparse image of `size_mib` at `path`.
    pub fn create(&self, path: &Path, size_mib: u64) -> Result<()> {
        let path_str = path_str(path)?;
        let size = format!("{}M", size_mib);
        self.run("create", &["create", "-f", DISK_FORMAT, path_str, &size])?;
        tracing::info!(path = %path.display(), size_mib, "disk image created");
        Ok(())
    }

    /// Grow the image at `path` to `size_mib`.
    pub fn resize(&self, path: &Path, size_mib: u64) -> Result<()> {
        if !path.exists() {
            return Err(Error::DiskNotFound {
                path: path.to_path_buf(),
            });
        }
        let size = format!("{}M", size_mib);
        self.run("resize", &["resize", path_str(path)?, &size])?;
        tracing::info!(path = %path.display(), size_mib, "disk image resized");
        Ok(())
    }

    /// Query virtual and allocated size of the image at `path`.
    pub fn info(&self, path: &Path) -> Result<DiskInfo> {
        if !path.exists() {
            return Err(Error::DiskNotFound {
                path: path.to_path_buf(),
            });
        }
        let stdout = self.run("info", &["info", "--output=json", path_str(path)?])?;
        serde_json::from_slice(&stdout)
            .map_err(|e| Error::command_failed(self.argv[0].as_str(), format!("info: unreadable output: {}", e)))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::invalid("disk path", "path contains invalid characters"))
}
