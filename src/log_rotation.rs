//! Rotation of per-VM hypervisor and console logs.
//!
//! Each start begins with fresh `console.log` and `hypervisor.log` files so
//! launch diagnostics only ever show the current run. Previous runs are kept
//! as `<log>.1` .. `<log>.3`.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Maximum number of rotated log files to keep.
pub const MAX_LOG_FILES: usize = 3;

/// Largest chunk read from the end of a log for diagnostics.
const TAIL_READ_BYTES: u64 = 64 * 1024;

fn rotated(log_path: &Path, n: usize) -> PathBuf {
    let mut s = log_path.as_os_str().to_owned();
    s.push(format!(".{}", n));
    PathBuf::from(s)
}

/// Rotate `log_path` if it exists and is non-empty.
///
/// - Current log -> `log.1`
/// - `log.1` -> `log.2`
/// - `log.2` -> `log.3`
/// - `log.3` -> deleted
///
/// Returns `Ok(true)` if rotation occurred.
pub fn rotate_for_start(log_path: &Path) -> io::Result<bool> {
    match fs::metadata(log_path) {
        Ok(m) if m.len() > 0 => {}
        Ok(_) => {
            fs::remove_file(log_path)?;
            return Ok(false);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let oldest = rotated(log_path, MAX_LOG_FILES);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for i in (1..MAX_LOG_FILES).rev() {
        let from = rotated(log_path, i);
        if from.exists() {
            fs::rename(&from, rotated(log_path, i + 1))?;
        }
    }
    fs::rename(log_path, rotated(log_path, 1))?;
    Ok(true)
}

/// Last `lines` lines of a log, or an empty string if it cannot be read.
pub fn tail(log_path: &Path, lines: usize) -> String {
    let Ok(mut file) = fs::File::open(log_path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(TAIL_READ_BYTES);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
