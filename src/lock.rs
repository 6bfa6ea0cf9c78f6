//! Directory-based mutual exclusion between localvm invocations.
//!
//! A lock is a directory `<vm_dir>/.locks/<scope>.lock/` created with
//! `mkdir`, which is atomic on every local filesystem. Its `owner` file
//! records `pid=` and `acquired=` (unix seconds). A lock is reclaimed when
//! its owner is dead, or when it is older than the stale threshold even
//! though the owner is alive.
//!
//! Lock order is always [`Scope::Global`] before [`Scope::Vm`].

use crate::error::{Error, Result};
use crate::process;
use crate::store::write_atomic;
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// First retry delay while a lock is busy.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
/// Retry delay ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

const OWNER_FILE: &str = "owner";

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// VM set membership and the host-wide port namespace.
    Global,
    /// One VM's record and processes.
    Vm(String),
}

impl Scope {
    fn dir_name(&self) -> String {
        match self {
            Scope::Global => "global.lock".to_string(),
            Scope::Vm(name) => format!("vm-{}.lock", name),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global lock"),
            Scope::Vm(name) => write!(f, "vm '{}'", name),
        }
    }
}

/// Recorded holder of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Holder pid.
    pub pid: i32,
    /// Acquisition time, unix seconds.
    pub acquired: u64,
}

impl Owner {
    fn render(&self) -> String {
        format!("pid={}\nacquired={}\n", self.pid, self.acquired)
    }

    fn parse(text: &str) -> Option<Self> {
        let mut pid = None;
        let mut acquired = None;
        for line in text.lines() {
            match line.split_once('=') {
                Some(("pid", v)) => pid = v.trim().parse().ok(),
                Some(("acquired", v)) => acquired = v.trim().parse().ok(),
                _ => {}
            }
        }
        Some(Owner {
            pid: pid?,
            acquired: acquired?,
        })
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    /// The lock is ours until the guard drops.
    Held(LockGuard),
    /// Someone else holds it (pid 0 when the owner file is not written yet).
    Busy(i32),
}

/// Acquires scope locks and tracks every lock this process holds.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_after: Duration,
    held: Arc<Mutex<Vec<PathBuf>>>,
}

impl LockManager {
    /// Manager for locks under `dir`.
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Acquire `scope`, retrying with exponential backoff until `timeout`.
    pub fn acquire(&self, scope: Scope, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut logged = false;
        loop {
            match self.try_acquire(&scope)? {
                Acquire::Held(guard) => return Ok(guard),
                Acquire::Busy(owner_pid) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::LockBusy {
                            scope: scope.to_string(),
                            owner_pid,
                        });
                    }
                    if !logged {
                        tracing::info!(scope = %scope, owner_pid, "waiting for lock");
                        logged = true;
                    }
                    if process::interrupted() {
                        return Err(Error::interrupted(format!("waiting for {}", scope)));
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Make one attempt at `scope`, reclaiming a stale lock if found.
    pub fn try_acquire(&self, scope: &Scope) -> Result<Acquire> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)?;
        let path = self.dir.join(scope.dir_name());

        // A reclaim, won or lost, is followed by an immediate retry.
        for _ in 0..3 {
            match fs::DirBuilder::new().mode(0o700).create(&path) {
                Ok(()) => return self.claim(scope, path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            match self.inspect(scope, &path) {
                Verdict::Live(owner_pid) => return Ok(Acquire::Busy(owner_pid)),
                Verdict::Reclaim(seen) => {
                    if !self.reclaim(&path, seen)? {
                        tracing::debug!(scope = %scope, "lock changed hands during reclaim");
                    }
                }
            }
        }
        Ok(Acquire::Busy(0))
    }

    /// Release every lock this process still holds.
    pub fn release_all(&self) {
        let paths: Vec<PathBuf> = std::mem::take(&mut *self.held.lock());
        for path in paths {
            tracing::debug!(path = %path.display(), "releasing leftover lock");
            release_path(&path);
        }
    }

    /// Number of locks currently held by this process.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn claim(&self, scope: &Scope, path: PathBuf) -> Result<Acquire> {
        let owner = Owner {
            pid: std::process::id() as i32,
            acquired: unix_now(),
        };
        if let Err(e) = write_atomic(&path.join(OWNER_FILE), &owner.render()) {
            let _ = fs::remove_dir_all(&path);
            return Err(e);
        }
        self.held.lock().push(path.clone());
        tracing::debug!(scope = %scope, "lock acquired");
        Ok(Acquire::Held(LockGuard {
            scope: scope.clone(),
            path,
            held: Arc::clone(&self.held),
        }))
    }

    /// Decide whether the lock at `path` is live or may be reclaimed.
    fn inspect(&self, scope: &Scope, path: &Path) -> Verdict {
        let Some(owner) = read_owner(path) else {
            // Creator is between mkdir and writing the owner file.
            let age = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            if age > self.stale_after {
                tracing::warn!(scope = %scope, "reclaiming ownerless stale lock");
                return Verdict::Reclaim(None);
            }
            return Verdict::Live(0);
        };

        if !process::is_alive(owner.pid) {
            tracing::info!(scope = %scope, owner_pid = owner.pid, "reclaiming lock from dead owner");
            return Verdict::Reclaim(Some(owner));
        }
        let age = Duration::from_secs(unix_now().saturating_sub(owner.acquired));
        if age > self.stale_after {
            tracing::warn!(
                scope = %scope,
                owner_pid = owner.pid,
                age = %humantime::format_duration(age),
                "reclaiming stale lock from live owner"
            );
            return Verdict::Reclaim(Some(owner));
        }
        Verdict::Live(owner.pid)
    }

    /// Remove the lock at `path` if it still belongs to `seen`.
    ///
    /// Reclaimers serialize on a sibling `.reclaim` directory and re-read
    /// the owner under it. The lock is moved aside before deletion and its
    /// owner checked again; a lock that changed hands is put back. Returns
    /// false when the lock was not removed.
    fn reclaim(&self, path: &Path, seen: Option<Owner>) -> Result<bool> {
        let Some(_mutex) = ReclaimMutex::take(path)? else {
            return Ok(false);
        };
        if read_owner(path) != seen {
            return Ok(false);
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let tomb = path.with_extension(format!("stale.{}.{}", std::process::id(), nanos));
        match fs::rename(path, &tomb) {
            Ok(()) => {}
            // Released by its owner meanwhile.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        if read_owner(&tomb) != seen {
            if let Err(e) = rename_noreplace(&tomb, path) {
                tracing::warn!(path = %path.display(), error = %e, "could not restore lock taken during reclaim");
            }
            let _ = fs::remove_dir_all(&tomb);
            return Ok(false);
        }
        let _ = fs::remove_dir_all(&tomb);
        Ok(true)
    }
}

/// Result of inspecting an existing lock directory.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    /// Held by this pid (0 while the owner file is being written).
    Live(i32),
    /// Reclaimable; carries the owner that was seen.
    Reclaim(Option<Owner>),
}

/// Short-lived mutex serializing reclaimers of one lock.
struct ReclaimMutex {
    path: PathBuf,
}

impl ReclaimMutex {
    /// A holder that died mid-reclaim leaves this behind.
    const STALE_AFTER: Duration = Duration::from_secs(10);

    fn take(lock: &Path) -> Result<Option<Self>> {
        let path = lock.with_extension("reclaim");
        match fs::DirBuilder::new().mode(0o700).create(&path) {
            Ok(()) => Ok(Some(Self { path })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let age = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default();
                if age > Self::STALE_AFTER {
                    tracing::warn!(path = %path.display(), "removing abandoned reclaim marker");
                    let _ = fs::remove_dir(&path);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ReclaimMutex {
    fn drop(&mut self) {
        let _ = fs::remove_dir(&self.path);
    }
}

fn read_owner(path: &Path) -> Option<Owner> {
    fs::read_to_string(path.join(OWNER_FILE))
        .ok()
        .and_then(|text| Owner::parse(&text))
}

/// Rename `from` to `to`, failing if `to` exists.
#[cfg(target_os = "linux")]
fn rename_noreplace(from: &Path, to: &Path) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let from = CString::new(from.as_os_str().as_bytes())?;
    let to = CString::new(to.as_os_str().as_bytes())?;
    // SAFETY: both paths are valid NUL-terminated strings for the call.
    let rc = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from.as_ptr(),
            libc::AT_FDCWD,
            to.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn rename_noreplace(from: &Path, to: &Path) -> std::io::Result<()> {
    if to.exists() {
        return Err(std::io::ErrorKind::AlreadyExists.into());
    }
    fs::rename(from, to)
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    scope: Scope,
    path: PathBuf,
    held: Arc<Mutex<Vec<PathBuf>>>,
}

impl LockGuard {
    /// Scope this guard holds.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        let Some(pos) = held.iter().position(|p| p == &self.path) else {
            // Already released by release_all.
            return;
        };
        held.remove(pos);
        drop(held);
        release_path(&self.path);
        tracing::debug!(scope = %self.scope, "lock released");
    }
}

fn release_path(path: &Path) {
    let ours = read_owner(path)
        .map(|o| o.pid == std::process::id() as i32)
        .unwrap_or(false);
    if !ours {
        tracing::warn!(path = %path.display(), "lock was reclaimed by another process, not removing");
        return;
    }
    if let Err(e) = fs::remove_dir_all(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove lock");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
