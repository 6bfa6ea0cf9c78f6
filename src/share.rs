//! Shared folders: configuration checks and daemon supervision.
//!
//! Every virtiofs folder is served by its own daemon listening on
//! `<vm dir>/fs-<tag>.sock`. Daemons are started right before the
//! hypervisor, which connects to the sockets during device setup, and
//! never outlive it: stop (and a failed launch) terminates them and removes
//! their sockets.

use crate::error::{Error, Result};
use crate::log_rotation;
use crate::process::{self, Spawned};
use crate::record::{validate_tag, NetworkType, ShareTransport, SharedFolder, VmRecord, MAX_TAG_LENGTH};
use crate::runstate::DaemonHandle;
use crate::store::VmLayout;
use sha2::{Digest, Sha256};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a daemon socket.
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period for a daemon to exit on SIGTERM.
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Length of the hash suffix on derived tags.
const TAG_HASH_LEN: usize = 8;

/// Canonicalize `path` and check it is a readable and writable directory.
pub fn validate_host_path(path: &Path) -> Result<PathBuf> {
    let canonical = fs::canonicalize(path).map_err(|e| {
        Error::share("validate path", format!("{}: {}", path.display(), e))
    })?;
    if !canonical.is_dir() {
        return Err(Error::share(
            "validate path",
            format!("not a directory: {}", canonical.display()),
        ));
    }
    if canonical.to_str().is_none() || canonical.as_os_str().as_bytes().iter().any(|b| b.is_ascii_control()) {
        return Err(Error::share(
            "validate path",
            format!("unsupported characters in path: {}", canonical.display()),
        ));
    }
    let c_path = CString::new(canonical.as_os_str().as_bytes())
        .map_err(|_| Error::share("validate path", "path contains a NUL byte"))?;
    if unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK | libc::X_OK) } != 0 {
        return Err(Error::share(
            "validate path",
            format!("no read/write access to {}", canonical.display()),
        ));
    }
    Ok(canonical)
}

/// Derive a mount tag from a host path: sanitized basename plus a hash suffix.
pub fn derive_tag(path: &Path) -> String {
    let base: String = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "share".to_string())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_TAG_LENGTH - TAG_HASH_LEN - 1)
        .collect();
    let base = if base.is_empty() { "share".to_string() } else { base };
    let hash = Sha256::digest(path.as_os_str().as_bytes());
    let suffix: String = hash
        .iter()
        .take(TAG_HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}-{}", base, suffix)
}

/// Validate a new shared folder against `record` and return the entry to append.
///
/// `host_path` must already be canonical (see [`validate_host_path`]).
pub fn plan_add(
    record: &VmRecord,
    host_path: PathBuf,
    tag: Option<&str>,
    transport: ShareTransport,
    max_folders: Option<usize>,
) -> Result<SharedFolder> {
    if let Some(max) = max_folders {
        if record.shared_folders.len() >= max {
            return Err(Error::invalid(
                "shared folder",
                format!("vm '{}' already has the maximum of {} shared folders", record.name, max),
            ));
        }
    }
    let tag = match tag {
        Some(t) => {
            validate_tag(t)?;
            t.to_string()
        }
        None => derive_tag(&host_path),
    };
    if record.shared_folders.iter().any(|s| s.tag == tag) {
        return Err(Error::duplicate("mount tag", &record.name, &tag));
    }
    if record.shared_folders.iter().any(|s| s.host_path == host_path) {
        return Err(Error::duplicate(
            "host path",
            &record.name,
            host_path.display().to_string(),
        ));
    }
    if transport == ShareTransport::Smb {
        if record.network != NetworkType::User {
            return Err(Error::invalid(
                "shared folder",
                "smb sharing requires user networking",
            ));
        }
        if record.shared_folders.iter().any(|s| s.transport == ShareTransport::Smb) {
            return Err(Error::invalid(
                "shared folder",
                "only one smb shared folder is supported per vm",
            ));
        }
    }
    Ok(SharedFolder {
        host_path,
        tag,
        transport,
    })
}

/// Starts and stops shared-folder daemons for one VM.
#[derive(Debug, Clone)]
pub struct ShareSupervisor<'a> {
    daemon: &'a [String],
    socket_timeout: Duration,
    layout: &'a VmLayout,
}

impl<'a> ShareSupervisor<'a> {
    /// Supervisor running `daemon` for the VM at `layout`.
    pub fn new(daemon: &'a [String], socket_timeout: Duration, layout: &'a VmLayout) -> Self {
        Self {
            daemon,
            socket_timeout,
            layout,
        }
    }

    /// Start one daemon per virtiofs folder and wait for every socket.
    ///
    /// On failure every daemon started so far is stopped.
    pub fn start_all(&self, folders: &[SharedFolder]) -> Result<Vec<DaemonHandle>> {
        let mut started = Vec::new();
        for folder in folders
            .iter()
            .filter(|f| f.transport == ShareTransport::Virtiofs)
        {
            match self.start_one(folder) {
                Ok(handle) => started.push(handle),
                Err(e) => {
                    self.stop_all(&started);
                    return Err(e);
                }
            }
        }
        Ok(started)
    }

    fn start_one(&self, folder: &SharedFolder) -> Result<DaemonHandle> {
        if !folder.host_path.is_dir() {
            return Err(Error::share(
                "start daemon",
                format!("shared folder no longer exists: {}", folder.host_path.display()),
            ));
        }
        let socket = self.layout.share_socket(&folder.tag);
        remove_socket(&socket);

        let mut argv = self.daemon.to_vec();
        argv.push(format!("--socket-path={}", socket.display()));
        argv.push(format!("--shared-dir={}", folder.host_path.display()));
        argv.push("--cache=auto".to_string());

        let log = self.layout.hypervisor_log();
        let Spawned { pid, start_time } = process::spawn_detached(&argv, Some(&log))
            .map_err(|e| Error::share("start daemon", e.to_string()))?;
        tracing::debug!(tag = %folder.tag, pid, socket = %socket.display(), "started share daemon");

        let handle = DaemonHandle {
            tag: folder.tag.clone(),
            pid,
            start_time,
            socket,
        };
        match self.wait_for_socket(&handle) {
            Ok(()) => Ok(handle),
            Err(e) => {
                stop_daemon(&handle);
                Err(e)
            }
        }
    }

    fn wait_for_socket(&self, handle: &DaemonHandle) -> Result<()> {
        let deadline = Instant::now() + self.socket_timeout;
        loop {
            if handle.socket.exists() {
                return Ok(());
            }
            if !process::is_alive(handle.pid) {
                let tail = log_rotation::tail(&self.layout.hypervisor_log(), 5);
                return Err(Error::share(
                    "start daemon",
                    format!("daemon for '{}' exited before creating its socket: {}", handle.tag, tail),
                ));
            }
            if Instant::now() >= deadline {
                return Err(Error::share(
                    "start daemon",
                    format!(
                        "socket {} did not appear within {}",
                        handle.socket.display(),
                        humantime::format_duration(self.socket_timeout)
                    ),
                ));
            }
            if process::interrupted() {
                return Err(Error::interrupted("waiting for share daemon"));
            }
            std::thread::sleep(SOCKET_POLL_INTERVAL);
        }
    }

    /// Stop every daemon and remove its socket.
    pub fn stop_all(&self, handles: &[DaemonHandle]) {
        for handle in handles {
            stop_daemon(handle);
        }
    }
}

/// Terminate one daemon and remove its socket. Failures are logged.
pub fn stop_daemon(handle: &DaemonHandle) {
    match process::stop_process(handle.pid, handle.start_time, DAEMON_STOP_TIMEOUT, false) {
        Ok(outcome) => {
            tracing::debug!(tag = %handle.tag, pid = handle.pid, ?outcome, "stopped share daemon")
        }
        Err(e) => {
            tracing::warn!(tag = %handle.tag, pid = handle.pid, error = %e, "failed to stop share daemon")
        }
    }
    remove_socket(&handle.socket);
}

fn remove_socket(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(socket = %path.display(), error = %e, "failed to remove socket"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// virtiofsd stand-in: creates the socket file, then idles.
    fn fake_daemon() -> Vec<String> {
        let script = r#"
            for a in "$@"; do
              case "$a" in --socket-path=*) : > "${a#--socket-path=}" ;; esac
            done
            exec sleep 30
        "#;
        vec!["sh".into(), "-c".into(), script.into(), "virtiofsd".into()]
    }

    fn folder(dir: &Path, tag: &str) -> SharedFolder {
        SharedFolder {
            host_path: dir.to_path_buf(),
            tag: tag.into(),
            transport: ShareTransport::Virtiofs,
        }
    }

    #[test]
    fn test_derive_tag() {
        let tag = derive_tag(Path::new("/home/me/My Projects!"));
        assert!(tag.starts_with("My_Projects_-"));
        assert!(tag.len() <= MAX_TAG_LENGTH);
        assert!(validate_tag(&tag).is_ok());
        assert_ne!(tag, derive_tag(Path::new("/other/My Projects!")));
        assert!(validate_tag(&derive_tag(Path::new(&"x".repeat(200)))).is_ok());
        assert!(derive_tag(Path::new("/")).starts_with("share-"));
    }

    #[test]
    fn test_validate_host_path() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            validate_host_path(&tmp.path().join(".")).unwrap(),
            fs::canonicalize(tmp.path()).unwrap()
        );
        assert!(validate_host_path(&tmp.path().join("missing")).is_err());
        let file = tmp.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(validate_host_path(&file).is_err());
    }

    #[test]
    fn test_plan_add_rules() {
        let mut record = VmRecord::new("web", 1, 512, "pc");
        let a = plan_add(&record, "/srv/a".into(), Some("data"), ShareTransport::Virtiofs, None).unwrap();
        record.shared_folders.push(a);

        assert!(matches!(
            plan_add(&record, "/srv/b".into(), Some("data"), ShareTransport::Virtiofs, None),
            Err(Error::Duplicate { .. })
        ));
        assert!(matches!(
            plan_add(&record, "/srv/a".into(), Some("other"), ShareTransport::NineP, None),
            Err(Error::Duplicate { .. })
        ));
        assert!(plan_add(&record, "/srv/b".into(), None, ShareTransport::NineP, Some(1)).is_err());

        let smb = plan_add(&record, "/srv/c".into(), None, ShareTransport::Smb, None).unwrap();
        record.shared_folders.push(smb);
        assert!(plan_add(&record, "/srv/d".into(), None, ShareTransport::Smb, None).is_err());

        record.network = NetworkType::Nat;
        record.shared_folders.pop();
        assert!(plan_add(&record, "/srv/c".into(), None, ShareTransport::Smb, None).is_err());
    }

    #[test]
    fn test_start_and_stop_daemons() {
        let tmp = TempDir::new().unwrap();
        let layout = VmLayout::new(tmp.path().join("web"));
        fs::create_dir_all(layout.dir()).unwrap();
        let shared = tmp.path().join("shared");
        fs::create_dir_all(&shared).unwrap();

        let daemon = fake_daemon();
        let sup = ShareSupervisor::new(&daemon, Duration::from_secs(5), &layout);
        let folders = vec![
            folder(&shared, "one"),
            folder(&shared, "two"),
            SharedFolder {
                host_path: shared.clone(),
                tag: "nine".into(),
                transport: ShareTransport::NineP,
            },
        ];
        let handles = sup.start_all(&folders).unwrap();
        assert_eq!(handles.len(), 2, "only virtiofs folders get daemons");
        for h in &handles {
            assert!(h.socket.exists());
            assert!(h.is_alive());
        }

        sup.stop_all(&handles);
        for h in &handles {
            assert!(!h.socket.exists());
            assert!(!process::is_alive(h.pid));
        }
    }

    #[test]
    fn test_socket_timeout_kills_daemon_and_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let layout = VmLayout::new(tmp.path().join("web"));
        fs::create_dir_all(layout.dir()).unwrap();
        let shared = tmp.path().join("shared");
        fs::create_dir_all(&shared).unwrap();

        let silent: Vec<String> = vec!["sh".into(), "-c".into(), "exec sleep 30".into()];
        let sup = ShareSupervisor::new(&silent, Duration::from_millis(300), &layout);
        let err = sup.start_all(&[folder(&shared, "one")]).unwrap_err();
        assert!(matches!(err, Error::Share { .. }));
        assert!(err.to_string().contains("did not appear"));
        assert!(!layout.share_socket("one").exists());
    }

    #[test]
    fn test_daemon_exit_fails_early() {
        let tmp = TempDir::new().unwrap();
        let layout = VmLayout::new(tmp.path().join("web"));
        fs::create_dir_all(layout.dir()).unwrap();
        let shared = tmp.path().join("shared");
        fs::create_dir_all(&shared).unwrap();

        let crashing: Vec<String> = vec!["sh".into(), "-c".into(), "echo 'bad shared dir' >&2; exit 1".into()];
        let sup = ShareSupervisor::new(&crashing, Duration::from_secs(10), &layout);
        let start = Instant::now();
        let err = sup.start_all(&[folder(&shared, "one")]).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("exited before creating its socket"));
    }
}
