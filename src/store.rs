//! Per-VM config store.
//!
//! Each VM lives in `<vm_dir>/<name>/`:
//!
//! ```text
//! vm.conf          persisted record (0600)
//! run.state        process handle while running (0600)
//! disk.qcow2       disk image
//! monitor.sock     hypervisor monitor socket
//! fs-<tag>.sock    shared-folder daemon sockets
//! console.log      guest serial console
//! hypervisor.log   hypervisor stdout/stderr
//! ```
//!
//! The store does no locking of its own; callers hold the appropriate scope
//! lock from [`crate::lock`] for the whole read-modify-write span.

use crate::error::{Error, Result};
use crate::kv::Document;
use crate::record::{validate_name, VmRecord};
use crate::runstate::RunState;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Record file name.
pub const CONFIG_FILE: &str = "vm.conf";
/// Process handle file name.
pub const RUN_STATE_FILE: &str = "run.state";
/// Lock directory name under the VM root.
pub const LOCKS_DIR: &str = ".locks";

/// Paths of one VM's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    dir: PathBuf,
}

impl VmLayout {
    /// Layout rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// VM directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persisted record.
    pub fn config(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Process handle.
    pub fn run_state(&self) -> PathBuf {
        self.dir.join(RUN_STATE_FILE)
    }

    /// Disk image.
    pub fn disk(&self) -> PathBuf {
        self.dir.join("disk.qcow2")
    }

    /// Monitor socket.
    pub fn monitor(&self) -> PathBuf {
        self.dir.join("monitor.sock")
    }

    /// Serial console log.
    pub fn console_log(&self) -> PathBuf {
        self.dir.join("console.log")
    }

    /// Hypervisor stdout/stderr log.
    pub fn hypervisor_log(&self) -> PathBuf {
        self.dir.join("hypervisor.log")
    }

    /// Socket for the shared-folder daemon serving `tag`.
    pub fn share_socket(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("fs-{}.sock", tag))
    }
}

/// Loads and persists VM records under a VM directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Store rooted at `root` (the VM directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// VM directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock directory.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    /// Artifact layout for `name`.
    pub fn layout(&self, name: &str) -> VmLayout {
        VmLayout::new(self.root.join(name))
    }

    /// True if `name` has a directory (valid record or not).
    pub fn exists(&self, name: &str) -> bool {
        self.root.join(name).is_dir()
    }

    /// Create the VM directory root (0700) if missing.
    pub fn ensure_root(&self) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)?;
        Ok(())
    }

    /// Load the record for `name`.
    pub fn load(&self, name: &str) -> Result<VmRecord> {
        validate_name(name)?;
        let path = self.layout(name).config();
        let text = match read_private(&path)? {
            Some(text) => text,
            None => return Err(Error::vm_not_found(name)),
        };
        let doc = Document::parse(&text).map_err(|e| Error::corrupted(&path, e))?;
        let record = VmRecord::from_document(doc, &path)?;
        if record.name != name {
            return Err(Error::corrupted(
                &path,
                format!("record names '{}' but lives in directory '{}'", record.name, name),
            ));
        }
        Ok(record)
    }

    /// Atomically persist `record`.
    pub fn save(&self, record: &VmRecord) -> Result<()> {
        let path = self.layout(&record.name).config();
        let text = record.to_document()?.render();
        // Required fields are checked on the rendered text.
        let check = Document::parse(&text).map_err(|e| Error::corrupted(&path, e))?;
        VmRecord::from_document(check, &path)?;
        write_atomic(&path, &text)?;
        tracing::debug!(vm = %record.name, path = %path.display(), "saved vm record");
        Ok(())
    }

    /// Load the process handle for `name`, if any.
    pub fn load_run_state(&self, name: &str) -> Result<Option<RunState>> {
        let path = self.layout(name).run_state();
        let Some(text) = read_private(&path)? else {
            return Ok(None);
        };
        let doc = Document::parse(&text).map_err(|e| Error::corrupted(&path, e))?;
        RunState::from_document(doc, &path).map(Some)
    }

    /// Atomically persist the process handle for `name`.
    pub fn save_run_state(&self, name: &str, state: &RunState) -> Result<()> {
        let path = self.layout(name).run_state();
        write_atomic(&path, &state.to_document()?.render())
    }

    /// Remove the process handle for `name`.
    pub fn remove_run_state(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.layout(name).run_state()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a file that must be private to the current user.
///
/// Returns `None` if the file does not exist.
fn read_private(path: &Path) -> Result<Option<String>> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(Error::corrupted(
            path,
            format!("insecure permissions {:o} (expected 600)", mode),
        ));
    }
    let euid = unsafe { libc::geteuid() };
    if meta.uid() != euid {
        return Err(Error::corrupted(
            path,
            format!("owned by uid {} (expected {})", meta.uid(), euid),
        ));
    }
    Ok(Some(fs::read_to_string(path)?))
}

/// Write `contents` to `path` via an exclusive 0600 temp file, fsync and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::invalid("path", format!("{} has no parent", path.display())))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path());
        (tmp, store)
    }

    fn seed(store: &Store, record: &VmRecord) {
        fs::create_dir(store.layout(&record.name).dir()).unwrap();
        store.save(record).unwrap();
    }

    #[test]
    fn test_save_then_load() {
        let (_tmp, store) = store();
        let mut record = VmRecord::new("web", 4, 4096, "q35");
        record.id = Some(1);
        seed(&store, &record);

        assert_eq!(store.load("web").unwrap(), record);
        let mode = fs::metadata(store.layout("web").config())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_tmp, store) = store();
        assert!(matches!(store.load("ghost"), Err(Error::VmNotFound { .. })));
    }

    #[test]
    fn test_insecure_permissions_are_corrupted() {
        let (_tmp, store) = store();
        seed(&store, &VmRecord::new("web", 1, 512, "pc"));
        let path = store.layout("web").config();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(store.load("web"), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_name_mismatch_is_corrupted() {
        let (_tmp, store) = store();
        seed(&store, &VmRecord::new("web", 1, 512, "pc"));
        fs::rename(store.layout("web").dir(), store.root().join("db")).unwrap();
        assert!(matches!(store.load("db"), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let (_tmp, store) = store();
        let mut record = VmRecord::new("web", 1, 512, "pc");
        seed(&store, &record);
        record.cores = 2;
        store.save(&record).unwrap();
        let names: Vec<_> = fs::read_dir(store.layout("web").dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![CONFIG_FILE.to_string()]);
        assert_eq!(store.load("web").unwrap().cores, 2);
    }

    #[test]
    fn test_run_state_lifecycle() {
        let (_tmp, store) = store();
        seed(&store, &VmRecord::new("web", 1, 512, "pc"));
        assert!(store.load_run_state("web").unwrap().is_none());
        let state = RunState {
            pid: 1234,
            start_time: Some(5),
            started_at: None,
            monitor: store.layout("web").monitor(),
            daemons: Vec::new(),
        };
        store.save_run_state("web", &state).unwrap();
        assert_eq!(store.load_run_state("web").unwrap(), Some(state));
        store.remove_run_state("web").unwrap();
        store.remove_run_state("web").unwrap();
        assert!(store.load_run_state("web").unwrap().is_none());
    }
}
