//! VM lifecycle controller.
//!
//! Every operation follows the same shape: take the scope locks (global
//! before per-VM), load the current record, validate the transition, then
//! mutate through the store or engage the hypervisor. Locks are RAII guards
//! and are released on every exit path, including errors and interrupts.
//!
//! States: absent, stopped, running. `locked` is an orthogonal flag that
//! blocks configuration changes and deletion.

use crate::config::Settings;
use crate::disk::{DiskInfo, DiskTool};
use crate::error::{Error, ErrorKind, Result};
use crate::invocation::{self, InvocationContext};
use crate::lock::{LockGuard, LockManager, Scope};
use crate::log_rotation;
use crate::monitor::Monitor;
use crate::ports::{self, AddPlan, OwnedForward};
use crate::process::{self, StopOutcome};
use crate::record::{
    validate_cores, validate_cpu_model, validate_disk, validate_machine, validate_memory,
    validate_name, validate_nic_model, NetworkType, OsType, PortForward, Protocol,
    ShareTransport, SharedFolder, UsbDevice, VmRecord,
};
use crate::registry::{Registry, Scan};
use crate::runstate::{DaemonHandle, RunState};
use crate::share::{self, ShareSupervisor};
use crate::store::{Store, VmLayout};
use crate::usb::{self, HostUsbDevice, SysfsUsb, UsbHost};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Lines of hypervisor log included in a launch failure.
const LAUNCH_LOG_LINES: usize = 20;

/// Poll interval while waiting for the monitor socket.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Confirmation
// ============================================================================

/// Source of answers to yes/no questions.
pub trait Confirm: fmt::Debug {
    /// Ask `prompt`; `true` means proceed.
    fn confirm(&self, prompt: &str) -> bool;
}

/// Asks on stderr and reads the answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        eprint!("{} [y/N] ", prompt);
        let _ = std::io::stderr().flush();
        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

/// Answers every question the same way.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

// ============================================================================
// Inputs and reports
// ============================================================================

/// Parameters for [`Controller::create`]. Unset fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// vCPU count.
    pub cores: Option<u32>,
    /// Memory in MiB.
    pub memory_mib: Option<u64>,
    /// Disk size in MiB.
    pub disk_mib: Option<u64>,
    /// Machine type.
    pub machine: Option<String>,
    /// CPU model.
    pub cpu_model: Option<String>,
    /// Network attachment.
    pub network: Option<NetworkType>,
    /// NIC model.
    pub nic_model: Option<String>,
    /// Guest OS family.
    pub os_type: Option<OsType>,
}

/// Options for [`Controller::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Run without a graphical display.
    pub headless: bool,
}

/// Configuration changes applied by [`Controller::configure`].
#[derive(Debug, Clone, Default)]
pub struct ConfigChange {
    /// New vCPU count.
    pub cores: Option<u32>,
    /// New memory in MiB.
    pub memory_mib: Option<u64>,
    /// New machine type.
    pub machine: Option<String>,
    /// New CPU model.
    pub cpu_model: Option<String>,
    /// New network attachment.
    pub network: Option<NetworkType>,
    /// New NIC model.
    pub nic_model: Option<String>,
    /// New guest OS family.
    pub os_type: Option<OsType>,
}

impl ConfigChange {
    /// True if nothing would change.
    pub fn is_empty(&self) -> bool {
        self.cores.is_none()
            && self.memory_mib.is_none()
            && self.machine.is_none()
            && self.cpu_model.is_none()
            && self.network.is_none()
            && self.nic_model.is_none()
            && self.os_type.is_none()
    }
}

/// Observed run state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// No live hypervisor process.
    Stopped,
    /// The recorded hypervisor process is alive.
    Running,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Stopped => write!(f, "stopped"),
            VmState::Running => write!(f, "running"),
        }
    }
}

/// Full status of one VM.
#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    /// Persisted configuration.
    #[serde(flatten)]
    pub record: VmRecord,
    /// Observed state.
    pub state: VmState,
    /// Hypervisor pid while running.
    pub pid: Option<i32>,
    /// Launch time while running.
    pub started_at: Option<String>,
    /// Shared-folder daemons while running.
    pub daemons: Vec<DaemonHandle>,
    /// Disk sizes, when the disk tool could report them.
    pub disk: Option<DiskInfo>,
}

/// One line of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSummary {
    /// Stable id.
    pub id: u32,
    /// VM name.
    pub name: String,
    /// Observed state.
    pub state: VmState,
    /// vCPU count.
    pub cores: u32,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Disk size in MiB.
    pub disk_mib: Option<u64>,
    /// Network attachment.
    pub network: NetworkType,
    /// Number of port forwards.
    pub ports: usize,
    /// Locked flag.
    pub locked: bool,
}

/// Where a USB attach or detach took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbTarget {
    /// Hot-plugged into the running VM.
    Live,
    /// Written to the record for the next start.
    Persisted,
}

// ============================================================================
// Controller
// ============================================================================

/// Coordinates VM operations over one VM directory.
#[derive(Debug)]
pub struct Controller {
    settings: Settings,
    store: Store,
    locks: LockManager,
    registry: Registry,
    disk: DiskTool,
    confirm: Box<dyn Confirm>,
    usb_host: Box<dyn UsbHost>,
}

impl Controller {
    /// Controller for the VM directory named in `settings`.
    pub fn new(settings: Settings) -> Self {
        let store = Store::new(settings.vm_dir.clone());
        let locks = LockManager::new(store.locks_dir(), settings.stale_lock_after);
        let registry = Registry::new(store.clone(), settings.registry_cache_ttl);
        let disk = DiskTool::new(settings.disk_tool.clone());
        let usb_host = Box::new(SysfsUsb::new(settings.usb_sysfs.clone()));
        Self {
            settings,
            store,
            locks,
            registry,
            disk,
            confirm: Box::new(StdinConfirm),
            usb_host,
        }
    }

    /// Replace the confirmation source.
    pub fn with_confirm(mut self, confirm: impl Confirm + 'static) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    /// Replace the host USB enumerator.
    pub fn with_usb_host(mut self, host: impl UsbHost + 'static) -> Self {
        self.usb_host = Box::new(host);
        self
    }

    /// Active settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Lock manager (for `release_all` on exit).
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Resolve a VM name or numeric id to a name.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        self.registry.resolve(reference)
    }

    fn lock_global(&self) -> Result<LockGuard> {
        self.locks.acquire(Scope::Global, self.settings.lock_timeout)
    }

    fn lock_vm(&self, name: &str) -> Result<LockGuard> {
        self.locks
            .acquire(Scope::Vm(name.to_string()), self.settings.lock_timeout)
    }

    /// Run state of `name` if its hypervisor is alive.
    fn live_state(&self, name: &str) -> Result<Option<RunState>> {
        Ok(self
            .store
            .load_run_state(name)?
            .filter(RunState::is_alive))
    }

    fn ensure_stopped(&self, name: &str, operation: &str) -> Result<()> {
        match self.live_state(name)? {
            Some(_) => Err(Error::vm_running(name, operation)),
            None => Ok(()),
        }
    }

    fn load_mutable(&self, name: &str, operation: &str) -> Result<VmRecord> {
        let record = self.store.load(name)?;
        if record.locked {
            return Err(Error::vm_locked(name));
        }
        self.ensure_stopped(name, operation)?;
        Ok(record)
    }

    // ========================================================================
    // Create / delete
    // ========================================================================

    /// Create a stopped VM: directory, disk image, then record.
    ///
    /// Any failure removes the partially created directory.
    pub fn create(&self, name: &str, spec: &CreateSpec) -> Result<VmRecord> {
        validate_name(name)?;
        let defaults = &self.settings.defaults;
        let cores = spec.cores.unwrap_or(defaults.cores);
        let memory_mib = spec.memory_mib.unwrap_or(defaults.memory);
        let disk_mib = spec.disk_mib.unwrap_or(defaults.disk);
        let machine = spec.machine.clone().unwrap_or_else(|| defaults.machine.clone());
        let cpu_model = spec.cpu_model.clone().unwrap_or_else(|| defaults.cpu.clone());
        validate_cores(cores)?;
        validate_memory(memory_mib)?;
        validate_disk(disk_mib)?;
        validate_machine(&machine)?;
        validate_cpu_model(&cpu_model)?;
        if let Some(nic) = &spec.nic_model {
            validate_nic_model(nic)?;
        }

        let _global = self.lock_global()?;
        self.store.ensure_root()?;
        if self.store.exists(name) {
            return Err(Error::VmExists {
                name: name.to_string(),
            });
        }
        let existing = self.registry.rescan()?;
        if existing.len() >= self.settings.max_vms {
            return Err(Error::VmLimit {
                max: self.settings.max_vms,
            });
        }
        self.persist_assigned_ids(&existing, None);
        let id = existing
            .max_id()
            .checked_add(1)
            .ok_or_else(|| Error::invalid("vm id", "id space exhausted"))?;

        let layout = self.store.layout(name);
        let rollback = CreateRollback::new(&layout)?;

        self.disk.create(&layout.disk(), disk_mib)?;

        let mut record = VmRecord::new(name, cores, memory_mib, machine);
        record.id = Some(id);
        record.created_at = Some(now_rfc3339());
        record.disk_mib = Some(disk_mib);
        record.cpu_model = Some(cpu_model);
        record.network = spec.network.unwrap_or(NetworkType::User);
        record.nic_model = spec.nic_model.clone();
        record.os_type = spec.os_type.unwrap_or(OsType::Linux);
        record.mac = Some(invocation::generate_mac(&mac_seed(name)));
        self.store.save(&record)?;

        rollback.commit();
        self.registry.invalidate();
        tracing::info!(vm = %name, id, cores, memory_mib, disk_mib, "vm created");
        Ok(record)
    }

    /// Delete a VM and every artifact.
    ///
    /// Without `force`, locked or running VMs are rejected and the user is
    /// asked to confirm. With `force`, a running VM is stopped first.
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        validate_name(name)?;
        let _global = self.lock_global()?;
        let _vm = self.lock_vm(name)?;

        match self.store.load(name) {
            Ok(record) => {
                if record.locked && !force {
                    return Err(Error::vm_locked(name));
                }
            }
            Err(e) if force && e.kind() == ErrorKind::Corruption => {
                tracing::warn!(vm = %name, error = %e, "deleting vm with unreadable record");
            }
            Err(e) => return Err(e),
        }

        if self.live_state(name)?.is_some() {
            if !force {
                return Err(Error::vm_running(name, "deleting it"));
            }
            tracing::info!(vm = %name, "stopping running vm before delete");
            self.stop_locked(name, false)?;
        }

        if !force && !self.confirm.confirm(&format!("Delete vm '{}'?", name)) {
            return Err(Error::cancelled(format!("delete vm '{}'", name)));
        }

        // Ids handed out on the fly are based on the current maximum; pin
        // them before this VM's id stops counting.
        self.persist_assigned_ids(&self.registry.rescan()?, Some(name));
        fs::remove_dir_all(self.store.layout(name).dir())?;
        self.registry.invalidate();
        tracing::info!(vm = %name, "vm deleted");
        Ok(())
    }

    /// Write ids the registry assigned during a scan into their records.
    ///
    /// Runs under the global lock. A VM whose lock is busy keeps its
    /// assigned id unpersisted until the next create or delete.
    fn persist_assigned_ids(&self, scan: &Scan, skip: Option<&str>) {
        for name in scan.unpersisted.iter().filter(|n| Some(n.as_str()) != skip) {
            let Some(id) = scan.records.iter().find(|r| &r.name == name).and_then(|r| r.id) else {
                continue;
            };
            let result = self
                .locks
                .acquire(Scope::Vm(name.clone()), Duration::ZERO)
                .and_then(|_vm| {
                    let mut record = self.store.load(name)?;
                    if record.id.is_none() {
                        record.id = Some(id);
                        self.store.save(&record)?;
                    }
                    Ok(())
                });
            match result {
                Ok(()) => tracing::info!(vm = %name, id, "persisted assigned vm id"),
                Err(e) => tracing::warn!(vm = %name, id, error = %e, "could not persist assigned vm id"),
            }
        }
        if !scan.unpersisted.is_empty() {
            self.registry.invalidate();
        }
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    /// Launch the hypervisor for `name`.
    pub fn start(&self, name: &str, options: &StartOptions) -> Result<RunState> {
        validate_name(name)?;
        if !options.headless && !display_available() {
            return Err(Error::invalid(
                "display",
                "no graphical display available (DISPLAY and WAYLAND_DISPLAY are unset); use --headless",
            ));
        }
        let _vm = self.lock_vm(name)?;
        let record = self.store.load(name)?;

        if let Some(stale) = self.store.load_run_state(name)? {
            if stale.is_alive() {
                return Err(Error::vm_running(name, "starting it again"));
            }
            tracing::debug!(vm = %name, pid = stale.pid, "clearing stale process handle");
            for daemon in &stale.daemons {
                share::stop_daemon(daemon);
            }
            self.store.remove_run_state(name)?;
        }

        let layout = self.store.layout(name);
        for log in [layout.console_log(), layout.hypervisor_log()] {
            if let Err(e) = log_rotation::rotate_for_start(&log) {
                tracing::warn!(path = %log.display(), error = %e, "failed to rotate log");
            }
        }
        remove_if_exists(&layout.monitor())?;

        let ctx = InvocationContext {
            layout: &layout,
            nat_bridge: &self.settings.nat_bridge,
            usb_controller: self.settings.usb_controller,
            headless: options.headless,
        };
        let args = invocation::build(&record, &ctx)?;

        let supervisor = ShareSupervisor::new(
            &self.settings.share_daemon,
            self.settings.share_socket_timeout,
            &layout,
        );
        let daemons = supervisor.start_all(&record.shared_folders)?;
        let mut launch = LaunchRollback {
            store: &self.store,
            layout: &layout,
            name,
            daemons,
            hypervisor: None,
            armed: true,
        };

        let mut argv = self.settings.hypervisor.clone();
        argv.extend(args);
        tracing::debug!(vm = %name, ?argv, "launching hypervisor");
        let spawned = process::spawn_detached(&argv, Some(&layout.hypervisor_log()))
            .map_err(|e| Error::launch_failed(name, e.to_string()))?;
        launch.hypervisor = Some(spawned);

        let state = RunState {
            pid: spawned.pid,
            start_time: spawned.start_time,
            started_at: Some(now_rfc3339()),
            monitor: layout.monitor(),
            daemons: launch.daemons.clone(),
        };
        self.store.save_run_state(name, &state)?;

        if process::wait_for_exit(spawned.pid, self.settings.launch_check, "launch check")? {
            let tail = log_rotation::tail(&layout.hypervisor_log(), LAUNCH_LOG_LINES);
            let reason = if tail.is_empty() {
                "hypervisor exited during startup".to_string()
            } else {
                format!("hypervisor exited during startup:\n{}", tail)
            };
            return Err(Error::launch_failed(name, reason));
        }
        launch.commit();
        tracing::info!(vm = %name, pid = state.pid, "vm started");

        self.replay_usb(&record, &state.monitor);
        Ok(state)
    }

    /// Stop `name`. Succeeds without effect if it is not running.
    pub fn stop(&self, name: &str, force: bool) -> Result<StopOutcome> {
        validate_name(name)?;
        let _vm = self.lock_vm(name)?;
        self.store.load(name)?;
        self.stop_locked(name, force)
    }

    /// Stop with the per-VM lock already held.
    fn stop_locked(&self, name: &str, force: bool) -> Result<StopOutcome> {
        let Some(state) = self.store.load_run_state(name)? else {
            return Ok(StopOutcome::NotRunning);
        };
        let stopped = if state.is_alive() {
            process::stop_process(state.pid, state.start_time, self.settings.stop_timeout, force)
        } else {
            Ok(StopOutcome::NotRunning)
        };
        self.finish_stop(name, &state, stopped)
    }

    /// Tear down what surrounds the hypervisor once its stop was attempted.
    ///
    /// Share daemons always go. The monitor socket and the process handle
    /// are removed only once the hypervisor is gone, so a failed stop can
    /// be retried.
    fn finish_stop(
        &self,
        name: &str,
        state: &RunState,
        stopped: Result<StopOutcome>,
    ) -> Result<StopOutcome> {
        for daemon in &state.daemons {
            share::stop_daemon(daemon);
        }

        if state.is_alive() {
            let err = match stopped {
                Err(e) => e,
                Ok(_) => Error::command_failed(
                    "stop",
                    format!("hypervisor process {} is still running", state.pid),
                ),
            };
            tracing::warn!(vm = %name, pid = state.pid, error = %err, "hypervisor still running, keeping its handle");
            return Err(err);
        }

        remove_if_exists(&self.store.layout(name).monitor())?;
        self.store.remove_run_state(name)?;
        let outcome = stopped?;
        if outcome == StopOutcome::Killed {
            tracing::warn!(vm = %name, pid = state.pid, "hypervisor did not stop gracefully, killed");
        }
        tracing::info!(vm = %name, ?outcome, "vm stopped");
        Ok(outcome)
    }

    /// Hot-plug every persisted USB device that is present on the host.
    ///
    /// Returns how many were attached. Failures are logged, never fatal:
    /// the VM is already running.
    fn replay_usb(&self, record: &VmRecord, monitor_path: &Path) -> usize {
        if record.usb_devices.is_empty() {
            return 0;
        }
        if !wait_for_socket(monitor_path, self.settings.monitor_timeout) {
            tracing::warn!(vm = %record.name, "monitor socket did not appear, skipping usb replay");
            return 0;
        }
        let mut monitor = match Monitor::connect(monitor_path, self.settings.monitor_timeout) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(vm = %record.name, error = %e, "cannot reach monitor, skipping usb replay");
                return 0;
            }
        };

        let mut attached = 0;
        for device in &record.usb_devices {
            let host = match self.usb_host.find(device) {
                Ok(Some(host)) => host,
                Ok(None) => {
                    tracing::warn!(vm = %record.name, device = %device, "usb device not present on host, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(vm = %record.name, device = %device, error = %e, "usb enumeration failed");
                    continue;
                }
            };
            match monitor.execute(&usb::device_add_command(device, &host)) {
                Ok(_) => {
                    tracing::info!(vm = %record.name, device = %device, "usb device attached");
                    attached += 1;
                }
                Err(e) => {
                    tracing::warn!(vm = %record.name, device = %device, error = %e, "usb attach failed");
                }
            }
        }
        attached
    }

    // ========================================================================
    // Disk / flags / configuration
    // ========================================================================

    /// Grow the disk of a stopped VM to `new_mib`.
    ///
    /// `force` overrides the lock flag and always asks for confirmation.
    pub fn resize(&self, name: &str, new_mib: u64, force: bool) -> Result<VmRecord> {
        validate_name(name)?;
        validate_disk(new_mib)?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.store.load(name)?;
        if record.locked && !force {
            return Err(Error::vm_locked(name));
        }
        self.ensure_stopped(name, "resizing its disk")?;

        let layout = self.store.layout(name);
        let current = match self.disk.info(&layout.disk()) {
            Ok(info) => info.virtual_size / (1024 * 1024),
            Err(e) => match record.disk_mib {
                Some(mib) => {
                    tracing::warn!(vm = %name, error = %e, "disk info unavailable, using recorded size");
                    mib
                }
                None => return Err(e),
            },
        };
        if new_mib < current {
            return Err(Error::invalid(
                "disk size",
                format!(
                    "shrinking from {} to {} is not supported",
                    crate::size::format_mib(current),
                    crate::size::format_mib(new_mib)
                ),
            ));
        }
        if new_mib == current {
            return Err(Error::invalid(
                "disk size",
                format!("disk is already {}", crate::size::format_mib(current)),
            ));
        }
        if force
            && !self.confirm.confirm(&format!(
                "Resize disk of vm '{}' from {} to {}?",
                name,
                crate::size::format_mib(current),
                crate::size::format_mib(new_mib)
            ))
        {
            return Err(Error::cancelled(format!("resize vm '{}'", name)));
        }

        self.disk.resize(&layout.disk(), new_mib)?;
        record.disk_mib = Some(new_mib);
        self.store.save(&record)?;
        tracing::info!(vm = %name, from_mib = current, to_mib = new_mib, "disk resized");
        Ok(record)
    }

    /// Set the locked flag. Returns `false` if it was already set.
    pub fn lock(&self, name: &str) -> Result<bool> {
        self.set_locked(name, true)
    }

    /// Clear the locked flag. Returns `false` if it was already clear.
    pub fn unlock(&self, name: &str) -> Result<bool> {
        self.set_locked(name, false)
    }

    fn set_locked(&self, name: &str, locked: bool) -> Result<bool> {
        validate_name(name)?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.store.load(name)?;
        if record.locked == locked {
            return Ok(false);
        }
        record.locked = locked;
        self.store.save(&record)?;
        tracing::info!(vm = %name, locked, "lock flag changed");
        Ok(true)
    }

    /// Change hardware or network settings of a stopped, unlocked VM.
    pub fn configure(&self, name: &str, change: &ConfigChange) -> Result<VmRecord> {
        validate_name(name)?;
        if change.is_empty() {
            return Err(Error::invalid("configuration", "no changes requested"));
        }
        if let Some(cores) = change.cores {
            validate_cores(cores)?;
        }
        if let Some(mib) = change.memory_mib {
            validate_memory(mib)?;
        }
        if let Some(machine) = &change.machine {
            validate_machine(machine)?;
        }
        if let Some(cpu) = &change.cpu_model {
            validate_cpu_model(cpu)?;
        }
        if let Some(nic) = &change.nic_model {
            validate_nic_model(nic)?;
        }

        let _vm = self.lock_vm(name)?;
        let mut record = self.load_mutable(name, "changing its configuration")?;

        if let Some(network) = change.network {
            if network != NetworkType::User {
                if !record.port_forwards.is_empty() {
                    return Err(Error::invalid(
                        "network type",
                        format!(
                            "vm '{}' has {} port forward(s); remove them before switching to {} networking",
                            name,
                            record.port_forwards.len(),
                            network
                        ),
                    ));
                }
                if record
                    .shared_folders
                    .iter()
                    .any(|s| s.transport == ShareTransport::Smb)
                {
                    return Err(Error::invalid(
                        "network type",
                        "smb shared folders require user networking",
                    ));
                }
                record.port_forwarding = false;
            }
            record.network = network;
        }
        if let Some(cores) = change.cores {
            record.cores = cores;
        }
        if let Some(mib) = change.memory_mib {
            record.memory_mib = mib;
        }
        if let Some(machine) = &change.machine {
            record.machine = machine.clone();
        }
        if let Some(cpu) = &change.cpu_model {
            record.cpu_model = Some(cpu.clone());
        }
        if let Some(nic) = &change.nic_model {
            record.nic_model = Some(nic.clone());
        }
        if let Some(os_type) = change.os_type {
            record.os_type = os_type;
        }

        self.store.save(&record)?;
        tracing::info!(vm = %name, "configuration updated");
        Ok(record)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Record, observed state and disk sizes of `name`.
    pub fn status(&self, name: &str) -> Result<VmStatus> {
        let record = self.store.load(name)?;
        let live = self.live_state(name)?;
        let disk = match self.disk.info(&self.store.layout(name).disk()) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(vm = %name, error = %e, "disk info unavailable");
                None
            }
        };
        Ok(match live {
            Some(state) => VmStatus {
                record,
                state: VmState::Running,
                pid: Some(state.pid),
                started_at: state.started_at,
                daemons: state.daemons,
                disk,
            },
            None => VmStatus {
                record,
                state: VmState::Stopped,
                pid: None,
                started_at: None,
                daemons: Vec::new(),
                disk,
            },
        })
    }

    /// Summaries of every VM in id order.
    pub fn list(&self) -> Result<Vec<VmSummary>> {
        Ok(self
            .registry
            .records()?
            .into_iter()
            .map(|record| {
                let state = match self.live_state(&record.name) {
                    Ok(Some(_)) => VmState::Running,
                    Ok(None) => VmState::Stopped,
                    Err(e) => {
                        tracing::warn!(vm = %record.name, error = %e, "unreadable process handle");
                        VmState::Stopped
                    }
                };
                VmSummary {
                    id: record.id.unwrap_or_default(),
                    name: record.name,
                    state,
                    cores: record.cores,
                    memory_mib: record.memory_mib,
                    disk_mib: record.disk_mib,
                    network: record.network,
                    ports: record.port_forwards.len(),
                    locked: record.locked,
                }
            })
            .collect())
    }

    // ========================================================================
    // Port forwards
    // ========================================================================

    /// Add a forwarding rule. Returns `false` if the identical rule already existed.
    pub fn port_add(&self, name: &str, rule: PortForward) -> Result<bool> {
        validate_name(name)?;
        let _global = self.lock_global()?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.load_mutable(name, "adding a port forward")?;

        let taken = self.registry.rescan()?.forwards();
        if ports::plan_add(&record, &rule, &taken)? == AddPlan::AlreadyPresent {
            tracing::debug!(vm = %name, %rule, "port forward already present");
            return Ok(false);
        }
        if self.settings.check_host_ports {
            ports::probe_host(rule.host_port, rule.protocol)?;
        }

        record.port_forwards.push(rule);
        record.port_forwarding = true;
        self.store.save(&record)?;
        self.registry.invalidate();
        tracing::info!(vm = %name, %rule, "port forward added");
        Ok(true)
    }

    /// Remove the rule for `(host_port, protocol)`.
    pub fn port_remove(&self, name: &str, host_port: u16, protocol: Protocol) -> Result<PortForward> {
        validate_name(name)?;
        let _global = self.lock_global()?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.load_mutable(name, "removing a port forward")?;
        let rule = ports::remove(&mut record, host_port, protocol)?;
        self.store.save(&record)?;
        self.registry.invalidate();
        tracing::info!(vm = %name, %rule, "port forward removed");
        Ok(rule)
    }

    /// Rules of one VM, or of every VM.
    pub fn port_list(&self, name: Option<&str>) -> Result<Vec<OwnedForward>> {
        match name {
            Some(name) => Ok(ports::all_forwards(&[self.store.load(name)?])),
            None => Ok(ports::all_forwards(&self.registry.refresh()?)),
        }
    }

    // ========================================================================
    // Shared folders
    // ========================================================================

    /// Share `host_path` with the VM.
    pub fn share_add(
        &self,
        name: &str,
        host_path: &Path,
        tag: Option<&str>,
        transport: ShareTransport,
    ) -> Result<SharedFolder> {
        validate_name(name)?;
        let host_path = share::validate_host_path(host_path)?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.load_mutable(name, "adding a shared folder")?;
        let folder = share::plan_add(
            &record,
            host_path,
            tag,
            transport,
            self.settings.max_shared_folders,
        )?;
        record.shared_folders.push(folder.clone());
        self.store.save(&record)?;
        tracing::info!(vm = %name, tag = %folder.tag, path = %folder.host_path.display(), "shared folder added");
        Ok(folder)
    }

    /// Remove the shared folder with mount tag `tag`.
    pub fn share_remove(&self, name: &str, tag: &str) -> Result<SharedFolder> {
        validate_name(name)?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.load_mutable(name, "removing a shared folder")?;
        let pos = record
            .shared_folders
            .iter()
            .position(|s| s.tag == tag)
            .ok_or_else(|| Error::item_not_found("shared folder", name, tag))?;
        let folder = record.shared_folders.remove(pos);
        self.store.save(&record)?;
        tracing::info!(vm = %name, tag, "shared folder removed");
        Ok(folder)
    }

    /// Shared folders of `name`.
    pub fn share_list(&self, name: &str) -> Result<Vec<SharedFolder>> {
        Ok(self.store.load(name)?.shared_folders)
    }

    // ========================================================================
    // USB
    // ========================================================================

    /// Attach a device: hot-plug when running, persist when stopped.
    pub fn usb_attach(&self, name: &str, device: &UsbDevice) -> Result<UsbTarget> {
        validate_name(name)?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.store.load(name)?;

        if let Some(state) = self.live_state(name)? {
            let host = self.usb_host.find(device)?.ok_or_else(|| {
                Error::invalid("usb device", format!("{} is not present on the host", device))
            })?;
            let mut monitor = Monitor::connect(&state.monitor, self.settings.monitor_timeout)?;
            monitor.execute(&usb::device_add_command(device, &host))?;
            tracing::info!(vm = %name, %device, "usb device hot-plugged");
            return Ok(UsbTarget::Live);
        }

        if record.locked {
            return Err(Error::vm_locked(name));
        }
        if record.usb_devices.contains(device) {
            return Err(Error::duplicate("usb device", name, device.to_string()));
        }
        record.usb_devices.push(device.clone());
        self.store.save(&record)?;
        tracing::info!(vm = %name, %device, "usb device persisted");
        Ok(UsbTarget::Persisted)
    }

    /// Detach a device: unplug when running, drop from the record when stopped.
    pub fn usb_detach(&self, name: &str, device: &UsbDevice) -> Result<UsbTarget> {
        validate_name(name)?;
        let _vm = self.lock_vm(name)?;
        let mut record = self.store.load(name)?;

        if let Some(state) = self.live_state(name)? {
            let mut monitor = Monitor::connect(&state.monitor, self.settings.monitor_timeout)?;
            monitor.execute(&usb::device_del_command(device))?;
            tracing::info!(vm = %name, %device, "usb device unplugged");
            return Ok(UsbTarget::Live);
        }

        if record.locked {
            return Err(Error::vm_locked(name));
        }
        let pos = record
            .usb_devices
            .iter()
            .position(|d| d == device)
            .ok_or_else(|| Error::item_not_found("usb device", name, device.to_string()))?;
        record.usb_devices.remove(pos);
        self.store.save(&record)?;
        tracing::info!(vm = %name, %device, "usb device removed from record");
        Ok(UsbTarget::Persisted)
    }

    /// Persisted USB devices of `name`.
    pub fn usb_list(&self, name: &str) -> Result<Vec<UsbDevice>> {
        Ok(self.store.load(name)?.usb_devices)
    }

    /// USB devices currently attached to the host.
    pub fn usb_list_host(&self) -> Result<Vec<HostUsbDevice>> {
        self.usb_host.devices()
    }
}

// ============================================================================
// Rollback guards
// ============================================================================

/// Removes a half-created VM directory unless committed.
struct CreateRollback {
    dir: PathBuf,
    armed: bool,
}

impl CreateRollback {
    /// Create the VM directory (0700) and arm the guard.
    fn new(layout: &VmLayout) -> Result<Self> {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().mode(0o700).create(layout.dir())?;
        Ok(Self {
            dir: layout.dir().to_path_buf(),
            armed: true,
        })
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for CreateRollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(dir = %self.dir.display(), "rolling back partial create");
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove partial vm directory");
        }
    }
}

/// Tears down a launch that did not get past the launch check.
struct LaunchRollback<'a> {
    store: &'a Store,
    layout: &'a VmLayout,
    name: &'a str,
    daemons: Vec<DaemonHandle>,
    hypervisor: Option<process::Spawned>,
    armed: bool,
}

impl LaunchRollback<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for LaunchRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(vm = %self.name, "rolling back failed launch");
        if let Some(spawned) = self.hypervisor {
            if let Err(e) = process::stop_process(spawned.pid, spawned.start_time, Duration::ZERO, true) {
                tracing::warn!(vm = %self.name, pid = spawned.pid, error = %e, "failed to kill hypervisor");
            }
        }
        for daemon in &self.daemons {
            share::stop_daemon(daemon);
        }
        let _ = fs::remove_file(self.layout.monitor());
        if let Err(e) = self.store.remove_run_state(self.name) {
            tracing::warn!(vm = %self.name, error = %e, "failed to remove process handle");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn display_available() -> bool {
    ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()))
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

fn mac_seed(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}-{}", name, nanos, std::process::id())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        if Instant::now() >= deadline || process::interrupted() {
            return false;
        }
        std::thread::sleep(MONITOR_POLL_INTERVAL);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::tests::fake_monitor;
    use crate::usb::tests::plant_device;
    use tempfile::TempDir;

    /// Disk tool stand-in: `create` writes an empty file, `info` reports 4 GiB.
    fn fake_disk_tool() -> Vec<String> {
        let script = r#"
            case "$1" in
              create) : > "$4" ;;
              resize) ;;
              info) echo '{"virtual-size": 4294967296, "actual-size": 200704}' ;;
            esac
        "#;
        vec!["sh".into(), "-c".into(), script.into(), "qemu-img".into()]
    }

    fn controller(tmp: &TempDir) -> Controller {
        let settings = Settings {
            vm_dir: tmp.path().join("vms"),
            disk_tool: fake_disk_tool(),
            hypervisor: vec!["sh".into(), "-c".into(), "exec sleep 30".into(), "qemu".into()],
            usb_sysfs: tmp.path().join("sys"),
            lock_timeout: Duration::from_secs(2),
            launch_check: Duration::from_millis(200),
            monitor_timeout: Duration::from_secs(2),
            ..Settings::default()
        };
        Controller::new(settings).with_confirm(AutoConfirm(true))
    }

    fn spec() -> CreateSpec {
        CreateSpec {
            disk_mib: Some(4096),
            ..CreateSpec::default()
        }
    }

    #[test]
    fn test_create_assigns_ids_and_mac() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller(&tmp);
        let a = ctl.create("a", &spec()).unwrap();
        let b = ctl.create("b", &spec()).unwrap();
        assert_eq!(a.id, Some(1));
        assert_eq!(b.id, Some(2));
        assert!(a.mac.as_deref().unwrap().starts_with("52:54:00:"));
        assert_ne!(a.mac, b.mac);
        assert!(a.created_at.as_deref().unwrap().ends_with('Z'));
        assert_eq!(a.cores, crate::config::DEFAULT_CORES);
    }

    #[test]
    fn test_create_rejects_out_of_range_before_side_effects() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller(&tmp);
        let bad = CreateSpec {
            cores: Some(65),
            ..spec()
        };
        assert!(matches!(ctl.create("a", &bad), Err(Error::InvalidArgument { .. })));
        assert!(!tmp.path().join("vms/a").exists());
    }

    #[test]
    fn test_lock_and_unlock_report_changes() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller(&tmp);
        ctl.create("a", &spec()).unwrap();
        assert!(ctl.lock("a").unwrap());
        assert!(!ctl.lock("a").unwrap());
        assert!(matches!(
            ctl.configure("a", &ConfigChange { cores: Some(4), ..Default::default() }),
            Err(Error::VmLocked { .. })
        ));
        assert!(ctl.unlock("a").unwrap());
        assert_eq!(ctl.locks().held_count(), 0);
    }

    #[test]
    fn test_configure_network_switch_rules() {
        let tmp = TempDir::new().unwrap();
        let mut settings = controller(&tmp).settings().clone();
        settings.check_host_ports = false;
        let ctl = Controller::new(settings).with_confirm(AutoConfirm(true));
        ctl.create("a", &spec()).unwrap();
        ctl.port_add("a", "2222:22".parse().unwrap()).unwrap();

        let to_nat = ConfigChange {
            network: Some(NetworkType::Nat),
            ..Default::default()
        };
        assert!(ctl.configure("a", &to_nat).is_err());
        ctl.port_remove("a", 2222, Protocol::Tcp).unwrap();
        let record = ctl.configure("a", &to_nat).unwrap();
        assert_eq!(record.network, NetworkType::Nat);
        assert!(!record.port_forwarding);
        assert!(ctl.configure("a", &ConfigChange::default()).is_err());
    }

    #[test]
    fn test_usb_persist_when_stopped() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller(&tmp);
        ctl.create("a", &spec()).unwrap();
        let dev: UsbDevice = "046d:c52b".parse().unwrap();

        assert_eq!(ctl.usb_attach("a", &dev).unwrap(), UsbTarget::Persisted);
        assert!(matches!(ctl.usb_attach("a", &dev), Err(Error::Duplicate { .. })));
        assert_eq!(ctl.usb_list("a").unwrap(), vec![dev.clone()]);
        assert_eq!(ctl.usb_detach("a", &dev).unwrap(), UsbTarget::Persisted);
        assert!(matches!(ctl.usb_detach("a", &dev), Err(Error::ItemNotFound { .. })));
    }

    #[test]
    fn test_replay_usb_skips_absent_devices() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller(&tmp);
        plant_device(&tmp.path().join("sys"), "1-2", "046d", "c52b", None, 1, 4);

        let mut record = VmRecord::new("a", 1, 512, "pc");
        record.usb_devices = vec![
            "046d:c52b".parse().unwrap(),
            "0781:5581".parse().unwrap(),
        ];
        let sock = tmp.path().join("monitor.sock");
        let (_h, seen) = fake_monitor(sock.clone(), |_| String::new());

        assert_eq!(ctl.replay_usb(&record, &sock), 1);
        assert_eq!(
            seen.recv().unwrap(),
            "device_add usb-host,bus=xhci.0,vendorid=0x046d,productid=0xc52b,id=usb-046d-c52b"
        );
    }

    #[test]
    fn test_replay_usb_without_monitor_is_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut settings = controller(&tmp).settings().clone();
        settings.monitor_timeout = Duration::from_millis(100);
        let ctl = Controller::new(settings);
        let mut record = VmRecord::new("a", 1, 512, "pc");
        record.usb_devices = vec!["046d:c52b".parse().unwrap()];
        assert_eq!(ctl.replay_usb(&record, &tmp.path().join("absent.sock")), 0);
    }

    #[test]
    fn test_failed_stop_still_stops_share_daemons() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller(&tmp);
        ctl.create("a", &spec()).unwrap();
        let layout = ctl.store.layout("a");
        let sleeper = |argv0: &str| {
            let argv: Vec<String> = vec!["sh".into(), "-c".into(), "exec sleep 30".into(), argv0.into()];
            process::spawn_detached(&argv, None).unwrap()
        };
        let hypervisor = sleeper("qemu");
        let daemon = sleeper("virtiofsd");
        let socket = layout.share_socket("src");
        fs::write(&socket, "").unwrap();
        let state = RunState {
            pid: hypervisor.pid,
            start_time: hypervisor.start_time,
            started_at: None,
            monitor: layout.monitor(),
            daemons: vec![DaemonHandle {
                tag: "src".into(),
                pid: daemon.pid,
                start_time: daemon.start_time,
                socket: socket.clone(),
            }],
        };
        ctl.store.save_run_state("a", &state).unwrap();

        let err = ctl
            .finish_stop("a", &state, Err(Error::interrupted("waiting for process to stop")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!process::is_alive(daemon.pid));
        assert!(!socket.exists());
        assert!(
            ctl.store.load_run_state("a").unwrap().is_some(),
            "handle kept while the hypervisor runs"
        );

        process::kill(hypervisor.pid);
        assert!(process::wait_for_exit(hypervisor.pid, Duration::from_secs(5), "test").unwrap());
        assert_eq!(ctl.stop("a", false).unwrap(), StopOutcome::NotRunning);
        assert!(ctl.store.load_run_state("a").unwrap().is_none());
    }

    #[test]
    fn test_live_usb_attach_through_monitor() {
        let tmp = TempDir::new().unwrap();
        let ctl = controller(&tmp);
        plant_device(&tmp.path().join("sys"), "1-2", "046d", "c52b", Some("X1"), 2, 7);
        ctl.create("a", &spec()).unwrap();
        let state = ctl.start("a", &StartOptions { headless: true }).unwrap();

        let (_h, seen) = fake_monitor(state.monitor.clone(), |_| String::new());
        let dev: UsbDevice = "046d:c52b:X1".parse().unwrap();
        assert_eq!(ctl.usb_attach("a", &dev).unwrap(), UsbTarget::Live);
        assert_eq!(
            seen.recv().unwrap(),
            "device_add usb-host,bus=xhci.0,hostbus=2,hostaddr=7,id=usb-046d-c52b-X1"
        );
        assert!(ctl.usb_list("a").unwrap().is_empty(), "live attach is not persisted");
        assert!(matches!(
            ctl.usb_attach("a", &"dead:beef".parse().unwrap()),
            Err(Error::InvalidArgument { .. })
        ));

        ctl.stop("a", false).unwrap();
    }
}
