//! Process management utilities.
//!
//! Liveness checks with pid-reuse detection, graceful-then-forced stop,
//! detached spawning of long-lived helpers (hypervisor, share daemons) and
//! the process-wide interrupt flag checked by every bounded wait.

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Flag indicating whether the interrupt handler has been installed.
static INTERRUPT_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Set by SIGINT/SIGTERM.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Poll interval while waiting for a process to exit.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for SIGKILL to take effect.
pub const SIGKILL_WAIT: Duration = Duration::from_secs(5);

/// Install SIGINT/SIGTERM handlers that set the interrupt flag.
///
/// Bounded waits observe the flag and return [`Error::Interrupted`], so lock
/// guards and rollback guards release through normal unwinding. A second
/// signal exits immediately with status 130.
///
/// The handler is only installed once; subsequent calls are no-ops.
pub fn install_interrupt_handler() {
    if INTERRUPT_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = interrupt_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                INTERRUPT_HANDLER_INSTALLED.store(false, Ordering::SeqCst);
                tracing::warn!(signal = sig, "failed to install interrupt handler");
                return;
            }
        }
    }
    tracing::debug!("installed interrupt handler");
}

/// Async-signal-safe: only touches an atomic and `_exit`.
extern "C" fn interrupt_handler(_sig: libc::c_int) {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        unsafe { libc::_exit(130) };
    }
}

/// True once SIGINT/SIGTERM has been received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reap `pid` if it is an exited child of this process.
///
/// Returns `Some(exit_code)` only when a child was actually reaped; `None`
/// for running children and for processes that are not our children.
pub fn try_reap(pid: libc::pid_t) -> Option<i32> {
    loop {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

        if result == pid {
            let exit_code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                -1
            };
            return Some(exit_code);
        } else if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            // ECHILD: not our child, liveness comes from kill(0).
            return None;
        } else {
            return None;
        }
    }
}

/// Check if a process is alive.
///
/// Reaps our own exited children first so zombies do not count as alive.
/// A process owned by another user (EPERM) is alive.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    if try_reap(pid).is_some() {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGTERM to a process.
///
/// Returns true if the signal was sent successfully.
pub fn terminate(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Send SIGKILL to a process.
///
/// Returns true if the signal was sent successfully.
pub fn kill(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Get the start time of a process (clock ticks since boot from /proc/pid/stat field 22).
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: libc::pid_t) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm can contain spaces and parentheses, so find the last ')' first.
    let after_comm = stat.rfind(')')? + 2;
    let fields: Vec<&str> = stat.get(after_comm..)?.split_whitespace().collect();
    // After ") ", fields are: state(0) ppid(1) ... starttime(19)
    fields.get(19)?.parse::<u64>().ok()
}

/// Get the start time of a process in microseconds since the epoch.
#[cfg(target_os = "macos")]
pub fn process_start_time(pid: libc::pid_t) -> Option<u64> {
    extern "C" {
        fn proc_pidinfo(
            pid: libc::c_int,
            flavor: libc::c_int,
            arg: u64,
            buffer: *mut libc::c_void,
            buffersize: libc::c_int,
        ) -> libc::c_int;
    }

    const PROC_PIDTBSDINFO: libc::c_int = 3;

    /// Layout of `struct proc_bsdinfo` from <sys/proc_info.h>.
    #[repr(C)]
    struct BsdInfo {
        flags: u32,
        status: u32,
        xstatus: u32,
        pid: u32,
        ppid: u32,
        uid: u32,
        gid: u32,
        ruid: u32,
        rgid: u32,
        svuid: u32,
        svgid: u32,
        rfu_1: u32,
        comm: [u8; 16],
        name: [u8; 32],
        nfiles: u32,
        pgid: u32,
        pjobc: u32,
        e_tdev: u32,
        e_tpgid: u32,
        nice: i32,
        start_tvsec: u64,
        start_tvusec: u64,
    }

    // SAFETY: BsdInfo is plain data; proc_pidinfo writes at most `size` bytes.
    let mut info: BsdInfo = unsafe { std::mem::zeroed() };
    let size = std::mem::size_of::<BsdInfo>() as libc::c_int;
    let written = unsafe {
        proc_pidinfo(
            pid,
            PROC_PIDTBSDINFO,
            0,
            &mut info as *mut BsdInfo as *mut libc::c_void,
            size,
        )
    };
    if written == size {
        Some(info.start_tvsec * 1_000_000 + info.start_tvusec)
    } else {
        None
    }
}

/// Start times are unavailable here, so signal paths refuse to act.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn process_start_time(_pid: libc::pid_t) -> Option<u64> {
    None
}

/// Check if a PID belongs to our process by verifying start time.
///
/// If `expected_start_time` is None (hand-written handle), falls back to a
/// PID-only check. Use [`is_our_process_strict`] before sending signals.
pub fn is_our_process(pid: libc::pid_t, expected_start_time: Option<u64>) -> bool {
    if !is_alive(pid) {
        return false;
    }
    match expected_start_time {
        Some(expected) => process_start_time(pid) == Some(expected),
        None => true,
    }
}

/// Strict version of [`is_our_process`] for signal/kill paths.
///
/// Returns `false` when the start time is missing rather than assuming the
/// PID is ours, so an unrelated process that reused the PID is never signaled.
pub fn is_our_process_strict(pid: libc::pid_t, expected_start_time: Option<u64>) -> bool {
    if !is_alive(pid) {
        return false;
    }
    match expected_start_time {
        Some(expected) => process_start_time(pid) == Some(expected),
        None => {
            tracing::warn!(pid, "refusing to signal process without recorded start time");
            false
        }
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was already gone.
    NotRunning,
    /// The process exited after SIGTERM.
    Exited,
    /// The process was killed with SIGKILL.
    Killed,
}

/// Stop a process.
///
/// 1. Sends SIGTERM (skipped when `force`)
/// 2. Waits up to `timeout` for graceful exit
/// 3. Sends SIGKILL and waits for it to take effect
pub fn stop_process(
    pid: libc::pid_t,
    start_time: Option<u64>,
    timeout: Duration,
    force: bool,
) -> Result<StopOutcome> {
    if !is_our_process_strict(pid, start_time) {
        return Ok(StopOutcome::NotRunning);
    }

    if !force {
        if !terminate(pid) {
            return Ok(StopOutcome::NotRunning);
        }
        if wait_for_exit(pid, timeout, "waiting for process to stop")? {
            return Ok(StopOutcome::Exited);
        }
        tracing::debug!(pid, "SIGTERM timeout, sending SIGKILL");
    }

    kill(pid);
    if wait_for_exit(pid, SIGKILL_WAIT, "waiting for killed process")? {
        Ok(StopOutcome::Killed)
    } else {
        Err(Error::command_failed(
            "kill",
            format!("process {} survived SIGKILL", pid),
        ))
    }
}

/// Poll until `pid` exits. Returns `false` on timeout.
pub fn wait_for_exit(pid: libc::pid_t, timeout: Duration, what: &str) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        if interrupted() {
            return Err(Error::interrupted(what));
        }
        std::thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
    }
}

/// A process started by [`spawn_detached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    /// Process id.
    pub pid: libc::pid_t,
    /// Start time captured right after spawn.
    pub start_time: Option<u64>,
}

/// Spawn `argv` in its own session so it outlives this invocation.
///
/// stdin is `/dev/null`; stdout and stderr append to `log` when given.
pub fn spawn_detached(argv: &[String], log: Option<&Path>) -> Result<Spawned> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::invalid("command", "empty command vector"))?;

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    match log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            cmd.stdout(file.try_clone()?).stderr(file);
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }
    // SAFETY: setsid() is async-signal-safe and valid between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| Error::command_failed(program.as_str(), e.to_string()))?;
    let pid = child.id() as libc::pid_t;
    tracing::debug!(pid, program = %program, "spawned detached process");
    Ok(Spawned {
        pid,
        start_time: process_start_time(pid),
    })
}
