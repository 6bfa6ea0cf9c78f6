//! Error types for localvm.
//!
//! # Error Message Style Guide
//!
//! All error messages follow a consistent format for clarity and actionability:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: All lowercase (Rust convention for error messages)
//! - **Context**: Include relevant identifiers (VM name, path, port) when available
//! - **Actionability**: Messages should name the blocking condition so the user
//!   knows what to fix (stop the VM, unlock it, pick another port)
//!
//! ## Preferred Patterns
//!
//! ```text
//! "vm not found: web"
//! "vm is locked: web (unlock it first)"
//! "port conflict: 8080/tcp is already forwarded by vm 'v1'"
//! "lock busy: vm 'web' is held by pid 4242, try again later"
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using localvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
///
/// Used by the CLI to pick an exit code and by callers that need to decide
/// whether a failure is worth retrying without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected before any side effect.
    Validation,
    /// The VM is in the wrong state for the operation.
    State,
    /// A lock could not be obtained in time.
    Contention,
    /// An external tool or process failed.
    External,
    /// Persisted state is unreadable or insecure.
    Corruption,
    /// The user declined a confirmation prompt or interrupted the command.
    Cancelled,
    /// Underlying filesystem or OS failure.
    Io,
}

impl ErrorKind {
    /// Process exit code for this class of failure.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Validation => 2,
            ErrorKind::State => 3,
            ErrorKind::Contention => 4,
            ErrorKind::External => 5,
            ErrorKind::Corruption => 6,
            ErrorKind::Cancelled | ErrorKind::Io => 1,
        }
    }
}

/// Errors that can occur in localvm operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// VM name does not match the allowed pattern.
    #[error("invalid vm name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Which rule it broke.
        reason: String,
    },

    /// A user-supplied value is out of range or malformed.
    #[error("invalid {what}: {reason}")]
    InvalidArgument {
        /// What was being parsed (e.g. "port", "memory size").
        what: String,
        /// Why it was rejected.
        reason: String,
    },

    // ========================================================================
    // State Errors
    // ========================================================================
    /// VM not found by name or id.
    #[error("vm not found: {name}")]
    VmNotFound {
        /// Name (or id) that was looked up.
        name: String,
    },

    /// A VM with this name already exists.
    #[error("vm already exists: {name}")]
    VmExists {
        /// The conflicting name.
        name: String,
    },

    /// The VM is locked against modification.
    #[error("vm is locked: {name} (unlock it first)")]
    VmLocked {
        /// Locked VM.
        name: String,
    },

    /// The operation requires a stopped VM.
    #[error("vm is running: {name} (stop it before {operation})")]
    VmRunning {
        /// Running VM.
        name: String,
        /// What the caller tried to do.
        operation: String,
    },

    /// The configured VM count cap has been reached.
    #[error("vm limit reached: {max} vms already exist")]
    VmLimit {
        /// Configured cap.
        max: usize,
    },

    /// `(host_port, protocol)` is already used by a forwarding rule.
    #[error("port conflict: {host_port}/{protocol} is already forwarded by vm '{owner}'")]
    PortConflict {
        /// Host port in conflict.
        host_port: u16,
        /// Protocol in conflict.
        protocol: String,
        /// VM that owns the existing rule.
        owner: String,
    },

    /// A host service outside localvm is listening on the port.
    #[error("port in use: {host_port}/{protocol} is occupied by another host service")]
    PortInUse {
        /// Occupied port.
        host_port: u16,
        /// Protocol probed.
        protocol: String,
    },

    /// A named item (rule, share, device) does not exist on the VM.
    #[error("{what} not found on vm '{name}': {item}")]
    ItemNotFound {
        /// Kind of item ("port forward", "shared folder", "usb device").
        what: String,
        /// VM name.
        name: String,
        /// Item identifier.
        item: String,
    },

    /// A per-VM unique item would be duplicated.
    #[error("duplicate {what} on vm '{name}': {item}")]
    Duplicate {
        /// Kind of item ("mount tag", "host path").
        what: String,
        /// VM name.
        name: String,
        /// Item identifier.
        item: String,
    },

    // ========================================================================
    // Contention Errors
    // ========================================================================
    /// Lock held by another live process past the caller's timeout.
    #[error("lock busy: {scope} is held by pid {owner_pid}, try again later")]
    LockBusy {
        /// Human-readable lock scope.
        scope: String,
        /// Recorded owner pid.
        owner_pid: i32,
    },

    // ========================================================================
    // External Process Errors
    // ========================================================================
    /// External command failed.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Diagnostic output or reason.
        reason: String,
    },

    /// The hypervisor could not be launched or exited during startup.
    #[error("vm launch failed: {name}: {reason}")]
    LaunchFailed {
        /// VM name.
        name: String,
        /// Diagnostic (tail of the hypervisor log when available).
        reason: String,
    },

    /// Shared-folder daemon operation failed.
    #[error("shared folder operation failed: {operation}: {reason}")]
    Share {
        /// The operation that failed (e.g. "start daemon", "validate path").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Control-socket (monitor) operation failed.
    #[error("monitor operation failed: {operation}: {reason}")]
    Monitor {
        /// The operation that failed (e.g. "connect", "device_add").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Disk image not found at expected path.
    #[error("disk not found: {}", path.display())]
    DiskNotFound {
        /// Path to the disk.
        path: PathBuf,
    },

    // ========================================================================
    // Corruption Errors
    // ========================================================================
    /// A persisted record is unreadable, incomplete, or insecure.
    #[error("corrupted record: {}: {reason}", path.display())]
    Corrupted {
        /// File that failed validation.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Settings operation failed.
    #[error("config operation failed: {operation}: {reason}")]
    Config {
        /// The operation that failed (e.g., "load", "parse").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Cancellation
    // ========================================================================
    /// The user declined a confirmation prompt.
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// What was cancelled.
        operation: String,
    },

    /// A termination signal arrived while waiting.
    #[error("operation interrupted: {operation}")]
    Interrupted {
        /// What was interrupted.
        operation: String,
    },

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidName { .. } | Error::InvalidArgument { .. } => ErrorKind::Validation,
            Error::VmNotFound { .. }
            | Error::VmExists { .. }
            | Error::VmLocked { .. }
            | Error::VmRunning { .. }
            | Error::VmLimit { .. }
            | Error::PortConflict { .. }
            | Error::PortInUse { .. }
            | Error::ItemNotFound { .. }
            | Error::Duplicate { .. } => ErrorKind::State,
            Error::LockBusy { .. } => ErrorKind::Contention,
            Error::CommandFailed { .. }
            | Error::LaunchFailed { .. }
            | Error::Share { .. }
            | Error::Monitor { .. }
            | Error::DiskNotFound { .. } => ErrorKind::External,
            Error::Corrupted { .. } => ErrorKind::Corruption,
            Error::Config { .. } => ErrorKind::Validation,
            Error::Cancelled { .. } | Error::Interrupted { .. } => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    // ========================================================================
    // Validation Constructors
    // ========================================================================

    /// Create an invalid name error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what: what.into(),
            reason: reason.into(),
        }
    }

    // ========================================================================
    // State Constructors
    // ========================================================================

    /// Create a VM not found error.
    pub fn vm_not_found(name: impl Into<String>) -> Self {
        Self::VmNotFound { name: name.into() }
    }

    /// Create a VM locked error.
    pub fn vm_locked(name: impl Into<String>) -> Self {
        Self::VmLocked { name: name.into() }
    }

    /// Create a VM running error.
    pub fn vm_running(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::VmRunning {
            name: name.into(),
            operation: operation.into(),
        }
    }

    /// Create an item not found error.
    pub fn item_not_found(
        what: impl Into<String>,
        name: impl Into<String>,
        item: impl Into<String>,
    ) -> Self {
        Self::ItemNotFound {
            what: what.into(),
            name: name.into(),
            item: item.into(),
        }
    }

    /// Create a duplicate item error.
    pub fn duplicate(
        what: impl Into<String>,
        name: impl Into<String>,
        item: impl Into<String>,
    ) -> Self {
        Self::Duplicate {
            what: what.into(),
            name: name.into(),
            item: item.into(),
        }
    }

    // ========================================================================
    // External Constructors
    // ========================================================================

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a launch failed error.
    pub fn launch_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a shared-folder operation error.
    pub fn share(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Share {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a monitor operation error.
    pub fn monitor(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Monitor {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    // ========================================================================
    // Corruption / Config Constructors
    // ========================================================================

    /// Create a corrupted record error.
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a config operation error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a cancelled error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an interrupted error.
    pub fn interrupted(operation: impl Into<String>) -> Self {
        Self::Interrupted {
            operation: operation.into(),
        }
    }
}
