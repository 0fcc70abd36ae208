//! Error types for vmbridge-core.

use crate::handle::Handle;
use crate::operation::OperationKind;
use crate::state::LifecycleState;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vmbridge-core operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Which boot file a configuration error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootFile {
    Kernel,
    Initramfs,
}

impl fmt::Display for BootFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootFile::Kernel => write!(f, "kernel"),
            BootFile::Initramfs => write!(f, "initramfs"),
        }
    }
}

/// A device configuration was rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{file} not found: {path:?}")]
    BootFileNotFound { file: BootFile, path: PathBuf },

    #[error("{file} is not readable: {path:?}: {source}")]
    BootFileUnreadable {
        file: BootFile,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("memory_bytes must be > 0")]
    ZeroMemory,

    #[error("cpu_count must be > 0")]
    ZeroCpus,

    #[error("cpu_count {requested} exceeds host limit of {limit}")]
    TooManyCpus { requested: u32, limit: u32 },

    #[error("memory_bytes {requested} exceeds host memory of {limit} bytes")]
    TooMuchMemory { requested: u64, limit: u64 },

    #[error("disk {index}: read-only image not found: {path:?}")]
    DiskNotFound { index: usize, path: PathBuf },

    #[error("disk {index}: cannot open {path:?} (read_only={read_only}): {source}")]
    DiskUnusable {
        index: usize,
        path: PathBuf,
        read_only: bool,
        source: std::io::Error,
    },

    #[error("disk {index}: parent directory of {path:?} does not exist")]
    DiskParentMissing { index: usize, path: PathBuf },

    #[error("disk {index}: size_bytes must be > 0 to create {path:?}")]
    DiskSizeRequired { index: usize, path: PathBuf },

    #[error("disk {index}: {path:?} is listed more than once")]
    DuplicateDisk { index: usize, path: PathBuf },

    #[error("disk {index}: {path:?} is attached writable to another VM")]
    DiskInUse { index: usize, path: PathBuf },

    #[error("disk {index}: failed to create {path:?}: {source}")]
    DiskCreate {
        index: usize,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unknown network mode: {0:?}")]
    UnknownNetworkMode(String),

    #[error("bridged network requires a bridge interface name")]
    BridgeInterfaceRequired,

    #[error("bridge interface not found on host: {0}")]
    BridgeInterfaceNotFound(String),

    #[error("failed to enumerate host network interfaces: {0}")]
    Enumeration(#[source] std::io::Error),

    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },
}

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad paths, resource values or bridge interface
    Configuration,
    /// Operation not permitted in the current state
    State,
    /// The engine or transport failed
    Engine,
    /// Unknown or destroyed handle
    Handle,
}

/// Errors that can occur during bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation not permitted in the current lifecycle state
    #[error("cannot {operation} VM in state {state}")]
    InvalidState {
        operation: OperationKind,
        state: LifecycleState,
    },

    /// Another operation holds the instance
    #[error("cannot {requested}: {outstanding} already in progress")]
    Busy {
        requested: OperationKind,
        outstanding: OperationKind,
    },

    /// Port 0 and the wildcard port cannot be connected to
    #[error("invalid vsock port: {0}")]
    InvalidPort(u32),

    /// Error from the virtualization engine
    #[error("engine error: {0}")]
    Engine(#[from] vmbridge_vm::VmError),

    /// Unknown or destroyed handle
    #[error("unknown or destroyed handle: {0}")]
    UnknownHandle(Handle),

    /// The instance was destroyed while the operation was in flight
    #[error("VM was destroyed while {0} was in flight")]
    Destroyed(OperationKind),

    /// The worker executing the operation went away without reporting
    #[error("{0} was abandoned before completing")]
    Abandoned(OperationKind),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Map onto the error taxonomy exposed to callers.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::InvalidState { .. } | Self::Busy { .. } | Self::InvalidPort(_) => {
                ErrorCategory::State
            }
            Self::UnknownHandle(_) => ErrorCategory::Handle,
            Self::Engine(_) | Self::Destroyed(_) | Self::Abandoned(_) | Self::Io(_) => {
                ErrorCategory::Engine
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            BridgeError::from(ConfigError::ZeroMemory).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            BridgeError::InvalidState {
                operation: OperationKind::Start,
                state: LifecycleState::Running,
            }
            .category(),
            ErrorCategory::State
        );
        assert_eq!(
            BridgeError::Destroyed(OperationKind::Stop).category(),
            ErrorCategory::Engine
        );
    }

    #[test]
    fn test_messages_are_descriptive() {
        let err = BridgeError::Busy {
            requested: OperationKind::Start,
            outstanding: OperationKind::Start,
        };
        assert_eq!(err.to_string(), "cannot start: start already in progress");

        let err = BridgeError::InvalidState {
            operation: OperationKind::Stop,
            state: LifecycleState::Created,
        };
        assert_eq!(err.to_string(), "cannot stop VM in state created");
    }
}
