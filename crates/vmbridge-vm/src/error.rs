//! Error types for vmbridge-vm.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors reported by a virtualization engine.
#[derive(Debug, Error)]
pub enum VmError {
    /// Failed to allocate the engine object
    #[error("failed to create VM: {0}")]
    Create(String),

    /// Failed to start the VM
    #[error("failed to start VM: {0}")]
    Start(String),

    /// Failed to stop the VM
    #[error("failed to stop VM: {0}")]
    Stop(String),

    /// The engine cannot express the requested configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Firecracker/firepilot error
    #[error("firepilot error: {0}")]
    Firepilot(String),

    /// vsock transport error
    #[error("vsock error: {0}")]
    Vsock(String),

    /// Nothing in the guest accepted the connection
    #[error("guest refused vsock connection on port {port}: {reason}")]
    ConnectionRefused { port: u32, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
