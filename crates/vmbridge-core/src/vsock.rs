//! Vsock Channel Opener.
//!
//! Only the port rules live here; the transport belongs to the engine.

use crate::error::{BridgeError, Result};

/// `VMADDR_PORT_ANY`, the wildcard port.
pub const VMADDR_PORT_ANY: u32 = u32::MAX;

/// Reject ports that cannot name a listening guest service.
pub fn validate_port(port: u32) -> Result<u32> {
    match port {
        0 | VMADDR_PORT_ANY => Err(BridgeError::InvalidPort(port)),
        port => Ok(port),
    }
}
