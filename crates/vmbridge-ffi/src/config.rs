//! Configuration for the process-global bridge.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::PathBuf;
use vmbridge_vm::FirecrackerConfig;

/// Configuration for the C interface's bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,

    /// Working directory for VM sockets and state.
    pub chroot_path: PathBuf,

    /// Kernel command line passed to every guest.
    pub boot_args: String,

    /// Guest vsock CID (must be > 2).
    pub guest_cid: u32,

    /// Runtime worker threads (default: 2).
    pub worker_threads: usize,

    /// Default tracing directive when `RUST_LOG` is unset.
    pub log_directive: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let engine = FirecrackerConfig::default();
        Self {
            firecracker_path: engine.firecracker_path,
            chroot_path: engine.chroot_path,
            boot_args: engine.boot_args,
            guest_cid: engine.guest_cid,
            worker_threads: 2,
            log_directive: "vmbridge=info,vm_bridge=info".into(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `VMBRIDGE_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `VMBRIDGE_CHROOT` | `/tmp/vmbridge` |
    /// | `VMBRIDGE_BOOT_ARGS` | `console=ttyS0 reboot=k panic=1 pci=off` |
    /// | `VMBRIDGE_GUEST_CID` | `3` |
    /// | `VMBRIDGE_WORKER_THREADS` | `2` |
    /// | `VMBRIDGE_LOG` | `vmbridge=info,vm_bridge=info` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            firecracker_path: std::env::var("VMBRIDGE_FIRECRACKER")
                .map(PathBuf::from)
                .unwrap_or(default.firecracker_path),
            chroot_path: std::env::var("VMBRIDGE_CHROOT")
                .map(PathBuf::from)
                .unwrap_or(default.chroot_path),
            boot_args: std::env::var("VMBRIDGE_BOOT_ARGS").unwrap_or(default.boot_args),
            guest_cid: std::env::var("VMBRIDGE_GUEST_CID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.guest_cid),
            worker_threads: std::env::var("VMBRIDGE_WORKER_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(default.worker_threads),
            log_directive: std::env::var("VMBRIDGE_LOG").unwrap_or(default.log_directive),
        }
    }

    /// Engine settings derived from this configuration.
    pub fn engine(&self) -> FirecrackerConfig {
        FirecrackerConfig {
            firecracker_path: self.firecracker_path.clone(),
            chroot_path: self.chroot_path.clone(),
            boot_args: self.boot_args.clone(),
            guest_cid: self.guest_cid,
        }
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// The bridge stays usable for interface listing and validation without
    /// a Firecracker install.
    pub fn validate_warn(&self) {
        if !self.firecracker_path.exists() {
            tracing::warn!("Firecracker not found: {:?}", self.firecracker_path);
        }

        if let Some(parent) = self.chroot_path.parent() {
            if !parent.exists() {
                tracing::warn!("Chroot parent directory not found: {:?}", parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(
            config.firecracker_path,
            PathBuf::from("/usr/local/bin/firecracker")
        );
        assert_eq!(config.chroot_path, PathBuf::from("/tmp/vmbridge"));
        assert_eq!(config.guest_cid, 3);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.log_directive, "vmbridge=info,vm_bridge=info");
    }

    #[test]
    fn test_engine_config_carries_settings() {
        let config = BridgeConfig {
            guest_cid: 7,
            boot_args: "console=ttyS0".into(),
            ..Default::default()
        };
        let engine = config.engine();
        assert_eq!(engine.guest_cid, 7);
        assert_eq!(engine.boot_args, "console=ttyS0");
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_from_env_uses_defaults() {
        std::env::remove_var("VMBRIDGE_GUEST_CID");
        std::env::remove_var("VMBRIDGE_WORKER_THREADS");

        let config = BridgeConfig::from_env();
        assert_eq!(config.guest_cid, 3);
        assert_eq!(config.worker_threads, 2);
    }
}
