//! Builder pattern for ergonomic DeviceConfig construction.

use crate::config::{DeviceConfig, DiskSpec, NetworkConfig, MIB};
use std::path::PathBuf;

/// Fluent builder for [`DeviceConfig`].
///
/// # Example
///
/// ```
/// use vmbridge_vm::DeviceConfigBuilder;
///
/// let config = DeviceConfigBuilder::new()
///     .kernel("/path/to/vmlinux")
///     .initramfs("/path/to/initrd.img")
///     .memory_mib(512)
///     .cpus(2)
///     .writable_disk("/path/to/data.img", 1 << 30)
///     .bridged("br0")
///     .build();
///
/// assert_eq!(config.cpu_count, 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DeviceConfigBuilder {
    config: DeviceConfig,
}

impl DeviceConfigBuilder {
    /// Create a new builder with default resources and no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path to the kernel image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the path to the initramfs.
    pub fn initramfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.initramfs_path = Some(path.into());
        self
    }

    /// Set guest memory in bytes.
    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.config.memory_bytes = bytes;
        self
    }

    /// Set guest memory in MiB.
    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.config.memory_bytes = mib * MIB;
        self
    }

    /// Set the number of virtual CPUs.
    pub fn cpus(mut self, count: u32) -> Self {
        self.config.cpu_count = count;
        self
    }

    /// Append a disk.
    pub fn disk(mut self, disk: DiskSpec) -> Self {
        self.config.disks.push(disk);
        self
    }

    /// Append a writable disk, created with `size_bytes` if missing.
    pub fn writable_disk(self, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        self.disk(DiskSpec::writable(path, size_bytes))
    }

    /// Append a read-only disk.
    pub fn read_only_disk(self, path: impl Into<PathBuf>) -> Self {
        self.disk(DiskSpec::read_only(path))
    }

    /// Attach the guest NIC to a host interface.
    pub fn bridged(mut self, interface: impl Into<String>) -> Self {
        self.config.network = NetworkConfig::bridged(interface);
        self
    }

    /// Set the network configuration.
    pub fn network(mut self, network: NetworkConfig) -> Self {
        self.config.network = network;
        self
    }

    /// Return the configuration. Validation happens when it is submitted.
    pub fn build(self) -> DeviceConfig {
        self.config
    }
}
