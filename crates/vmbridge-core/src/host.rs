//! What the host can offer a guest.

use crate::netif::{InterfaceSource, SysfsInterfaces};
use std::sync::Arc;

/// Resource ceilings a configuration is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    /// Maximum vCPU count
    pub max_cpus: u32,
    /// Maximum guest memory in bytes, `None` if unknown
    pub max_memory_bytes: Option<u64>,
}

impl HostLimits {
    /// Detect limits of the current host.
    pub fn detect() -> Self {
        let max_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        let max_memory_bytes = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_mem_total(&meminfo));

        tracing::debug!(max_cpus, ?max_memory_bytes, "Detected host limits");
        Self {
            max_cpus,
            max_memory_bytes,
        }
    }
}

/// Parse `MemTotal` (reported in kB) into bytes.
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Everything validation needs to know about the host.
#[derive(Clone)]
pub struct HostEnvironment {
    /// Resource ceilings
    pub limits: HostLimits,
    /// Network interface listing
    pub interfaces: Arc<dyn InterfaceSource>,
}

impl HostEnvironment {
    /// Detect limits and enumerate interfaces from the live host.
    pub fn detect() -> Self {
        Self {
            limits: HostLimits::detect(),
            interfaces: Arc::new(SysfsInterfaces::default()),
        }
    }

    /// Build from explicit parts.
    pub fn new(limits: HostLimits, interfaces: impl InterfaceSource) -> Self {
        Self {
            limits,
            interfaces: Arc::new(interfaces),
        }
    }
}

impl std::fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
