//! Device description handed to a virtualization engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Number of bytes in one MiB.
pub const MIB: u64 = 1024 * 1024;

/// Boot image, resources, disks and network of one VM.
///
/// This is a plain description; host-dependent validation lives in
/// `vmbridge-core`. Engines receive it only after it was accepted there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path to the kernel image
    pub kernel_path: PathBuf,
    /// Path to the initramfs (optional)
    pub initramfs_path: Option<PathBuf>,
    /// Guest memory in bytes
    pub memory_bytes: u64,
    /// Number of virtual CPUs
    pub cpu_count: u32,
    /// Block devices, in guest order
    pub disks: Vec<DiskSpec>,
    /// Network attachment
    pub network: NetworkConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::new(),
            initramfs_path: None,
            memory_bytes: 512 * MIB,
            cpu_count: 2,
            disks: Vec::new(),
            network: NetworkConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Guest memory rounded up to whole MiB.
    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes.div_ceil(MIB)
    }
}

/// A block device backed by a host file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Path to the disk image on the host
    pub path: PathBuf,
    /// Size in bytes, used when a writable image has to be created
    pub size_bytes: u64,
    /// Read-only flag
    pub read_only: bool,
}

impl DiskSpec {
    /// A writable disk of the given size.
    pub fn writable(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            read_only: false,
        }
    }

    /// A read-only disk; the image must already exist.
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size_bytes: 0,
            read_only: true,
        }
    }
}

/// How the guest NIC is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No network device
    #[default]
    None,
    /// Guest NIC attached to a named host interface
    Bridged,
    /// Host-side address translation
    Nat,
}

impl NetworkMode {
    /// Parse from string (case-insensitive). Empty means `None`.
    ///
    /// Returns `None` for unrecognised modes.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "bridged" | "bridge" => Some(Self::Bridged),
            "nat" | "shared" => Some(Self::Nat),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Bridged => write!(f, "bridged"),
            NetworkMode::Nat => write!(f, "nat"),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Attachment mode
    pub mode: NetworkMode,
    /// Host interface name, required when `mode` is bridged
    pub bridge_interface: Option<String>,
}

impl NetworkConfig {
    /// Bridged to the given host interface.
    pub fn bridged(interface: impl Into<String>) -> Self {
        Self {
            mode: NetworkMode::Bridged,
            bridge_interface: Some(interface.into()),
        }
    }

    /// Host NAT.
    pub fn nat() -> Self {
        Self {
            mode: NetworkMode::Nat,
            bridge_interface: None,
        }
    }
}
