//! Host network interface enumeration.
//!
//! Used to validate bridge interface names and to offer bridging choices.
//! Enumeration is a pure query and needs no VM instance.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Root of the Linux network device tree.
const SYSFS_NET: &str = "/sys/class/net";

/// `IFF_UP` from `<net/if.h>`.
const IFF_UP: u32 = 0x1;

/// `ARPHRD_LOOPBACK` from `<net/if_arp.h>`.
const ARPHRD_LOOPBACK: u32 = 772;

/// What kind of device an interface is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Loopback,
    Ethernet,
    Wireless,
    Bridge,
    Tap,
    Virtual,
}

/// One host network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Kernel interface name (e.g. `br0`)
    pub name: String,
    /// Device kind
    pub kind: InterfaceKind,
    /// Hardware address, if the device has one
    pub mac_address: Option<String>,
    /// MTU in bytes
    pub mtu: Option<u32>,
    /// Administrative up flag
    pub is_up: bool,
}

impl InterfaceDescriptor {
    /// Whether a guest NIC can sensibly be attached to this interface.
    pub fn is_bridgeable(&self) -> bool {
        self.kind != InterfaceKind::Loopback
    }
}

/// A source of host interface listings.
pub trait InterfaceSource: Send + Sync + 'static {
    /// Return the current listing.
    fn interfaces(&self) -> io::Result<Vec<InterfaceDescriptor>>;
}

/// Reads interfaces from sysfs.
#[derive(Debug, Clone)]
pub struct SysfsInterfaces {
    root: PathBuf,
}

impl Default for SysfsInterfaces {
    fn default() -> Self {
        Self::new(SYSFS_NET)
    }
}

impl SysfsInterfaces {
    /// Enumerate below `root` instead of `/sys/class/net`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl InterfaceSource for SysfsInterfaces {
    fn interfaces(&self) -> io::Result<Vec<InterfaceDescriptor>> {
        if !cfg!(target_os = "linux") && !self.root.exists() {
            tracing::debug!("Interface enumeration not supported on this host");
            return Ok(Vec::new());
        }
        read_sysfs(&self.root)
    }
}

/// A fixed listing.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<InterfaceDescriptor>);

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<InterfaceDescriptor>> {
        Ok(self.0.clone())
    }
}

/// List the host's network interfaces, sorted by name.
pub fn list_network_interfaces() -> io::Result<Vec<InterfaceDescriptor>> {
    SysfsInterfaces::default().interfaces()
}

/// Serialize a listing for the C interface.
pub fn to_json(interfaces: &[InterfaceDescriptor]) -> String {
    serde_json::to_string(interfaces).unwrap_or_else(|_| "[]".to_string())
}

fn read_sysfs(root: &Path) -> io::Result<Vec<InterfaceDescriptor>> {
    let mut interfaces = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let dir = entry.path();

        match describe(&name, &dir) {
            Ok(descriptor) => interfaces.push(descriptor),
            Err(e) => {
                // Interfaces can disappear while we walk the tree.
                tracing::debug!(interface = %name, error = %e, "Skipping interface");
            }
        }
    }

    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::trace!(count = interfaces.len(), "Enumerated network interfaces");
    Ok(interfaces)
}

fn describe(name: &str, dir: &Path) -> io::Result<InterfaceDescriptor> {
    let flags = read_attr(dir, "flags")?
        .and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok())
        .unwrap_or(0);

    let mac_address = read_attr(dir, "address")?
        .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00");

    let mtu = read_attr(dir, "mtu")?.and_then(|v| v.parse().ok());

    Ok(InterfaceDescriptor {
        name: name.to_string(),
        kind: classify(name, dir)?,
        mac_address,
        mtu,
        is_up: flags & IFF_UP != 0,
    })
}

fn classify(name: &str, dir: &Path) -> io::Result<InterfaceKind> {
    let arp_type = read_attr(dir, "type")?.and_then(|v| v.parse::<u32>().ok());

    let kind = if name == "lo" || arp_type == Some(ARPHRD_LOOPBACK) {
        InterfaceKind::Loopback
    } else if dir.join("bridge").exists() {
        InterfaceKind::Bridge
    } else if dir.join("tun_flags").exists() {
        InterfaceKind::Tap
    } else if dir.join("wireless").exists() || dir.join("phy80211").exists() {
        InterfaceKind::Wireless
    } else if is_virtual(dir) {
        InterfaceKind::Virtual
    } else {
        InterfaceKind::Ethernet
    };
    Ok(kind)
}

/// Physical devices link to a bus device; virtual ones live under
/// `/sys/devices/virtual`.
fn is_virtual(dir: &Path) -> bool {
    match fs::read_link(dir) {
        Ok(target) => target.to_string_lossy().contains("/virtual/"),
        Err(_) => !dir.join("device").exists(),
    }
}

/// Read a sysfs attribute, `None` if it does not exist.
fn read_attr(dir: &Path, attr: &str) -> io::Result<Option<String>> {
    match fs::read_to_string(dir.join(attr)) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        // Some attributes refuse reads while the link is down.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(None),
        Err(e) => Err(e),
    }
}
