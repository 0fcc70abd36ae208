//! Device configuration validation.
//!
//! Validation is a pure pass: it inspects the filesystem and the host but
//! acquires nothing. Disk images are only created by [`prepare_disks`], which
//! runs as part of the asynchronous create.

use crate::error::{BootFile, ConfigError};
use crate::host::HostEnvironment;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use vmbridge_vm::{DeviceConfig, DiskSpec, NetworkConfig, NetworkMode};

/// A [`DeviceConfig`] that passed validation. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig(Arc<DeviceConfig>);

impl Deref for ValidatedConfig {
    type Target = DeviceConfig;

    fn deref(&self) -> &DeviceConfig {
        &self.0
    }
}

/// Validate `config` against the host.
///
/// Checks run in order and stop at the first failure: boot image, memory
/// and CPU, disks, network.
pub fn validate(
    config: &DeviceConfig,
    host: &HostEnvironment,
) -> Result<ValidatedConfig, ConfigError> {
    check_boot_file(&config.kernel_path, BootFile::Kernel)?;
    if let Some(initramfs) = &config.initramfs_path {
        check_boot_file(initramfs, BootFile::Initramfs)?;
    }

    check_resources(config, host)?;

    let mut seen = HashSet::new();
    for (index, disk) in config.disks.iter().enumerate() {
        if !seen.insert(&disk.path) {
            return Err(ConfigError::DuplicateDisk {
                index,
                path: disk.path.clone(),
            });
        }
        check_disk(index, disk)?;
    }

    check_network(config, host)?;

    Ok(ValidatedConfig(Arc::new(config.clone())))
}

impl ValidatedConfig {
    /// Re-run validation against the live host.
    ///
    /// Used right before resources are acquired; interfaces and files may
    /// have changed since the configuration was accepted.
    pub fn revalidate(&self, host: &HostEnvironment) -> Result<(), ConfigError> {
        validate(&self.0, host).map(|_| ())
    }

    #[cfg(test)]
    pub(crate) fn assume_valid(config: DeviceConfig) -> Self {
        Self(Arc::new(config))
    }
}

/// Build a [`NetworkConfig`] from a mode string and optional interface name.
///
/// `None` and the empty string mean no network.
pub fn parse_network(
    mode: Option<&str>,
    interface: Option<&str>,
) -> Result<NetworkConfig, ConfigError> {
    let mode = mode.unwrap_or_default();
    let mode = NetworkMode::parse(mode)
        .ok_or_else(|| ConfigError::UnknownNetworkMode(mode.to_string()))?;

    Ok(NetworkConfig {
        mode,
        bridge_interface: interface
            .filter(|name| !name.is_empty())
            .map(str::to_string),
    })
}

fn check_boot_file(path: &Path, file: BootFile) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(ConfigError::BootFileNotFound {
            file,
            path: path.to_path_buf(),
        });
    }
    File::open(path)
        .map(drop)
        .map_err(|source| ConfigError::BootFileUnreadable {
            file,
            path: path.to_path_buf(),
            source,
        })
}

fn check_resources(config: &DeviceConfig, host: &HostEnvironment) -> Result<(), ConfigError> {
    if config.memory_bytes == 0 {
        return Err(ConfigError::ZeroMemory);
    }
    if config.cpu_count == 0 {
        return Err(ConfigError::ZeroCpus);
    }
    if config.cpu_count > host.limits.max_cpus {
        return Err(ConfigError::TooManyCpus {
            requested: config.cpu_count,
            limit: host.limits.max_cpus,
        });
    }
    if let Some(limit) = host.limits.max_memory_bytes {
        if config.memory_bytes > limit {
            return Err(ConfigError::TooMuchMemory {
                requested: config.memory_bytes,
                limit,
            });
        }
    }
    Ok(())
}

fn check_disk(index: usize, disk: &DiskSpec) -> Result<(), ConfigError> {
    let path = &disk.path;

    if path.exists() {
        return OpenOptions::new()
            .read(true)
            .write(!disk.read_only)
            .open(path)
            .map(drop)
            .map_err(|source| ConfigError::DiskUnusable {
                index,
                path: path.clone(),
                read_only: disk.read_only,
                source,
            });
    }

    if disk.read_only {
        return Err(ConfigError::DiskNotFound {
            index,
            path: path.clone(),
        });
    }

    if !parent_dir(path).is_dir() {
        return Err(ConfigError::DiskParentMissing {
            index,
            path: path.clone(),
        });
    }
    if disk.size_bytes == 0 {
        return Err(ConfigError::DiskSizeRequired {
            index,
            path: path.clone(),
        });
    }
    Ok(())
}

fn check_network(config: &DeviceConfig, host: &HostEnvironment) -> Result<(), ConfigError> {
    if config.network.mode != NetworkMode::Bridged {
        return Ok(());
    }

    let name = config
        .network
        .bridge_interface
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or(ConfigError::BridgeInterfaceRequired)?;

    let interfaces = host
        .interfaces
        .interfaces()
        .map_err(ConfigError::Enumeration)?;

    if interfaces
        .iter()
        .any(|iface| iface.name == name && iface.is_bridgeable())
    {
        Ok(())
    } else {
        Err(ConfigError::BridgeInterfaceNotFound(name.to_string()))
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Create missing writable disk images as sparse files.
///
/// An image that already exists, or appears while this runs, is left as is.
/// Returns the paths that were created so a failed create can remove them.
pub(crate) async fn prepare_disks(config: &DeviceConfig) -> Result<Vec<PathBuf>, ConfigError> {
    let mut created = Vec::new();

    for (index, disk) in config.disks.iter().enumerate() {
        if disk.read_only {
            continue;
        }

        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&disk.path)
            .await;

        let result = match opened {
            Ok(file) => {
                created.push(disk.path.clone());
                file.set_len(disk.size_bytes).await
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    index,
                    path = %disk.path.display(),
                    size_bytes = disk.size_bytes,
                    "Created disk image"
                );
            }
            Err(source) => {
                remove_disks(&created).await;
                return Err(ConfigError::DiskCreate {
                    index,
                    path: disk.path.clone(),
                    source,
                });
            }
        }
    }

    Ok(created)
}

/// Best-effort removal of disk images created by [`prepare_disks`].
pub(crate) async fn remove_disks(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove disk image");
        }
    }
}

/// Writable disk images attached to live instances.
///
/// Two instances never hold the same writable path, so one instance's
/// cleanup cannot remove an image another is booting from.
#[derive(Debug, Clone, Default)]
pub(crate) struct DiskClaims(Arc<Mutex<HashSet<PathBuf>>>);

impl DiskClaims {
    /// Claim every writable disk of `config`, or none of them.
    pub(crate) fn claim(&self, config: &DeviceConfig) -> Result<DiskClaim, ConfigError> {
        let mut held = self.0.lock().unwrap_or_else(PoisonError::into_inner);

        for (index, disk) in config.disks.iter().enumerate() {
            if !disk.read_only && held.contains(&disk.path) {
                return Err(ConfigError::DiskInUse {
                    index,
                    path: disk.path.clone(),
                });
            }
        }

        let paths: Vec<PathBuf> = config
            .disks
            .iter()
            .filter(|disk| !disk.read_only)
            .map(|disk| disk.path.clone())
            .collect();
        held.extend(paths.iter().cloned());

        Ok(DiskClaim {
            claims: self.clone(),
            paths,
        })
    }

    #[cfg(test)]
    fn is_claimed(&self, path: &Path) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }
}

/// Writable paths held by one instance; released on drop.
#[derive(Debug)]
pub(crate) struct DiskClaim {
    claims: DiskClaims,
    paths: Vec<PathBuf>,
}

impl Drop for DiskClaim {
    fn drop(&mut self) {
        let mut held = self.claims.0.lock().unwrap_or_else(PoisonError::into_inner);
        for path in &self.paths {
            held.remove(path);
        }
    }
}
