//! Firecracker engine driven through firepilot.

mod api;
mod vsock;

use crate::config::{DeviceConfig, NetworkMode};
use crate::engine::{Engine, EngineVm};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use firepilot::builder::drive::DriveBuilder;
use firepilot::builder::executor::FirecrackerExecutorBuilder;
use firepilot::builder::kernel::KernelBuilder;
use firepilot::builder::network_interface::NetworkInterfaceBuilder;
use firepilot::builder::{Builder, Configuration};
use firepilot::machine::Machine;
use serde::{Deserialize, Serialize};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Highest vCPU count Firecracker accepts.
pub const MAX_VCPUS: u32 = 32;

/// Engine-level settings for [`FirecrackerEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    /// Path to Firecracker binary
    pub firecracker_path: PathBuf,
    /// Working directory for VM sockets and state
    pub chroot_path: PathBuf,
    /// Kernel boot arguments
    pub boot_args: String,
    /// Guest CID for vsock, must be > 2
    pub guest_cid: u32,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            chroot_path: PathBuf::from("/tmp/vmbridge"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            guest_cid: 3,
        }
    }
}

impl FirecrackerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // 0, 1, 2 are reserved CIDs
        if self.guest_cid <= 2 {
            return Err(VmError::Config(format!(
                "vsock guest_cid must be > 2, got {}",
                self.guest_cid
            )));
        }
        if self.firecracker_path.as_os_str().is_empty() {
            return Err(VmError::Config("firecracker_path is required".into()));
        }
        Ok(())
    }
}

/// Allocates Firecracker microVMs.
#[derive(Debug, Clone)]
pub struct FirecrackerEngine {
    config: FirecrackerConfig,
}

impl FirecrackerEngine {
    /// Create an engine with the given settings.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid.
    pub fn new(config: FirecrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get the engine settings.
    pub fn config(&self) -> &FirecrackerConfig {
        &self.config
    }

    /// Translate a device description into a firepilot configuration.
    fn build_configuration(&self, id: Uuid, device: &DeviceConfig) -> Result<Configuration> {
        if device.cpu_count > MAX_VCPUS {
            return Err(VmError::Config(format!(
                "firecracker supports at most {MAX_VCPUS} vCPUs, got {}",
                device.cpu_count
            )));
        }

        let kernel = KernelBuilder::new()
            .with_kernel_image_path(device.kernel_path.to_string_lossy().to_string())
            .with_boot_args(self.config.boot_args.clone())
            .try_build()
            .map_err(|e| VmError::Config(format!("kernel config: {:?}", e)))?;

        let executor = FirecrackerExecutorBuilder::new()
            .with_chroot(self.config.chroot_path.to_string_lossy().to_string())
            .with_exec_binary(self.config.firecracker_path.clone())
            .try_build()
            .map_err(|e| VmError::Config(format!("executor config: {:?}", e)))?;

        let mut fp_config = Configuration::new(id.to_string())
            .with_kernel(kernel)
            .with_executor(executor);

        // Without an initramfs the first disk carries the root filesystem.
        let root_index = device.initramfs_path.is_none().then_some(0);

        for (index, disk) in device.disks.iter().enumerate() {
            let mut drive_builder = DriveBuilder::new()
                .with_drive_id(format!("disk{index}"))
                .with_path_on_host(disk.path.clone());

            if root_index == Some(index) {
                drive_builder = drive_builder.as_root_device();
            }
            if disk.read_only {
                drive_builder = drive_builder.as_read_only();
            }

            let drive = drive_builder
                .try_build()
                .map_err(|e| VmError::Config(format!("drive config: {:?}", e)))?;

            fp_config = fp_config.with_drive(drive);
        }

        match device.network.mode {
            NetworkMode::None => {}
            NetworkMode::Bridged => {
                let host_dev = device.network.bridge_interface.clone().ok_or_else(|| {
                    VmError::Config("bridged network requires a host interface".into())
                })?;
                let iface = NetworkInterfaceBuilder::new()
                    .with_iface_id("eth0".to_string())
                    .with_host_dev_name(host_dev)
                    .try_build()
                    .map_err(|e| VmError::Config(format!("network config: {:?}", e)))?;

                fp_config = fp_config.with_interface(iface);
            }
            NetworkMode::Nat => {
                return Err(VmError::Config(
                    "firecracker has no built-in NAT; use bridged mode with a tap device".into(),
                ));
            }
        }

        Ok(fp_config)
    }
}

#[async_trait]
impl Engine for FirecrackerEngine {
    fn name(&self) -> &'static str {
        "firecracker"
    }

    /// Allocate a microVM.
    ///
    /// This will:
    /// 1. Build the firepilot configuration
    /// 2. Spawn the Firecracker process
    /// 3. Configure boot source, machine resources and vsock
    ///
    /// The guest is not booted until [`EngineVm::start`].
    async fn create(&self, device: &DeviceConfig) -> Result<Box<dyn EngineVm>> {
        let id = Uuid::new_v4();
        tracing::info!(%id, "Creating new MicroVM");

        let fp_config = self.build_configuration(id, device)?;

        let mut machine = Machine::new();
        machine
            .create(fp_config)
            .await
            .map_err(|e| VmError::Create(format!("{:?}", e)))?;

        // chroot_path / vm_id holds the API socket and the vsock socket
        let vm_dir = self.config.chroot_path.join(id.to_string());
        let socket_path = vm_dir.join("firecracker.socket");
        let vsock_path = vm_dir.join("v.sock");

        let vm = FirecrackerVm {
            id,
            machine: Mutex::new(machine),
            vm_dir,
            vsock_path,
        };

        // Anything configured after create must happen before start.
        if let Err(e) = vm.configure(&socket_path, device, &self.config).await {
            tracing::error!(%id, error = %e, "MicroVM configuration failed");
            vm.release().await;
            return Err(e);
        }

        tracing::info!(%id, "MicroVM created");
        Ok(Box::new(vm))
    }
}

/// A Firecracker process and its on-disk state.
pub struct FirecrackerVm {
    /// Unique identifier for this VM
    id: Uuid,
    /// Underlying firepilot Machine handle
    machine: Mutex<Machine>,
    /// Per-VM working directory
    vm_dir: PathBuf,
    /// Host side of the vsock device
    vsock_path: PathBuf,
}

impl FirecrackerVm {
    /// Get the unique ID of this VM.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the vsock UDS path.
    pub fn vsock_path(&self) -> &Path {
        &self.vsock_path
    }

    async fn configure(
        &self,
        socket_path: &Path,
        device: &DeviceConfig,
        engine: &FirecrackerConfig,
    ) -> Result<()> {
        if let Some(initrd) = &device.initramfs_path {
            api::configure_boot_source(socket_path, &device.kernel_path, initrd, &engine.boot_args)
                .await?;
        }
        api::configure_machine(socket_path, device.cpu_count, device.memory_mib()).await?;
        api::configure_vsock(socket_path, engine.guest_cid, &self.vsock_path).await
    }
}

#[async_trait]
impl EngineVm for FirecrackerVm {
    async fn start(&self) -> Result<()> {
        tracing::info!(id = %self.id, "Starting VM");

        self.machine
            .lock()
            .await
            .start()
            .await
            .map_err(|e| VmError::Start(format!("{:?}", e)))
    }

    async fn stop(&self) -> Result<()> {
        tracing::info!(id = %self.id, "Stopping VM");

        self.machine
            .lock()
            .await
            .stop()
            .await
            .map_err(|e| VmError::Stop(format!("{:?}", e)))
    }

    async fn connect_vsock(&self, port: u32) -> Result<OwnedFd> {
        vsock::connect(&self.vsock_path, port).await
    }

    async fn release(&self) {
        tracing::info!(id = %self.id, "Releasing VM");

        if let Err(e) = self.machine.lock().await.kill().await {
            tracing::warn!(id = %self.id, error = ?e, "Failed to kill Firecracker process");
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.vm_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    id = %self.id,
                    path = %self.vm_dir.display(),
                    error = %e,
                    "Failed to remove VM directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DeviceConfigBuilder;
    use crate::config::NetworkConfig;

    #[test]
    fn test_default_config() {
        let config = FirecrackerConfig::default();
        assert_eq!(config.guest_cid, 3);
        assert_eq!(config.chroot_path, PathBuf::from("/tmp/vmbridge"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_guest_cid() {
        let config = FirecrackerConfig {
            guest_cid: 2,
            ..Default::default()
        };
        assert!(FirecrackerEngine::new(config).is_err());
    }

    #[test]
    fn test_rejects_nat() {
        let engine = FirecrackerEngine::new(FirecrackerConfig::default()).unwrap();
        let device = DeviceConfigBuilder::new()
            .kernel("/boot/vmlinux")
            .network(NetworkConfig::nat())
            .build();

        let result = engine.build_configuration(Uuid::new_v4(), &device);
        assert!(matches!(result, Err(VmError::Config(_))));
    }

    #[test]
    fn test_rejects_too_many_vcpus() {
        let engine = FirecrackerEngine::new(FirecrackerConfig::default()).unwrap();
        let device = DeviceConfigBuilder::new()
            .kernel("/boot/vmlinux")
            .cpus(MAX_VCPUS + 1)
            .build();

        let result = engine.build_configuration(Uuid::new_v4(), &device);
        assert!(matches!(result, Err(VmError::Config(_))));
    }
}
