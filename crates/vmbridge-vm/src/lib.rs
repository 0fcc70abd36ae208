//! # vmbridge-vm
//!
//! Virtualization engine layer for vmbridge.
//!
//! The bridge never talks to a hypervisor directly: it calls an [`Engine`] to
//! allocate an [`EngineVm`] from an accepted [`DeviceConfig`], and drives that
//! object's lifecycle. This crate defines the seam and ships a Firecracker
//! implementation built on firepilot.
//!
//! ## Quick Start
//!
//! ```no_run
//! use vmbridge_vm::{DeviceConfigBuilder, Engine, FirecrackerConfig, FirecrackerEngine};
//!
//! # async fn example() -> vmbridge_vm::Result<()> {
//! let engine = FirecrackerEngine::new(FirecrackerConfig::default())?;
//!
//! let config = DeviceConfigBuilder::new()
//!     .kernel("/path/to/vmlinux")
//!     .initramfs("/path/to/initrd.img")
//!     .memory_mib(512)
//!     .cpus(2)
//!     .build();
//!
//! let vm = engine.create(&config).await?;
//! vm.start().await?;
//! let fd = vm.connect_vsock(1024).await?;
//! drop(fd);
//! vm.stop().await?;
//! vm.release().await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod engine;
mod error;
mod firecracker;

pub use builder::DeviceConfigBuilder;
pub use config::{DeviceConfig, DiskSpec, NetworkConfig, NetworkMode, MIB};
pub use engine::{Engine, EngineVm};
pub use error::{Result, VmError};
pub use firecracker::{FirecrackerConfig, FirecrackerEngine, FirecrackerVm, MAX_VCPUS};
