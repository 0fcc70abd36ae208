//! The virtualization capability the bridge drives.
//!
//! An [`Engine`] allocates engine objects from an accepted [`DeviceConfig`];
//! an [`EngineVm`] is one such object. Implementations may take arbitrarily
//! long in any call and are only ever invoked off the caller's thread.

use crate::config::DeviceConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::os::fd::OwnedFd;

/// Allocates engine objects.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Allocate an engine object for `config` without booting it.
    async fn create(&self, config: &DeviceConfig) -> Result<Box<dyn EngineVm>>;
}

/// One allocated virtual machine.
#[async_trait]
pub trait EngineVm: Send + Sync + 'static {
    /// Boot the guest. Resolves once it is running.
    async fn start(&self) -> Result<()>;

    /// Stop the guest. Resolves once it has stopped.
    async fn stop(&self) -> Result<()>;

    /// Open a byte stream to `port` inside the guest.
    ///
    /// The returned descriptor is owned by the caller.
    async fn connect_vsock(&self, port: u32) -> Result<OwnedFd>;

    /// Release everything the object holds. Best effort, must not fail.
    async fn release(&self);
}
