//! The bridge facade: handles in, pending results out.

use crate::error::{BridgeError, Result};
use crate::events::{EventReceiver, Events};
use crate::gateway::Gateway;
use crate::handle::{Handle, Registry};
use crate::host::HostEnvironment;
use crate::instance::{Allocation, Instance, Settled, Ticket};
use crate::netif::InterfaceDescriptor;
use crate::operation::{OperationKind, Pending};
use crate::state::LifecycleState;
use crate::validate::{self, DiskClaims, ValidatedConfig};
use crate::vsock::validate_port;
use chrono::{DateTime, Utc};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use vmbridge_vm::{DeviceConfig, Engine, EngineVm};

/// Snapshot of one live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSummary {
    pub handle: Handle,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
}

/// Drives VM instances through an [`Engine`].
///
/// Every method returns without waiting for the engine. Long operations
/// hand back a [`Pending`] that resolves exactly once, even when the
/// instance is destroyed in the meantime.
///
/// # Thread Safety
///
/// `Bridge` is `Send + Sync`. State queries are lock-free and may be called
/// from any thread while operations are outstanding.
pub struct Bridge {
    engine: Arc<dyn Engine>,
    host: HostEnvironment,
    registry: Registry<Instance>,
    gateway: Gateway,
    events: Events,
    disks: DiskClaims,
}

impl Bridge {
    /// Create a bridge that runs engine calls on `runtime`.
    pub fn new(
        engine: Arc<dyn Engine>,
        host: HostEnvironment,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        tracing::info!(engine = engine.name(), limits = ?host.limits, "Bridge ready");
        Self {
            engine,
            host,
            registry: Registry::new(),
            gateway: Gateway::new(runtime),
            events: Events::default(),
            disks: DiskClaims::default(),
        }
    }

    /// Subscribe to state changes of every instance.
    ///
    /// Only changes applied after this call are delivered.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The runtime operations are executed on.
    pub fn runtime(&self) -> &tokio::runtime::Handle {
        self.gateway.runtime()
    }

    /// Host the bridge validates configurations against.
    pub fn host(&self) -> &HostEnvironment {
        &self.host
    }

    /// Allocate a handle. No engine object exists until [`Bridge::create`].
    pub fn create_handle(&self) -> Handle {
        let handle = self
            .registry
            .insert_with(|handle| Instance::new(handle, self.events.clone()));
        tracing::debug!(%handle, "Handle allocated");
        handle
    }

    fn instance(&self, handle: Handle) -> Result<Arc<Instance>> {
        self.registry
            .get(handle)
            .ok_or(BridgeError::UnknownHandle(handle))
    }

    /// Validate `config` and allocate the engine object in the background.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the handle is unknown, the configuration is
    /// rejected, a writable disk belongs to another instance, or the
    /// instance is not `Uninitialized`.
    pub fn create(&self, handle: Handle, config: DeviceConfig) -> Result<Pending<()>> {
        let instance = self.instance(handle)?;
        let config = validate::validate(&config, &self.host)?;
        let claim = self.disks.claim(&config)?;
        let ticket = instance.begin(OperationKind::Create)?;

        tracing::info!(
            %handle,
            memory_mib = config.memory_mib(),
            cpus = config.cpu_count,
            disks = config.disks.len(),
            network = %config.network.mode,
            "Creating VM"
        );

        let engine = Arc::clone(&self.engine);
        let host = self.host.clone();
        Ok(self.gateway.run(OperationKind::Create, Some(handle), async move {
            let allocated = allocate(engine.as_ref(), &host, &config).await;

            let (vm, disks) = match allocated {
                Ok(allocated) => allocated,
                Err(e) => {
                    tracing::error!(%handle, error = %e, "VM creation failed");
                    return match instance.settle_create(ticket, None) {
                        Settled::Committed(_) => Err(e),
                        Settled::TornDown(_) => Err(BridgeError::Destroyed(OperationKind::Create)),
                    };
                }
            };

            let allocation = Allocation {
                vm: Arc::from(vm),
                config,
                claim,
                created_disks: disks,
            };
            match instance.settle_create(ticket, Some(allocation)) {
                Settled::Committed(_) => {
                    tracing::info!(%handle, "VM created");
                    Ok(())
                }
                Settled::TornDown(teardown) => {
                    teardown.run(handle).await;
                    Err(BridgeError::Destroyed(OperationKind::Create))
                }
            }
        }))
    }

    /// Boot the guest.
    pub fn start(&self, handle: Handle) -> Result<Pending<()>> {
        self.transition(handle, OperationKind::Start)
    }

    /// Stop the guest.
    pub fn stop(&self, handle: Handle) -> Result<Pending<()>> {
        self.transition(handle, OperationKind::Stop)
    }

    fn transition(&self, handle: Handle, kind: OperationKind) -> Result<Pending<()>> {
        let instance = self.instance(handle)?;
        let ticket = instance.begin(kind)?;
        tracing::info!(%handle, op = %kind, "VM transition requested");

        Ok(self.gateway.run(kind, Some(handle), async move {
            let result = drive(&ticket, kind).await;

            match instance.settle(ticket, result.is_ok()) {
                Settled::Committed(state) => {
                    match &result {
                        Ok(()) => {
                            tracing::info!(%handle, %state, "VM transition complete")
                        }
                        Err(e) => {
                            tracing::error!(%handle, op = %kind, error = %e, "VM transition failed")
                        }
                    }
                    result
                }
                Settled::TornDown(teardown) => {
                    teardown.run(handle).await;
                    Err(BridgeError::Destroyed(kind))
                }
            }
        }))
    }

    /// Open a byte stream to `port` inside the guest.
    ///
    /// The descriptor belongs to the caller once delivered.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the instance is not running or the port is
    /// reserved.
    pub fn vsock_connect(&self, handle: Handle, port: u32) -> Result<Pending<OwnedFd>> {
        let instance = self.instance(handle)?;
        let vm = instance.vm_for_connect()?;
        let port = validate_port(port)?;
        tracing::debug!(%handle, port, "Vsock connect requested");

        Ok(self.gateway.run(OperationKind::VsockConnect, Some(handle), async move {
            let connected = vm.connect_vsock(port).await;
            // Teardown may have released the engine object under us.
            if instance.is_torn_down() {
                drop(connected);
                return Err(BridgeError::Destroyed(OperationKind::VsockConnect));
            }
            let fd = connected?;
            tracing::debug!(%handle, port, "Vsock channel open");
            Ok(fd)
        }))
    }

    /// Enumerate host network interfaces. Needs no instance.
    pub fn list_network_interfaces(&self) -> Pending<Vec<InterfaceDescriptor>> {
        let source = Arc::clone(&self.host.interfaces);
        self.gateway.run(OperationKind::ListInterfaces, None, async move {
            let listing = tokio::task::spawn_blocking(move || source.interfaces())
                .await
                .map_err(|_| BridgeError::Abandoned(OperationKind::ListInterfaces))??;
            Ok(listing)
        })
    }

    /// Destroy the instance behind `handle`.
    ///
    /// The handle is dead as soon as this returns. Teardown happens in the
    /// background, or when the outstanding operation settles. Returns
    /// `false` if the handle was unknown.
    pub fn destroy(&self, handle: Handle) -> bool {
        let Some(instance) = self.registry.remove(handle) else {
            tracing::warn!(%handle, "Destroy of unknown handle ignored");
            return false;
        };

        let state = instance.state();
        tracing::info!(%handle, %state, "Destroying VM");
        if let Some(teardown) = instance.mark_torn_down() {
            self.gateway.detach(teardown.run(handle));
        }
        self.events.emit(handle, state, LifecycleState::Invalid);
        true
    }

    /// Destroy every live instance.
    pub fn destroy_all(&self) {
        let handles = self.registry.handles();
        tracing::info!(count = handles.len(), "Destroying all VMs");
        for handle in handles {
            self.destroy(handle);
        }
    }

    /// Current state, `Invalid` for unknown handles. Never blocks.
    pub fn state(&self, handle: Handle) -> LifecycleState {
        self.registry
            .get(handle)
            .map(|instance| instance.state())
            .unwrap_or(LifecycleState::Invalid)
    }

    pub fn can_start(&self, handle: Handle) -> bool {
        self.state(handle).can_start()
    }

    pub fn can_stop(&self, handle: Handle) -> bool {
        self.state(handle).can_stop()
    }

    /// The accepted configuration, once create succeeded.
    pub fn config(&self, handle: Handle) -> Option<ValidatedConfig> {
        self.registry.get(handle)?.config()
    }

    /// Summaries of all live instances.
    pub fn instances(&self) -> Vec<InstanceSummary> {
        self.registry
            .handles()
            .into_iter()
            .filter_map(|handle| self.registry.get(handle))
            .map(|instance| InstanceSummary {
                handle: instance.handle(),
                state: instance.state(),
                created_at: instance.created_at(),
            })
            .collect()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("engine", &self.engine.name())
            .field("instances", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Re-check the host, create missing disks, then ask the engine.
async fn allocate(
    engine: &dyn Engine,
    host: &HostEnvironment,
    config: &ValidatedConfig,
) -> Result<(Box<dyn EngineVm>, Vec<PathBuf>)> {
    config.revalidate(host)?;
    let disks = validate::prepare_disks(config).await?;

    match engine.create(config).await {
        Ok(vm) => Ok((vm, disks)),
        Err(e) => {
            validate::remove_disks(&disks).await;
            Err(e.into())
        }
    }
}

async fn drive(ticket: &Ticket, kind: OperationKind) -> Result<()> {
    let vm = ticket.vm().ok_or(BridgeError::InvalidState {
        operation: kind,
        state: LifecycleState::Uninitialized,
    })?;

    match kind {
        OperationKind::Start => vm.start().await?,
        _ => vm.stop().await?,
    }
    Ok(())
}
