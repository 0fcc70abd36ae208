//! # vmbridge-core
//!
//! VM lifecycle and asynchronous operation layer for vmbridge.
//!
//! A [`Bridge`] hands out opaque [`Handle`]s, validates device
//! configurations, gates requests through the lifecycle state machine and
//! runs engine calls off the caller's thread. Every accepted request yields
//! a [`Pending`] that resolves exactly once. [`Bridge::subscribe`] streams
//! every state change.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   vmbridge-core (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │     Bridge      │────▶│  Registry<Instance>      │   │
//! │  │  - create()     │     │  (generation-checked)    │   │
//! │  │  - start()      │     └──────────────────────────┘   │
//! │  │  - stop()       │                 │                  │
//! │  │  - destroy()    │                 ▼                  │
//! │  └─────────────────┘     ┌──────────────────────────┐   │
//! │           │              │  Instance                │   │
//! │           ▼              │  - LifecycleState        │   │
//! │  ┌─────────────────┐     │  - operation token       │   │
//! │  │    Gateway      │     └──────────────────────────┘   │
//! │  │  (tokio tasks)  │────▶ Pending<T> (oneshot)          │
//! │  └─────────────────┘                                    │
//! │           │                                              │
//! └───────────┼──────────────────────────────────────────────┘
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │            vmbridge-vm Engine / EngineVm                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmbridge_core::{Bridge, HostEnvironment};
//! use vmbridge_vm::{DeviceConfigBuilder, FirecrackerConfig, FirecrackerEngine};
//!
//! # async fn example() -> vmbridge_core::Result<()> {
//! let engine = FirecrackerEngine::new(FirecrackerConfig::default())?;
//! let bridge = Bridge::new(
//!     Arc::new(engine),
//!     HostEnvironment::detect(),
//!     tokio::runtime::Handle::current(),
//! );
//!
//! let handle = bridge.create_handle();
//! let config = DeviceConfigBuilder::new()
//!     .kernel("/path/to/vmlinux")
//!     .initramfs("/path/to/initrd.img")
//!     .memory_mib(512)
//!     .cpus(2)
//!     .build();
//!
//! bridge.create(handle, config)?.await?;
//! bridge.start(handle)?.await?;
//!
//! let fd = bridge.vsock_connect(handle, 1024)?.await?;
//! drop(fd);
//!
//! bridge.stop(handle)?.await?;
//! bridge.destroy(handle);
//! # Ok(())
//! # }
//! ```

mod bridge;
mod error;
mod events;
mod gateway;
mod handle;
mod host;
mod instance;
mod netif;
mod operation;
mod state;
mod validate;
mod vsock;

pub use bridge::{Bridge, InstanceSummary};
pub use error::{BootFile, BridgeError, ConfigError, ErrorCategory, Result};
pub use events::{EventReceiver, StateChange, DEFAULT_EVENT_CAPACITY};
pub use handle::Handle;
pub use host::{HostEnvironment, HostLimits};
pub use netif::{
    list_network_interfaces, to_json, InterfaceDescriptor, InterfaceKind, InterfaceSource,
    StaticInterfaces, SysfsInterfaces,
};
pub use operation::{OperationKind, Pending};
pub use state::LifecycleState;
pub use validate::{parse_network, validate, ValidatedConfig};
pub use vsock::{validate_port, VMADDR_PORT_ANY};
