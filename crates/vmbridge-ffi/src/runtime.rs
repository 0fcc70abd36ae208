//! Process-global bridge and the runtime it runs on.
//!
//! Built on first use. If building fails every entry point behaves as if
//! the handle were unknown, and the reason is logged once.

use crate::config::BridgeConfig;
use anyhow::Context;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmbridge_core::{Bridge, HostEnvironment};
use vmbridge_vm::Engine;

pub(crate) struct BridgeRuntime {
    // Keeps the worker threads alive for the life of the process.
    _runtime: tokio::runtime::Runtime,
    pub(crate) bridge: Bridge,
}

static GLOBAL: OnceLock<Option<BridgeRuntime>> = OnceLock::new();

/// The global bridge, building it on first call.
pub(crate) fn global() -> Option<&'static BridgeRuntime> {
    GLOBAL
        .get_or_init(|| {
            let config = BridgeConfig::from_env();
            init_logging(&config.log_directive);

            let built =
                engine(&config).and_then(|engine| BridgeRuntime::with_engine(&config, engine));
            match built {
                Ok(runtime) => Some(runtime),
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "Failed to initialise vm bridge");
                    None
                }
            }
        })
        .as_ref()
}

/// The engine behind the global bridge.
#[cfg(not(test))]
fn engine(config: &BridgeConfig) -> anyhow::Result<Arc<dyn Engine>> {
    config.validate_warn();
    let engine = vmbridge_vm::FirecrackerEngine::new(config.engine())
        .context("invalid engine configuration")?;
    Ok(Arc::new(engine))
}

/// Unit tests drive the C surface against the scripted engine.
#[cfg(test)]
fn engine(_config: &BridgeConfig) -> anyhow::Result<Arc<dyn Engine>> {
    Ok(Arc::new(crate::testing::ScriptedEngine))
}

impl BridgeRuntime {
    fn with_engine(config: &BridgeConfig, engine: Arc<dyn Engine>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("vmbridge-worker")
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;

        let bridge = Bridge::new(engine, HostEnvironment::detect(), runtime.handle().clone());

        tracing::info!(
            firecracker = ?config.firecracker_path,
            chroot = ?config.chroot_path,
            worker_threads = config.worker_threads,
            "vm bridge initialised"
        );
        Ok(Self {
            _runtime: runtime,
            bridge,
        })
    }
}

/// Install a stderr subscriber unless the host already has one.
fn init_logging(directive: &str) {
    let mut filter = EnvFilter::from_default_env();
    for part in directive.split(',').filter(|p| !p.trim().is_empty()) {
        match part.trim().parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("vm_bridge: ignoring log directive {part:?}: {e}"),
        }
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
