//! In-memory engine behind the global bridge in unit tests.
//!
//! Behaviour is chosen per VM by the kernel file name, so tests sharing the
//! global bridge do not interfere: a kernel named `vmlinux-fail-start`
//! boots into an engine failure.

use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use vmbridge_vm::{DeviceConfig, Engine, EngineVm, VmError};

/// Guest ends of vsock channels, by port.
pub(crate) static PEERS: Mutex<Vec<(u32, UnixStream)>> = Mutex::new(Vec::new());

pub(crate) fn take_peer(port: u32) -> Option<UnixStream> {
    let mut peers = PEERS.lock().unwrap();
    let index = peers.iter().position(|(p, _)| *p == port)?;
    Some(peers.swap_remove(index).1)
}

pub(crate) struct ScriptedEngine;

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create(&self, config: &DeviceConfig) -> vmbridge_vm::Result<Box<dyn EngineVm>> {
        let fail_start = config
            .kernel_path
            .file_name()
            .is_some_and(|name| name == "vmlinux-fail-start");
        Ok(Box::new(ScriptedVm { fail_start }))
    }
}

struct ScriptedVm {
    fail_start: bool,
}

#[async_trait]
impl EngineVm for ScriptedVm {
    async fn start(&self) -> vmbridge_vm::Result<()> {
        if self.fail_start {
            return Err(VmError::Start("scripted start failure".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> vmbridge_vm::Result<()> {
        Ok(())
    }

    async fn connect_vsock(&self, port: u32) -> vmbridge_vm::Result<OwnedFd> {
        let (ours, theirs) = UnixStream::pair()?;
        PEERS.lock().unwrap().push((port, theirs));
        Ok(OwnedFd::from(ours))
    }

    async fn release(&self) {}
}
