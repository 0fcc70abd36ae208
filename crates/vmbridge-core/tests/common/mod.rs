//! Shared fixtures: a scripted in-memory engine and on-disk boot files.

#![allow(dead_code)]

use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use vmbridge_core::{
    Bridge, HostEnvironment, HostLimits, InterfaceDescriptor, InterfaceKind, StaticInterfaces,
};
use vmbridge_vm::{DeviceConfig, DeviceConfigBuilder, Engine, EngineVm, VmError, MIB};

/// Counters and knobs shared by the engine and every VM it creates.
#[derive(Default)]
pub struct Script {
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub connects: AtomicUsize,
    pub releases: AtomicUsize,

    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,

    /// VMs created while set block in `start` until [`Script::open_start`].
    pub gate_starts: AtomicBool,
    start_gate: Notify,

    /// While set, `create` blocks until [`Script::open_create`].
    pub gate_creates: AtomicBool,
    create_gate: Notify,

    /// While set, `stop` blocks until [`Script::open_stop`].
    pub gate_stops: AtomicBool,
    stop_gate: Notify,

    /// While set, `connect_vsock` blocks until [`Script::open_connect`].
    pub gate_connects: AtomicBool,
    connect_gate: Notify,

    /// Host ends of vsock channels handed out.
    pub peers: Mutex<Vec<UnixStream>>,
}

impl Script {
    pub fn open_start(&self) {
        self.start_gate.notify_one();
    }

    pub fn open_create(&self) {
        self.create_gate.notify_one();
    }

    pub fn open_stop(&self) {
        self.stop_gate.notify_one();
    }

    pub fn open_connect(&self) {
        self.connect_gate.notify_one();
    }

    async fn pass(gated: &AtomicBool, gate: &Notify) {
        if gated.load(Ordering::SeqCst) {
            gate.notified().await;
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    pub script: Arc<Script>,
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create(&self, _config: &DeviceConfig) -> vmbridge_vm::Result<Box<dyn EngineVm>> {
        self.script.creates.fetch_add(1, Ordering::SeqCst);
        Script::pass(&self.script.gate_creates, &self.script.create_gate).await;
        if self.script.fail_create.load(Ordering::SeqCst) {
            return Err(VmError::Create("scripted create failure".into()));
        }
        Ok(Box::new(ScriptedVm {
            script: Arc::clone(&self.script),
            gated: self.script.gate_starts.load(Ordering::SeqCst),
        }))
    }
}

struct ScriptedVm {
    script: Arc<Script>,
    gated: bool,
}

#[async_trait]
impl EngineVm for ScriptedVm {
    async fn start(&self) -> vmbridge_vm::Result<()> {
        if self.gated {
            self.script.start_gate.notified().await;
        }
        self.script.starts.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_start.load(Ordering::SeqCst) {
            return Err(VmError::Start("scripted start failure".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> vmbridge_vm::Result<()> {
        self.script.stops.fetch_add(1, Ordering::SeqCst);
        Script::pass(&self.script.gate_stops, &self.script.stop_gate).await;
        if self.script.fail_stop.load(Ordering::SeqCst) {
            return Err(VmError::Stop("scripted stop failure".into()));
        }
        Ok(())
    }

    async fn connect_vsock(&self, port: u32) -> vmbridge_vm::Result<OwnedFd> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Script::pass(&self.script.gate_connects, &self.script.connect_gate).await;
        if port == 9999 {
            return Err(VmError::ConnectionRefused {
                port,
                reason: "nothing listening".into(),
            });
        }
        let (ours, theirs) = UnixStream::pair()?;
        self.script.peers.lock().unwrap().push(theirs);
        Ok(OwnedFd::from(ours))
    }

    async fn release(&self) {
        self.script.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Boot files on disk plus a host with a single bridge.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub engine: ScriptedEngine,
    pub bridge: Bridge,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vmlinux"), b"kernel").unwrap();
        std::fs::write(dir.path().join("initrd.img"), b"initrd").unwrap();

        let host = HostEnvironment::new(
            HostLimits {
                max_cpus: 8,
                max_memory_bytes: None,
            },
            StaticInterfaces(vec![
                InterfaceDescriptor {
                    name: "lo".into(),
                    kind: InterfaceKind::Loopback,
                    mac_address: None,
                    mtu: Some(65536),
                    is_up: true,
                },
                InterfaceDescriptor {
                    name: "br0".into(),
                    kind: InterfaceKind::Bridge,
                    mac_address: Some("aa:bb:cc:dd:ee:ff".into()),
                    mtu: Some(1500),
                    is_up: true,
                },
            ]),
        );

        let engine = ScriptedEngine::default();
        let bridge = Bridge::new(
            Arc::new(engine.clone()),
            host,
            tokio::runtime::Handle::current(),
        );
        Self { dir, engine, bridge }
    }

    pub fn script(&self) -> &Script {
        &self.engine.script
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// 512 MiB, 2 vCPUs, no disks, no network.
    pub fn minimal(&self) -> DeviceConfigBuilder {
        DeviceConfigBuilder::new()
            .kernel(self.path("vmlinux"))
            .initramfs(self.path("initrd.img"))
            .memory_bytes(512 * MIB)
            .cpus(2)
    }

    /// Allocate a handle and complete a minimal create.
    pub async fn created(&self) -> vmbridge_core::Handle {
        let handle = self.bridge.create_handle();
        self.bridge
            .create(handle, self.minimal().build())
            .unwrap()
            .await
            .unwrap();
        handle
    }

    /// Allocate, create and start.
    pub async fn running(&self) -> vmbridge_core::Handle {
        let handle = self.created().await;
        self.bridge.start(handle).unwrap().await.unwrap();
        handle
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
