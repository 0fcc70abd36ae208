//! # vmbridge-ffi
//!
//! Opaque-handle C interface over [`vmbridge_core::Bridge`]. The matching
//! header lives in `include/vm_bridge.h`.
//!
//! One bridge serves the whole process; it is built on first use from the
//! `VMBRIDGE_*` environment (see [`BridgeConfig::from_env`]). Callbacks are
//! invoked exactly once per accepted request, always on a bridge worker
//! thread. Entry points that return `false` rejected the request
//! synchronously: their callback is not invoked and the reason is available
//! from [`vm_bridge_last_error`] on the same thread.

#![warn(unsafe_op_in_unsafe_fn)]

mod config;
mod runtime;
#[cfg(test)]
mod testing;

pub use config::BridgeConfig;

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString, OsStr};
use std::fmt::Display;
use std::os::fd::IntoRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;
use std::slice;
use vmbridge_core::{Bridge, ConfigError, Handle, LifecycleState, Pending};
use vmbridge_vm::{DeviceConfig, DiskSpec};

/// Opaque handle, never dereferenced.
pub type VMBridgeHandle = *mut c_void;

/// Receives `(success, error_message)`; the message is NULL on success.
pub type VMCompletionCallback = Option<extern "C" fn(success: bool, error_message: *const c_char)>;

/// Receives a JSON array of interface descriptors.
pub type NetworkInterfaceCallback = Option<extern "C" fn(interfaces: *const c_char)>;

/// Receives `(fd, error_message)`; `fd` is -1 on failure.
pub type VsockConnectionCallback = Option<extern "C" fn(fd: i32, error_message: *const c_char)>;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: impl Display) {
    let message = message.to_string();
    tracing::debug!(error = %message, "Request rejected");
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(c_message(&message)));
}

fn clear_last_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Messages never contain interior NULs.
fn c_message(message: &str) -> CString {
    CString::new(message.replace('\0', " ")).unwrap_or_default()
}

fn encode(handle: Handle) -> VMBridgeHandle {
    handle.to_raw() as usize as VMBridgeHandle
}

fn decode(handle: VMBridgeHandle) -> Option<Handle> {
    Handle::from_raw(handle as usize as u64)
}

/// Run `f` against the global bridge, recording a synchronous rejection.
fn with_bridge<T>(
    handle: VMBridgeHandle,
    f: impl FnOnce(&Bridge, Handle) -> vmbridge_core::Result<T>,
) -> Option<T> {
    clear_last_error();

    let Some(runtime) = runtime::global() else {
        set_last_error("vm bridge is not available");
        return None;
    };
    let Some(handle) = decode(handle) else {
        set_last_error("invalid handle");
        return None;
    };

    match f(&runtime.bridge, handle) {
        Ok(value) => Some(value),
        Err(e) => {
            set_last_error(&e);
            None
        }
    }
}

fn complete(callback: VMCompletionCallback, result: vmbridge_core::Result<()>) {
    let Some(callback) = callback else {
        return;
    };
    match result {
        Ok(()) => callback(true, ptr::null()),
        Err(e) => {
            let message = c_message(&e.to_string());
            callback(false, message.as_ptr());
        }
    }
}

fn notify(bridge: &Bridge, pending: Pending<()>, callback: VMCompletionCallback) {
    pending.notify(bridge.runtime(), move |result| complete(callback, result));
}

/// Create a VM bridge handle.
///
/// Returns NULL if the bridge could not be initialised.
#[no_mangle]
pub extern "C" fn vm_bridge_create() -> VMBridgeHandle {
    clear_last_error();
    match runtime::global() {
        Some(runtime) => encode(runtime.bridge.create_handle()),
        None => {
            set_last_error("vm bridge is not available");
            ptr::null_mut()
        }
    }
}

/// Destroy a handle and everything it owns.
///
/// Safe in any state and idempotent. Never blocks; an outstanding operation
/// completes with a failure.
#[no_mangle]
pub extern "C" fn vm_bridge_destroy(handle: VMBridgeHandle) {
    let (Some(runtime), Some(handle)) = (runtime::global(), decode(handle)) else {
        return;
    };
    runtime.bridge.destroy(handle);
}

/// Create the VM with no disks and no network, waiting for the engine.
///
/// # Safety
///
/// `kernel_path` and `initramfs_path` must each be NULL or point to a valid
/// null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn vm_bridge_create_vm(
    handle: VMBridgeHandle,
    kernel_path: *const c_char,
    initramfs_path: *const c_char,
    memory_bytes: u64,
    cpu_count: u32,
) -> bool {
    // SAFETY: forwarded under the same contract, with no disks.
    unsafe {
        vm_bridge_create_vm_full(
            handle,
            kernel_path,
            initramfs_path,
            memory_bytes,
            cpu_count,
            ptr::null(),
            ptr::null(),
            ptr::null(),
            0,
            ptr::null(),
            ptr::null(),
        )
    }
}

/// Create the VM with disks and network, waiting for the engine.
///
/// Blocks the calling thread until the engine object is allocated. Rejected
/// on threads that run an async runtime, bridge callbacks included; use
/// [`vm_bridge_create_vm_async`] there.
///
/// # Safety
///
/// String arguments must each be NULL or point to a valid null-terminated
/// string. When `disk_count` is non-zero, `disk_paths`, `disk_sizes` and
/// `disk_read_only` must point to arrays of at least `disk_count` elements.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn vm_bridge_create_vm_full(
    handle: VMBridgeHandle,
    kernel_path: *const c_char,
    initramfs_path: *const c_char,
    memory_bytes: u64,
    cpu_count: u32,
    disk_paths: *const *const c_char,
    disk_sizes: *const u64,
    disk_read_only: *const bool,
    disk_count: u32,
    network_mode: *const c_char,
    bridge_interface: *const c_char,
) -> bool {
    // Waiting here would stall the worker the create needs.
    if tokio::runtime::Handle::try_current().is_ok() {
        set_last_error("blocking create called on a runtime thread, use vm_bridge_create_vm_async");
        return false;
    }

    // SAFETY: the caller upholds the pointer contract documented above.
    let config = unsafe {
        device_config(
            kernel_path,
            initramfs_path,
            memory_bytes,
            cpu_count,
            disk_paths,
            disk_sizes,
            disk_read_only,
            disk_count,
            network_mode,
            bridge_interface,
        )
    };

    let created = with_bridge(handle, |bridge, handle| bridge.create(handle, config?));
    let Some(pending) = created else {
        return false;
    };
    let Some(runtime) = runtime::global() else {
        return false;
    };

    let (tx, rx) = std::sync::mpsc::channel();
    pending.notify(runtime.bridge.runtime(), move |result| {
        let _ = tx.send(result);
    });

    match rx.recv() {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            set_last_error(&e);
            false
        }
        Err(_) => {
            set_last_error("create was abandoned");
            false
        }
    }
}

/// Create the VM without waiting; `callback` reports the engine allocation.
///
/// # Safety
///
/// Same pointer contract as [`vm_bridge_create_vm_full`].
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn vm_bridge_create_vm_async(
    handle: VMBridgeHandle,
    kernel_path: *const c_char,
    initramfs_path: *const c_char,
    memory_bytes: u64,
    cpu_count: u32,
    disk_paths: *const *const c_char,
    disk_sizes: *const u64,
    disk_read_only: *const bool,
    disk_count: u32,
    network_mode: *const c_char,
    bridge_interface: *const c_char,
    callback: VMCompletionCallback,
) -> bool {
    // SAFETY: the caller upholds the pointer contract documented above.
    let config = unsafe {
        device_config(
            kernel_path,
            initramfs_path,
            memory_bytes,
            cpu_count,
            disk_paths,
            disk_sizes,
            disk_read_only,
            disk_count,
            network_mode,
            bridge_interface,
        )
    };

    with_bridge(handle, |bridge, handle| {
        let pending = bridge.create(handle, config?)?;
        notify(bridge, pending, callback);
        Ok(())
    })
    .is_some()
}

/// Start the VM. Returns `false` if rejected; `callback` is then not called.
#[no_mangle]
pub extern "C" fn vm_bridge_start_vm(
    handle: VMBridgeHandle,
    callback: VMCompletionCallback,
) -> bool {
    with_bridge(handle, |bridge, handle| {
        let pending = bridge.start(handle)?;
        notify(bridge, pending, callback);
        Ok(())
    })
    .is_some()
}

/// Stop the VM. Returns `false` if rejected; `callback` is then not called.
#[no_mangle]
pub extern "C" fn vm_bridge_stop_vm(
    handle: VMBridgeHandle,
    callback: VMCompletionCallback,
) -> bool {
    with_bridge(handle, |bridge, handle| {
        let pending = bridge.stop(handle)?;
        notify(bridge, pending, callback);
        Ok(())
    })
    .is_some()
}

/// List host network interfaces as a JSON array, `[]` on failure.
#[no_mangle]
pub extern "C" fn vm_bridge_list_network_interfaces(callback: NetworkInterfaceCallback) {
    let Some(callback) = callback else {
        return;
    };
    let Some(runtime) = runtime::global() else {
        callback(c"[]".as_ptr());
        return;
    };

    runtime
        .bridge
        .list_network_interfaces()
        .notify(runtime.bridge.runtime(), move |result| {
            let json = match result {
                Ok(listing) => vmbridge_core::to_json(&listing),
                Err(e) => {
                    tracing::warn!(error = %e, "Interface enumeration failed");
                    "[]".to_string()
                }
            };
            let json = c_message(&json);
            callback(json.as_ptr());
        });
}

/// Current state code, -1 for unknown handles.
#[no_mangle]
pub extern "C" fn vm_bridge_get_state(handle: VMBridgeHandle) -> i32 {
    state(handle).code()
}

#[no_mangle]
pub extern "C" fn vm_bridge_can_start(handle: VMBridgeHandle) -> bool {
    state(handle).can_start()
}

#[no_mangle]
pub extern "C" fn vm_bridge_can_stop(handle: VMBridgeHandle) -> bool {
    state(handle).can_stop()
}

fn state(handle: VMBridgeHandle) -> LifecycleState {
    match (runtime::global(), decode(handle)) {
        (Some(runtime), Some(handle)) => runtime.bridge.state(handle),
        _ => LifecycleState::Invalid,
    }
}

/// Open a byte stream to `port` in the guest.
///
/// On success the callback receives a descriptor the caller must close.
/// Returns `false` if rejected; `callback` is then not called.
#[no_mangle]
pub extern "C" fn vm_bridge_vsock_connect(
    handle: VMBridgeHandle,
    port: u32,
    callback: VsockConnectionCallback,
) -> bool {
    with_bridge(handle, |bridge, handle| {
        let pending = bridge.vsock_connect(handle, port)?;
        pending.notify(bridge.runtime(), move |result| {
            let Some(callback) = callback else {
                // Dropping the descriptor closes it.
                return;
            };
            match result {
                Ok(fd) => callback(fd.into_raw_fd(), ptr::null()),
                Err(e) => {
                    let message = c_message(&e.to_string());
                    callback(-1, message.as_ptr());
                }
            }
        });
        Ok(())
    })
    .is_some()
}

/// Reason for the last synchronous rejection on this thread, or NULL.
///
/// The pointer stays valid until the next bridge call on this thread.
#[no_mangle]
pub extern "C" fn vm_bridge_last_error() -> *const c_char {
    LAST_ERROR.with(|cell| {
        cell.borrow()
            .as_ref()
            .map_or(ptr::null(), |message| message.as_ptr())
    })
}

/// Static name of a state code.
#[no_mangle]
pub extern "C" fn vm_bridge_state_name(state: i32) -> *const c_char {
    let name: &'static CStr = match LifecycleState::from_code(state) {
        LifecycleState::Invalid => c"invalid",
        LifecycleState::Uninitialized => c"uninitialized",
        LifecycleState::Creating => c"creating",
        LifecycleState::Created => c"created",
        LifecycleState::Starting => c"starting",
        LifecycleState::Running => c"running",
        LifecycleState::Stopping => c"stopping",
        LifecycleState::Stopped => c"stopped",
        LifecycleState::Error => c"error",
    };
    name.as_ptr()
}

/// Assemble a [`DeviceConfig`] from C arguments.
///
/// # Safety
///
/// See [`vm_bridge_create_vm_full`].
#[allow(clippy::too_many_arguments)]
unsafe fn device_config(
    kernel_path: *const c_char,
    initramfs_path: *const c_char,
    memory_bytes: u64,
    cpu_count: u32,
    disk_paths: *const *const c_char,
    disk_sizes: *const u64,
    disk_read_only: *const bool,
    disk_count: u32,
    network_mode: *const c_char,
    bridge_interface: *const c_char,
) -> Result<DeviceConfig, ConfigError> {
    // SAFETY: each pointer is NULL or a valid C string per the caller.
    let (kernel_path, initramfs_path) =
        unsafe { (path_arg(kernel_path), path_arg(initramfs_path)) };

    // SAFETY: array bounds per the caller.
    let disks = unsafe { disk_specs(disk_paths, disk_sizes, disk_read_only, disk_count)? };

    // SAFETY: each pointer is NULL or a valid C string per the caller.
    let (mode, interface) = unsafe {
        (
            str_arg(network_mode, "network_mode")?,
            str_arg(bridge_interface, "bridge_interface")?,
        )
    };
    let network = vmbridge_core::parse_network(mode, interface)?;

    Ok(DeviceConfig {
        kernel_path: kernel_path.unwrap_or_default(),
        initramfs_path: initramfs_path.filter(|p| !p.as_os_str().is_empty()),
        memory_bytes,
        cpu_count,
        disks,
        network,
    })
}

/// # Safety
///
/// `ptr` must be NULL or point to a valid null-terminated string.
unsafe fn path_arg(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and null-terminated per the caller.
    let bytes = unsafe { CStr::from_ptr(ptr) }.to_bytes();
    Some(PathBuf::from(OsStr::from_bytes(bytes)))
}

/// # Safety
///
/// `ptr` must be NULL or point to a valid null-terminated string that
/// outlives the returned reference.
unsafe fn str_arg<'a>(
    ptr: *const c_char,
    field: &'static str,
) -> Result<Option<&'a str>, ConfigError> {
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: non-null and null-terminated per the caller.
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|e| ConfigError::InvalidArgument {
            field,
            reason: e.to_string(),
        })
}

/// # Safety
///
/// With a non-zero `count`, each array must hold at least `count` elements.
unsafe fn disk_specs(
    paths: *const *const c_char,
    sizes: *const u64,
    read_only: *const bool,
    count: u32,
) -> Result<Vec<DiskSpec>, ConfigError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if paths.is_null() || sizes.is_null() || read_only.is_null() {
        return Err(ConfigError::InvalidArgument {
            field: "disks",
            reason: format!("{count} disks requested but an array is NULL"),
        });
    }

    let count = count as usize;
    // SAFETY: non-null with at least `count` elements per the caller.
    let (paths, sizes, read_only) = unsafe {
        (
            slice::from_raw_parts(paths, count),
            slice::from_raw_parts(sizes, count),
            slice::from_raw_parts(read_only, count),
        )
    };

    paths
        .iter()
        .zip(sizes)
        .zip(read_only)
        .enumerate()
        .map(|(index, ((&path, &size_bytes), &read_only))| {
            // SAFETY: element is NULL or a valid C string per the caller.
            let path = unsafe { path_arg(path) }.ok_or_else(|| ConfigError::InvalidArgument {
                field: "disk_paths",
                reason: format!("entry {index} is NULL"),
            })?;
            Ok(DiskSpec {
                path,
                size_bytes,
                read_only,
            })
        })
        .collect()
}
