//! C surface behaviour that needs no hypervisor.

use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use vm_bridge::*;

fn last_error() -> String {
    let ptr = vm_bridge_last_error();
    assert!(!ptr.is_null(), "expected a recorded error");
    // SAFETY: non-null pointers from vm_bridge_last_error are C strings.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

struct BootFiles {
    _dir: tempfile::TempDir,
    kernel: CString,
    initramfs: CString,
}

fn boot_files() -> BootFiles {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dir.path().join("vmlinux");
    let initramfs = dir.path().join("initrd.img");
    std::fs::write(&kernel, b"kernel").unwrap();
    std::fs::write(&initramfs, b"initrd").unwrap();
    BootFiles {
        kernel: CString::new(kernel.to_str().unwrap()).unwrap(),
        initramfs: CString::new(initramfs.to_str().unwrap()).unwrap(),
        _dir: dir,
    }
}

#[test]
fn test_handle_lifecycle() {
    let handle = vm_bridge_create();
    assert!(!handle.is_null());
    assert_eq!(vm_bridge_get_state(handle), 0);
    assert!(!vm_bridge_can_start(handle));
    assert!(!vm_bridge_can_stop(handle));

    vm_bridge_destroy(handle);
    assert_eq!(vm_bridge_get_state(handle), -1);
    // Second destroy is a no-op.
    vm_bridge_destroy(handle);
}

#[test]
fn test_null_handle() {
    assert_eq!(vm_bridge_get_state(ptr::null_mut()), -1);
    assert!(!vm_bridge_can_start(ptr::null_mut()));
    vm_bridge_destroy(ptr::null_mut());

    assert!(!vm_bridge_start_vm(ptr::null_mut(), None));
    assert!(last_error().contains("invalid handle"));
}

static START_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn count_start(_success: bool, _error: *const c_char) {
    START_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_start_before_create_rejected() {
    let handle = vm_bridge_create();

    assert!(!vm_bridge_start_vm(handle, Some(count_start)));
    assert!(last_error().contains("cannot start"));
    assert!(!vm_bridge_stop_vm(handle, Some(count_start)));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(START_CALLS.load(Ordering::SeqCst), 0);
    vm_bridge_destroy(handle);
}

static VSOCK_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn count_vsock(_fd: i32, _error: *const c_char) {
    VSOCK_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_vsock_on_idle_vm_rejected() {
    let handle = vm_bridge_create();

    assert!(!vm_bridge_vsock_connect(handle, 1024, Some(count_vsock)));
    assert!(last_error().contains("vsock connect"));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(VSOCK_CALLS.load(Ordering::SeqCst), 0);
    vm_bridge_destroy(handle);
}

#[test]
fn test_zero_memory_rejected() {
    let files = boot_files();
    let handle = vm_bridge_create();

    // SAFETY: valid C strings.
    let ok = unsafe {
        vm_bridge_create_vm(handle, files.kernel.as_ptr(), files.initramfs.as_ptr(), 0, 2)
    };
    assert!(!ok);
    assert!(last_error().contains("memory_bytes"));
    assert_eq!(vm_bridge_get_state(handle), 0);
    vm_bridge_destroy(handle);
}

#[test]
fn test_missing_kernel_rejected() {
    let files = boot_files();
    let handle = vm_bridge_create();
    let missing = CString::new("/nonexistent/vmlinux").unwrap();

    // SAFETY: valid C strings.
    let ok = unsafe {
        vm_bridge_create_vm(handle, missing.as_ptr(), files.initramfs.as_ptr(), 1 << 29, 2)
    };
    assert!(!ok);
    assert!(last_error().contains("kernel not found"));
    vm_bridge_destroy(handle);
}

#[test]
fn test_bridged_to_missing_interface_rejected() {
    let files = boot_files();
    let handle = vm_bridge_create();
    let mode = CString::new("bridged").unwrap();
    let iface = CString::new("vmbr-missing0").unwrap();

    // SAFETY: valid C strings, no disks.
    let ok = unsafe {
        vm_bridge_create_vm_full(
            handle,
            files.kernel.as_ptr(),
            files.initramfs.as_ptr(),
            1 << 29,
            1,
            ptr::null(),
            ptr::null(),
            ptr::null(),
            0,
            mode.as_ptr(),
            iface.as_ptr(),
        )
    };
    assert!(!ok);
    assert!(last_error().contains("vmbr-missing0"));
    assert_eq!(vm_bridge_get_state(handle), 0);
    vm_bridge_destroy(handle);
}

#[test]
fn test_unknown_network_mode_rejected() {
    let files = boot_files();
    let handle = vm_bridge_create();
    let mode = CString::new("token-ring").unwrap();

    // SAFETY: valid C strings, no disks.
    let ok = unsafe {
        vm_bridge_create_vm_full(
            handle,
            files.kernel.as_ptr(),
            files.initramfs.as_ptr(),
            1 << 29,
            1,
            ptr::null(),
            ptr::null(),
            ptr::null(),
            0,
            mode.as_ptr(),
            ptr::null(),
        )
    };
    assert!(!ok);
    assert!(last_error().contains("unknown network mode"));
    vm_bridge_destroy(handle);
}

static LISTINGS: Mutex<Vec<String>> = Mutex::new(Vec::new());

extern "C" fn record_listing(interfaces: *const c_char) {
    // SAFETY: the bridge passes a valid C string.
    let json = unsafe { CStr::from_ptr(interfaces) }.to_string_lossy().into_owned();
    LISTINGS.lock().unwrap().push(json);
}

#[test]
fn test_list_network_interfaces_calls_back_once() {
    vm_bridge_list_network_interfaces(Some(record_listing));
    wait_until(|| !LISTINGS.lock().unwrap().is_empty());

    std::thread::sleep(Duration::from_millis(50));
    let listings = LISTINGS.lock().unwrap();
    assert_eq!(listings.len(), 1);
    assert!(listings[0].starts_with('['));
    assert!(listings[0].ends_with(']'));
}

static CREATE_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn count_create(_success: bool, _error: *const c_char) {
    CREATE_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_async_create_rejection_skips_callback() {
    let files = boot_files();
    let handle = vm_bridge_create();

    // SAFETY: valid C strings, no disks.
    let accepted = unsafe {
        vm_bridge_create_vm_async(
            handle,
            files.kernel.as_ptr(),
            files.initramfs.as_ptr(),
            1 << 27,
            0,
            ptr::null(),
            ptr::null(),
            ptr::null(),
            0,
            ptr::null(),
            ptr::null(),
            Some(count_create),
        )
    };
    assert!(!accepted);
    assert!(last_error().contains("cpu_count"));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(CREATE_CALLS.load(Ordering::SeqCst), 0);
    vm_bridge_destroy(handle);
}

#[test]
fn test_disk_arrays_must_be_present() {
    let files = boot_files();
    let handle = vm_bridge_create();

    // SAFETY: NULL arrays with a non-zero count are rejected before access.
    let ok = unsafe {
        vm_bridge_create_vm_full(
            handle,
            files.kernel.as_ptr(),
            files.initramfs.as_ptr(),
            1 << 27,
            1,
            ptr::null(),
            ptr::null(),
            ptr::null(),
            2,
            ptr::null(),
            ptr::null(),
        )
    };
    assert!(!ok);
    assert!(last_error().contains("disks"));
    vm_bridge_destroy(handle);
}

#[test]
fn test_state_names() {
    // SAFETY: state names are static C strings.
    let name = unsafe { CStr::from_ptr(vm_bridge_state_name(2)) };
    assert_eq!(name.to_str().unwrap(), "created");
}
