//! Direct calls to the Firecracker API socket.
//!
//! firepilot's high-level API covers process management, kernel and drives,
//! but not machine sizing, initramfs or vsock. Those are configured here
//! with plain `PUT` requests. **All of them must be issued BEFORE the VM is
//! started.**

use crate::error::{Result, VmError};
use firepilot_models::models::{BootSource, MachineConfiguration, Vsock};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;
use std::path::Path;

/// Configure vCPU count and memory size.
///
/// # Arguments
/// * `socket_path` - Path to the Firecracker API socket
/// * `vcpu_count` - Number of virtual CPUs
/// * `mem_size_mib` - Memory size in MiB
pub async fn configure_machine(
    socket_path: &Path,
    vcpu_count: u32,
    mem_size_mib: u64,
) -> Result<()> {
    tracing::debug!(vcpu_count, mem_size_mib, "Configuring machine resources");

    let vcpus = i32::try_from(vcpu_count)
        .map_err(|_| VmError::Config(format!("vcpu_count out of range: {vcpu_count}")))?;
    let mem = i32::try_from(mem_size_mib)
        .map_err(|_| VmError::Config(format!("mem_size_mib out of range: {mem_size_mib}")))?;

    put_json(socket_path, "/machine-config", &MachineConfiguration::new(mem, vcpus)).await?;

    tracing::info!(vcpu_count, mem_size_mib, "Machine resources configured");
    Ok(())
}

/// Replace the boot source so it carries an initramfs.
pub async fn configure_boot_source(
    socket_path: &Path,
    kernel_path: &Path,
    initrd_path: &Path,
    boot_args: &str,
) -> Result<()> {
    tracing::debug!(
        kernel = %kernel_path.display(),
        initrd = %initrd_path.display(),
        "Configuring boot source"
    );

    let mut boot = BootSource::new(kernel_path.to_string_lossy().to_string());
    boot.initrd_path = Some(initrd_path.to_string_lossy().to_string());
    boot.boot_args = Some(boot_args.to_string());

    put_json(socket_path, "/boot-source", &boot).await
}

/// Attach a vsock device.
///
/// # Arguments
/// * `socket_path` - Path to the Firecracker API socket
/// * `guest_cid` - Guest context ID, must be > 2
/// * `uds_path` - Host-side Unix socket Firecracker multiplexes connections over
pub async fn configure_vsock(socket_path: &Path, guest_cid: u32, uds_path: &Path) -> Result<()> {
    let start = std::time::Instant::now();
    tracing::debug!(
        cid = guest_cid,
        uds_path = %uds_path.display(),
        socket = %socket_path.display(),
        "Configuring vsock"
    );

    let cid = i32::try_from(guest_cid)
        .map_err(|_| VmError::Config(format!("guest_cid out of range: {guest_cid}")))?;
    let vsock = Vsock::new(cid, uds_path.to_string_lossy().to_string());

    put_json(socket_path, "/vsock", &vsock).await?;

    tracing::info!(
        cid = guest_cid,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "vsock configured successfully"
    );
    Ok(())
}

/// `PUT` a JSON body to `path` on the API socket.
async fn put_json<T: Serialize>(socket_path: &Path, path: &str, payload: &T) -> Result<()> {
    let body = serde_json::to_string(payload)
        .map_err(|e| VmError::Config(format!("failed to serialize {path} body: {e}")))?;
    tracing::trace!(path, body = %body, "API request body");

    let uri: hyper::Uri = Uri::new(socket_path, path).into();

    let request = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .map_err(|e| VmError::Config(format!("failed to build {path} request: {e}")))?;

    let client = Client::unix();
    let response = client.request(request).await.map_err(|e| {
        tracing::error!(path, error = %e, "API request failed");
        VmError::Firepilot(format!("{path} request failed: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        let body_str = String::from_utf8_lossy(&body_bytes);
        tracing::error!(path, status = %status, body = %body_str, "API request rejected");
        return Err(VmError::Firepilot(format!(
            "{path} failed with status {status}: {body_str}"
        )));
    }

    Ok(())
}
