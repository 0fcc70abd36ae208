//! Host-initiated vsock connections through Firecracker's Unix socket.
//!
//! Firecracker exposes the guest's vsock device as a Unix socket on the host.
//! A connection to guest port `P` is opened by connecting to that socket,
//! writing `CONNECT P\n` and reading back `OK <host_port>\n`. Everything after
//! that line belongs to the guest stream.

use crate::error::{Result, VmError};
use std::os::fd::OwnedFd;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Longest acknowledgement line accepted from Firecracker.
const MAX_ACK_LEN: usize = 64;

/// Connect to `port` in the guest behind `uds_path`.
///
/// Returns a blocking, connected descriptor owned by the caller.
pub async fn connect(uds_path: &Path, port: u32) -> Result<OwnedFd> {
    let start = std::time::Instant::now();
    tracing::trace!(path = %uds_path.display(), port, "Attempting vsock connection");

    let mut stream = UnixStream::connect(uds_path)
        .await
        .map_err(|e| VmError::Vsock(format!("socket connect failed: {e}")))?;

    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await
        .map_err(|e| VmError::Vsock(format!("handshake write failed: {e}")))?;
    stream.flush().await?;

    let ack = read_ack(&mut stream, port).await?;
    if !ack.starts_with("OK ") {
        tracing::debug!(port, response = %ack, "Handshake failed");
        return Err(VmError::ConnectionRefused {
            port,
            reason: format!("unexpected handshake response: {ack}"),
        });
    }

    let std_stream = stream.into_std()?;
    std_stream.set_nonblocking(false)?;

    tracing::debug!(
        port,
        response = %ack,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "vsock handshake successful"
    );
    Ok(OwnedFd::from(std_stream))
}

/// Read the acknowledgement line one byte at a time so no guest data is
/// pulled into a buffer we are about to throw away.
async fn read_ack(stream: &mut UnixStream, port: u32) -> Result<String> {
    let mut line = Vec::with_capacity(16);
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(VmError::ConnectionRefused {
                port,
                reason: "connection closed during handshake (is anything listening?)".into(),
            });
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_ACK_LEN {
            return Err(VmError::Vsock("handshake response too long".into()));
        }
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}
