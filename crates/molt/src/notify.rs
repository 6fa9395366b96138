//! Accept-notification listener wrapper.
//!
//! Shutdown must never be delivered to an embedded server that has not
//! started accepting yet, or it silently does nothing and the accept loop
//! outlives the shutdown. The lifecycle closes that race by waiting on a
//! served gate; this wrapper releases the gate on the first `accept` call.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::fd::setsockopt_int;
use crate::sync::ServedToken;

#[cfg(target_os = "linux")]
const KEEPALIVE_IDLE_OPT: libc::c_int = libc::TCP_KEEPIDLE;
#[cfg(target_os = "macos")]
const KEEPALIVE_IDLE_OPT: libc::c_int = libc::TCP_KEEPALIVE;

/// Idle period before keep-alive probes on accepted connections, so dead
/// peers eventually go away.
const KEEPALIVE_IDLE_SECS: libc::c_int = 3 * 60;

/// The listener handed to an embedded server's `serve`.
pub struct NotifyListener {
    inner: TcpListener,
    served: Arc<ServedToken>,
}

impl NotifyListener {
    pub(crate) fn new(inner: TcpListener, served: Arc<ServedToken>) -> Self {
        Self { inner, served }
    }

    /// Accepts a connection. The first call releases the served gate.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.served.fire();
        let (stream, peer) = self.inner.accept().await?;
        // Keep-alive failures are not worth refusing the connection over.
        let _ = set_keep_alive(stream.as_raw_fd());
        Ok((stream, peer))
    }

    /// The bound address of the wrapped listener.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn set_keep_alive(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, KEEPALIVE_IDLE_OPT, KEEPALIVE_IDLE_SECS)?;
    Ok(())
}
