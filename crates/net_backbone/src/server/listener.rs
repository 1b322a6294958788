//! Listening sockets.
//!
//! Sockets are built with `socket2` so that `SO_REUSEADDR` and, when asked
//! for, `SO_REUSEPORT` can be set before binding. With `SO_REUSEPORT` one
//! socket per core is bound to the same address and the kernel spreads
//! incoming connections across their accept loops.

use crate::error::ServerError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[cfg(unix)]
use std::os::fd::AsRawFd;

const BACKLOG: i32 = 1024;

/// Binds the listeners for one configured address.
///
/// Must be called from within a Tokio runtime context. When `address` uses
/// port 0, every extra socket binds to the port the first one was given.
pub(crate) fn bind(address: SocketAddr, use_reuse_port: bool) -> Result<Vec<TcpListener>, ServerError> {
    let count = if use_reuse_port && reuse_port_supported() {
        num_cpus::get().max(1)
    } else {
        1
    };

    let mut listeners = Vec::with_capacity(count);
    let mut target = address;

    for i in 0..count {
        let listener = bind_one(target, count > 1)?;
        if i == 0 {
            target = listener
                .local_addr()
                .map_err(|e| ServerError::Network(format!("Listener address lookup failed: {e}")))?;
        }
        listeners.push(listener);
    }

    info!(address = %target, acceptors = count, "listening");
    Ok(listeners)
}

fn bind_one(address: SocketAddr, reuse_port: bool) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set SO_REUSEADDR: {e}");
    }

    if reuse_port {
        set_reuse_port(&socket);
    }

    socket
        .bind(&address.into())
        .map_err(|e| ServerError::Network(format!("Bind to {address} failed: {e}")))?;
    socket
        .listen(BACKLOG)
        .map_err(|e| ServerError::Network(format!("Listen on {address} failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::Network(format!("Failed to make listener non-blocking: {e}")))?;

    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}

fn reuse_port_supported() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
        target_os = "macos"
    ))
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "macos"
))]
fn set_reuse_port(socket: &Socket) {
    let sockfd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!("Failed to set SO_REUSEPORT: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "macos"
)))]
fn set_reuse_port(_socket: &Socket) {
    warn!("SO_REUSEPORT is not supported on this platform. Using SO_REUSEADDR only.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_port_is_resolved() {
        let listeners = bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        assert_eq!(listeners.len(), 1);
        assert_ne!(listeners[0].local_addr().unwrap().port(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reuse_port_shares_one_address() {
        let listeners = bind("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let first = listeners[0].local_addr().unwrap();
        assert!(listeners
            .iter()
            .all(|listener| listener.local_addr().unwrap() == first));
    }
}
