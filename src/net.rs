// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Raw socket option plumbing `tokio`'s high-level types don't expose:
//! `SO_REUSEADDR` and TCP Fast Open on both the listening and the
//! connecting side. `socket2::SockRef` borrows the `tokio` socket's file
//! descriptor without taking ownership, so these options can be applied
//! in-place before the socket is handed back to `tokio`.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use socket2::SockRef;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tracing::warn;

/// Process-wide latch for the outbound Fast Open sockopt: spec.md §4.1's
/// CONNECTING-stage handling requires that once the OS reports Fast Open
/// unsupported, the feature is disabled rather than retried on every
/// subsequent connection, mirroring the Python original's module-level
/// `_fastopen_connected` style flag instead of a per-connection one.
static FAST_OPEN_CONNECT_SUPPORTED: AtomicBool = AtomicBool::new(true);

/// Failure building a connect-ready socket, distinguishing an unsupported
/// Fast Open sockopt (which per spec.md §4.1/§7 must destroy the handler)
/// from an ordinary I/O failure constructing the socket.
#[derive(Debug, Error)]
pub enum ConnectSocketError {
    #[error("TCP Fast Open is not supported by this OS")]
    FastOpenUnsupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Builds a connect-ready, non-blocking `TcpSocket` for `target`'s address
/// family. When `fast_open` is requested this attempts Linux's
/// `TCP_FASTOPEN_CONNECT` sockopt (send the first write as part of the
/// handshake); if the OS reports the sockopt unsupported, the feature is
/// latched off for the rest of the process and this call fails with
/// [`ConnectSocketError::FastOpenUnsupported`] so the caller can destroy the
/// connection per spec.md §4.1/§7.
pub fn new_connect_socket(
    target: SocketAddr,
    fast_open: bool,
) -> Result<TcpSocket, ConnectSocketError> {
    let socket = if target.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    if fast_open && FAST_OPEN_CONNECT_SUPPORTED.load(Ordering::Relaxed) {
        try_enable_fast_open_connect(&socket)?;
    }
    Ok(socket)
}

fn try_enable_fast_open_connect(socket: &TcpSocket) -> Result<(), ConnectSocketError> {
    #[cfg(target_os = "linux")]
    let result = SockRef::from(socket).set_tcp_fastopen_connect(true);
    #[cfg(not(target_os = "linux"))]
    let result: std::io::Result<()> = {
        let _ = socket;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "no Fast Open sockopt known for this platform",
        ))
    };

    if let Err(e) = result {
        warn!("TCP Fast Open unavailable on outbound connect, disabling: {e}");
        FAST_OPEN_CONNECT_SUPPORTED.store(false, Ordering::Relaxed);
        return Err(ConnectSocketError::FastOpenUnsupported);
    }
    Ok(())
}

/// Binds a listening socket with `SO_REUSEADDR` set and, when `fast_open`
/// is requested, the listener-side Fast Open sockopt (historically socket
/// option 23 on Linux) enabled with a queue length matching the listen
/// backlog.
pub fn bind_listener(addr: SocketAddr, backlog: u32, fast_open: bool) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    if fast_open {
        try_enable_fast_open_listen(&socket, backlog);
    }
    socket.listen(backlog)
}

fn try_enable_fast_open_listen(socket: &TcpSocket, backlog: u32) {
    #[cfg(target_os = "linux")]
    {
        let sock_ref = SockRef::from(socket);
        #[allow(clippy::cast_possible_wrap)]
        if let Err(e) = sock_ref.set_tcp_fastopen(backlog as i32) {
            warn!("TCP Fast Open unavailable on listener, falling back: {e}");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (socket, backlog);
        warn!("TCP Fast Open requested but this platform has no known sockopt for it");
    }
}
