use anyhow::Context;
use socket2::Protocol;
use std::io;
use std::net::SocketAddr;
#[cfg(windows)]
use windows::ignore_conn_reset;

#[cfg(windows)]
mod windows;

fn bind_udp_ops(
    addr: SocketAddr,
    only_v6: bool,
    buffer_size: usize,
) -> anyhow::Result<socket2::Socket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket
            .set_only_v6(only_v6)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    };
    #[cfg(windows)]
    if let Err(e) = ignore_conn_reset(&socket) {
        log::warn!("ignore_conn_reset {e:?}")
    }
    if buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
            log::warn!("set_recv_buffer_size {buffer_size} {e:?}")
        }
        if let Err(e) = socket.set_send_buffer_size(buffer_size) {
            log::warn!("set_send_buffer_size {buffer_size} {e:?}")
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Bind a non-blocking UDP socket, sizing the kernel buffers when `buffer_size > 0`.
///
/// The returned socket is ready to be handed to an async runtime
/// (e.g. `tokio::net::UdpSocket::from_std`).
pub fn bind_udp(addr: SocketAddr, buffer_size: usize) -> anyhow::Result<std::net::UdpSocket> {
    let socket =
        bind_udp_ops(addr, true, buffer_size).with_context(|| format!("bind_udp {}", addr))?;
    Ok(socket.into())
}

/// Errors a UDP receive loop should skip instead of terminating on.
pub fn should_ignore_error(e: &io::Error) -> bool {
    #[cfg(windows)]
    {
        if let Some(os_error) = e.raw_os_error() {
            return os_error == windows_sys::Win32::Networking::WinSock::WSAECONNRESET;
        }
    }
    _ = e;
    false
}
