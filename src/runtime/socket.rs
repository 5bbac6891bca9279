//! Socket creation and one-time option setup.
//!
//! Every probe socket gets kernel receive timestamping (fatal if refused) and
//! a short busy-poll window (best effort, it needs CAP_NET_ADMIN to raise).

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Busy-poll window in microseconds.
pub const BUSY_POLL_MICROS: libc::c_int = 50;

/// Listen backlog for stream servers.
const LISTEN_BACKLOG: libc::c_int = 1024;

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    let ip = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

/// Apply the per-socket options shared by every mode.
pub(crate) fn configure(fd: RawFd) -> io::Result<()> {
    enable_rx_timestamps(fd)?;
    if let Err(e) = set_busy_poll(fd, BUSY_POLL_MICROS) {
        warn!(error = %e, "SO_BUSY_POLL not applied");
    }
    Ok(())
}

/// Ask the kernel to attach software receive timestamps to inbound data.
#[cfg(target_os = "linux")]
pub(crate) fn enable_rx_timestamps(fd: RawFd) -> io::Result<()> {
    let flags = (libc::SOF_TIMESTAMPING_RX_SOFTWARE | libc::SOF_TIMESTAMPING_SOFTWARE) as libc::c_int;
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn enable_rx_timestamps(_fd: RawFd) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "kernel receive timestamps require Linux",
    ))
}

#[cfg(target_os = "linux")]
fn set_busy_poll(fd: RawFd, micros: libc::c_int) -> io::Result<()> {
    set_int_option(fd, libc::SOL_SOCKET, libc::SO_BUSY_POLL, micros)
}

#[cfg(not(target_os = "linux"))]
fn set_busy_poll(_fd: RawFd, _micros: libc::c_int) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "busy poll requires Linux"))
}

fn set_int_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Client datagram socket connected to `dest`.
pub(crate) fn udp_client(dest: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&dest), Type::DGRAM, Some(Protocol::UDP))?;
    configure(socket.as_raw_fd())?;
    socket.bind(&unspecified_for(&dest).into())?;
    socket.connect(&dest.into())?;
    debug!(peer = %dest, "Datagram socket connected");
    Ok(socket.into())
}

/// Server datagram socket bound to `addr`.
pub(crate) fn udp_server(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    configure(socket.as_raw_fd())?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Open a configured TCP connection to `dest`.
pub(crate) fn tcp_connect(dest: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(domain_for(&dest), Type::STREAM, Some(Protocol::TCP))?;
    configure(socket.as_raw_fd())?;
    socket.set_nodelay(true)?;
    socket.connect(&dest.into())?;
    Ok(socket.into())
}

/// TCP listener with immediate address reuse after restart.
pub(crate) fn tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    configure(socket.as_raw_fd())?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Accept one connection and configure it like an outbound one.
pub(crate) fn tcp_accept(listener: &TcpListener) -> io::Result<TcpStream> {
    let (stream, peer) = listener.accept()?;
    // Accepted sockets inherit the listener's options on Linux; reapply so
    // the contract does not depend on that.
    configure(stream.as_raw_fd())?;
    stream.set_nodelay(true)?;
    debug!(peer = %peer, "Connection accepted");
    Ok(stream)
}
