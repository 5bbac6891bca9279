//! Kernel receive timestamps.
//!
//! Sockets opt in once at creation (`socket::enable_rx_timestamps`). After
//! that every `recvmsg` carries an `SCM_TIMESTAMPING` control message whose
//! first `timespec` is the software receive time.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

/// Room for the timestamping cmsg plus anything else the kernel attaches.
const CONTROL_LEN: usize = 256;

/// Wall-clock microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

/// Result of a single `recvmsg` call.
#[derive(Debug)]
pub(crate) struct RecvMeta {
    pub len: usize,
    pub rx_timestamp: Option<u64>,
    pub peer: Option<SocketAddr>,
}

/// Receive into `buf`, collecting the kernel timestamp and sender address.
///
/// Blocks until data arrives. A zero length means the stream peer closed.
pub(crate) fn recv_with_timestamp(fd: RawFd, buf: &mut [u8]) -> io::Result<RecvMeta> {
    // u64 backing keeps the control buffer aligned for cmsghdr.
    let mut control = [0u64; CONTROL_LEN / 8];
    let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = (&mut name as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = CONTROL_LEN as _;

    let len = loop {
        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let rx_timestamp = unsafe { read_timestamp(&msg) };
    let peer = sockaddr_to_std(&name, msg.msg_namelen);

    Ok(RecvMeta {
        len,
        rx_timestamp,
        peer,
    })
}

/// Walk the control messages looking for a software receive timestamp.
///
/// # Safety
/// `msg` must be the header just filled in by a successful `recvmsg`, with
/// its control buffer still alive.
#[cfg(target_os = "linux")]
unsafe fn read_timestamp(msg: &libc::msghdr) -> Option<u64> {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMPING {
            // struct scm_timestamping { struct timespec ts[3]; }, ts[0] is software
            let stamps: [libc::timespec; 3] =
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const [libc::timespec; 3]);
            if let Some(micros) = timespec_to_micros(&stamps[0]) {
                return Some(micros);
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    None
}

#[cfg(not(target_os = "linux"))]
unsafe fn read_timestamp(_msg: &libc::msghdr) -> Option<u64> {
    None
}

/// Convert a kernel timespec to microseconds; an all-zero stamp means "not set".
pub(crate) fn timespec_to_micros(ts: &libc::timespec) -> Option<u64> {
    if ts.tv_sec == 0 && ts.tv_nsec == 0 {
        return None;
    }
    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u64::try_from(ts.tv_nsec).ok()?;
    Some(secs * 1_000_000 + nanos / 1_000)
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let addr: &libc::sockaddr_in =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port))))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let addr: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
