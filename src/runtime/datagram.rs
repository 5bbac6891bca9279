//! Connectionless datagram transport.
//!
//! One socket lives for the whole run. The client socket is connected to the
//! destination; the server socket is unconnected and replies to whichever
//! peer sent each message.

use super::socket;
use super::timestamp::recv_with_timestamp;
use super::{ReceivedEnvelope, Role, Transport};
use crate::error::BounceError;
use crate::protocol::{ProbeMessage, MAX_PROBE_SIZE};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use tracing::trace;

pub struct DatagramTransport {
    socket: Option<UdpSocket>,
    role: Role,
    /// Receive buffer sized for the largest probe.
    buf: Vec<u8>,
}

impl DatagramTransport {
    pub fn open(role: Role, addr: SocketAddr) -> Result<Self, BounceError> {
        let socket = match role {
            Role::Client => socket::udp_client(addr)?,
            Role::Server => socket::udp_server(addr)?,
        };
        Ok(Self {
            socket: Some(socket),
            role,
            // One spare byte so an oversized datagram is detected, not truncated.
            buf: vec![0u8; MAX_PROBE_SIZE + 1],
        })
    }

    fn socket(&self) -> Result<&UdpSocket, BounceError> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed").into())
    }
}

impl Transport for DatagramTransport {
    fn begin(&mut self) -> Result<(), BounceError> {
        Ok(())
    }

    fn send(&mut self, frame: &[u8], peer: Option<SocketAddr>) -> Result<(), BounceError> {
        let socket = self.socket()?;
        let sent = match (self.role, peer) {
            (Role::Client, _) => socket.send(frame)?,
            (Role::Server, Some(peer)) => socket.send_to(frame, peer)?,
            (Role::Server, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "datagram reply needs a peer address",
                )
                .into())
            }
        };
        if sent != frame.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram send").into());
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<ReceivedEnvelope>, BounceError> {
        let fd = self.socket()?.as_raw_fd();
        let meta = recv_with_timestamp(fd, &mut self.buf)?;
        trace!(len = meta.len, peer = ?meta.peer, "Datagram received");

        let message = ProbeMessage::decode(&self.buf[..meta.len])?;
        Ok(Some(ReceivedEnvelope {
            message,
            rx_timestamp: meta.rx_timestamp,
            peer: meta.peer,
        }))
    }

    fn finish(&mut self) {}

    fn close(&mut self) {
        self.socket = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}
