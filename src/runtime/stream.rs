//! Persistent TCP stream transport.
//!
//! A single connection carries every probe of the run. The client connects
//! on the first exchange; the server accepts one peer and serves it until it
//! disconnects, then accepts the next.
//!
//! Framing: read the 13-byte header (collecting the kernel timestamp from the
//! first segment), validate the declared size, then read the padding.

use super::socket;
use super::timestamp::recv_with_timestamp;
use super::{ReceivedEnvelope, Role, Transport};
use crate::error::BounceError;
use crate::protocol::{ProbeMessage, HEADER_LEN};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use tracing::debug;

/// Where stream connections come from.
pub(crate) enum Endpoint {
    Connect(SocketAddr),
    Listen(TcpListener),
}

impl Endpoint {
    pub(crate) fn open(role: Role, addr: SocketAddr) -> Result<Self, BounceError> {
        Ok(match role {
            Role::Client => Endpoint::Connect(addr),
            Role::Server => Endpoint::Listen(socket::tcp_listener(addr)?),
        })
    }

    /// Connect to the destination or accept the next peer.
    pub(crate) fn establish(&self) -> Result<StreamConn, BounceError> {
        let stream = match self {
            Endpoint::Connect(dest) => socket::tcp_connect(*dest)?,
            Endpoint::Listen(listener) => socket::tcp_accept(listener)?,
        };
        Ok(StreamConn::new(stream))
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Connect(_) => None,
            Endpoint::Listen(listener) => listener.local_addr().ok(),
        }
    }
}

/// One framed TCP connection.
pub(crate) struct StreamConn {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    /// Scratch space for padding bytes.
    padding: Vec<u8>,
}

impl StreamConn {
    fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            peer,
            padding: Vec::new(),
        }
    }

    pub(crate) fn write_frame(&mut self, frame: &[u8]) -> Result<(), BounceError> {
        self.stream.write_all(frame)?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` on a clean close between frames.
    pub(crate) fn read_frame(&mut self) -> Result<Option<ReceivedEnvelope>, BounceError> {
        let fd = self.stream.as_raw_fd();
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        let mut rx_timestamp = None;

        while filled < HEADER_LEN {
            let meta = recv_with_timestamp(fd, &mut header[filled..])?;
            if meta.len == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(BounceError::PeerClosed);
            }
            rx_timestamp = rx_timestamp.or(meta.rx_timestamp);
            filled += meta.len;
        }

        let message = ProbeMessage::decode_header(&header)?;

        let remaining = message.frame_len() - HEADER_LEN;
        self.padding.resize(remaining, 0);
        self.stream
            .read_exact(&mut self.padding)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => BounceError::PeerClosed,
                _ => BounceError::Io(e),
            })?;

        Ok(Some(ReceivedEnvelope {
            message,
            rx_timestamp,
            peer: self.peer,
        }))
    }
}

/// Receive on an optional connection, dropping it when framing is lost.
pub(crate) fn receive_on(
    conn: &mut Option<StreamConn>,
) -> Result<Option<ReceivedEnvelope>, BounceError> {
    let Some(active) = conn.as_mut() else {
        return Ok(None);
    };
    match active.read_frame() {
        Ok(Some(envelope)) => Ok(Some(envelope)),
        Ok(None) => {
            debug!(peer = ?active.peer, "Connection closed by peer");
            *conn = None;
            Ok(None)
        }
        Err(e) => {
            *conn = None;
            Err(e)
        }
    }
}

pub(crate) fn send_on(conn: &mut Option<StreamConn>, frame: &[u8]) -> Result<(), BounceError> {
    match conn.as_mut() {
        Some(active) => active.write_frame(frame),
        None => Err(io::Error::new(io::ErrorKind::NotConnected, "no active connection").into()),
    }
}

pub struct StreamTransport {
    endpoint: Endpoint,
    conn: Option<StreamConn>,
}

impl StreamTransport {
    pub fn open(role: Role, addr: SocketAddr) -> Result<Self, BounceError> {
        Ok(Self {
            endpoint: Endpoint::open(role, addr)?,
            conn: None,
        })
    }
}

impl Transport for StreamTransport {
    fn begin(&mut self) -> Result<(), BounceError> {
        if self.conn.is_none() {
            self.conn = Some(self.endpoint.establish()?);
        }
        Ok(())
    }

    fn send(&mut self, frame: &[u8], _peer: Option<SocketAddr>) -> Result<(), BounceError> {
        send_on(&mut self.conn, frame)
    }

    fn receive(&mut self) -> Result<Option<ReceivedEnvelope>, BounceError> {
        receive_on(&mut self.conn)
    }

    fn finish(&mut self) {}

    fn close(&mut self) {
        self.conn = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }
}
