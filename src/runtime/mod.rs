//! Transport drivers for the bounce protocol.
//!
//! One implementation per mode, selected once at startup:
//! - `DatagramTransport`: one long-lived UDP socket
//! - `OneShotTransport`: a fresh TCP connection per probe
//! - `StreamTransport`: one TCP connection reused for the run
//!
//! All of them present the same blocking contract (`Transport`) to the
//! client and server loops, and all of them deliver a kernel receive
//! timestamp with every inbound message.

mod datagram;
mod oneshot;
pub(crate) mod socket;
mod stream;
pub mod timestamp;

pub use datagram::DatagramTransport;
pub use oneshot::OneShotTransport;
pub use stream::StreamTransport;
pub use timestamp::now_micros;

use crate::config::TransportMode;
use crate::error::BounceError;
use crate::protocol::ProbeMessage;
use std::net::SocketAddr;

/// Which end of the exchange a transport serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Originates probes towards a destination.
    Client,
    /// Answers and relays probes from any peer.
    Server,
}

/// A decoded probe plus what the kernel told us about its arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedEnvelope {
    pub message: ProbeMessage,
    /// Kernel receive time in microseconds since the epoch.
    pub rx_timestamp: Option<u64>,
    /// Sender address, used for datagram replies.
    pub peer: Option<SocketAddr>,
}

/// Uniform blocking send/receive surface over every mode.
pub trait Transport: Send {
    /// Prepare for the next exchange.
    ///
    /// Connects (client) or accepts (server) when the mode needs a fresh
    /// connection; a no-op otherwise.
    fn begin(&mut self) -> Result<(), BounceError>;

    /// Send one encoded frame. `peer` is required for unconnected datagram
    /// sends and ignored by connection-oriented modes.
    fn send(&mut self, frame: &[u8], peer: Option<SocketAddr>) -> Result<(), BounceError>;

    /// Block until a full probe arrives.
    ///
    /// Returns `Ok(None)` when the connection was closed by the peer, or
    /// when a protocol error already forced it closed.
    fn receive(&mut self) -> Result<Option<ReceivedEnvelope>, BounceError>;

    /// End the current exchange, dropping per-probe connections.
    fn finish(&mut self);

    /// Release every socket.
    fn close(&mut self);

    /// Address the transport is bound to, when it has one.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Open the transport for `mode`. `addr` is the destination for clients
/// and the bind address for servers.
pub fn open(
    role: Role,
    mode: TransportMode,
    addr: SocketAddr,
) -> Result<Box<dyn Transport>, BounceError> {
    let transport: Box<dyn Transport> = match mode {
        TransportMode::Udp => Box::new(DatagramTransport::open(role, addr)?),
        TransportMode::Tcp => Box::new(OneShotTransport::open(role, addr)?),
        TransportMode::TcpStream => Box::new(StreamTransport::open(role, addr)?),
    };
    Ok(transport)
}
