//! One-connection-per-probe TCP transport.
//!
//! The client opens a new connection for every probe and closes it once the
//! chain completes. The server accepts a new connection per probe and serves
//! it until the client hangs up. The handshake cost is paid on every probe,
//! which keeps each measurement free of connection-reuse effects.

use super::stream::{receive_on, send_on, Endpoint, StreamConn};
use super::{ReceivedEnvelope, Role, Transport};
use crate::error::BounceError;
use std::net::SocketAddr;

pub struct OneShotTransport {
    endpoint: Endpoint,
    conn: Option<StreamConn>,
}

impl OneShotTransport {
    pub fn open(role: Role, addr: SocketAddr) -> Result<Self, BounceError> {
        Ok(Self {
            endpoint: Endpoint::open(role, addr)?,
            conn: None,
        })
    }
}

impl Transport for OneShotTransport {
    fn begin(&mut self) -> Result<(), BounceError> {
        self.conn = Some(self.endpoint.establish()?);
        Ok(())
    }

    fn send(&mut self, frame: &[u8], _peer: Option<SocketAddr>) -> Result<(), BounceError> {
        send_on(&mut self.conn, frame)
    }

    fn receive(&mut self) -> Result<Option<ReceivedEnvelope>, BounceError> {
        receive_on(&mut self.conn)
    }

    fn finish(&mut self) {
        self.conn = None;
    }

    fn close(&mut self) {
        self.conn = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProbeMessage;
    use crate::runtime::testing::kernel_timestamps_available;
    use std::thread;

    #[test]
    fn test_connection_per_probe() {
        if !kernel_timestamps_available() {
            return;
        }

        let mut server =
            OneShotTransport::open(Role::Server, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let mut client = OneShotTransport::open(Role::Client, addr).unwrap();
            let mut ports = Vec::new();
            for i in 0..2u64 {
                client.begin().unwrap();
                let frame = ProbeMessage::new(13, i, 1).encode().unwrap();
                client.send(&frame, None).unwrap();
                let reply = client.receive().unwrap().unwrap();
                ports.push(reply.peer.unwrap().port());
                client.finish();
            }
            ports
        });

        let mut peers = Vec::new();
        for _ in 0..2 {
            server.begin().unwrap();
            let envelope = server.receive().unwrap().unwrap();
            peers.push(envelope.peer.unwrap());
            let reply = ProbeMessage::new(13, 0, 0).encode().unwrap();
            server.send(&reply, None).unwrap();
            // Client closes after the reply.
            assert!(server.receive().unwrap().is_none());
            server.finish();
        }

        let ports = handle.join().unwrap();
        assert_eq!(ports, vec![addr.port(), addr.port()]);
        // Each probe arrived from a different ephemeral port.
        assert_ne!(peers[0].port(), peers[1].port());
    }

    #[test]
    fn test_send_without_begin_fails() {
        if !kernel_timestamps_available() {
            return;
        }

        let mut server =
            OneShotTransport::open(Role::Server, "127.0.0.1:0".parse().unwrap()).unwrap();
        let frame = ProbeMessage::new(13, 0, 0).encode().unwrap();
        assert!(matches!(server.send(&frame, None), Err(BounceError::Io(_))));
        assert!(server.receive().unwrap().is_none());
    }
}
