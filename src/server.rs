//! Server role: answer terminal probes and relay the rest.
//!
//! One exchange at a time. Each iteration of the outer loop prepares the
//! transport (accepting a connection when the mode needs one) and then serves
//! messages until the peer disconnects or shutdown is requested.

use crate::engine::{self, Action};
use crate::error::BounceError;
use crate::runtime::Transport;
use crate::shutdown::CancellationToken;
use bytes::BytesMut;
use tracing::{debug, trace, warn};

/// Counters kept while serving.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeStats {
    /// Probes answered as the terminal hop.
    pub terminated: u64,
    /// Probes relayed back with one fewer hop.
    pub relayed: u64,
    /// Messages dropped on protocol errors.
    pub rejected: u64,
}

pub struct Server {
    transport: Box<dyn Transport>,
    token: CancellationToken,
    frame: BytesMut,
    stats: ServeStats,
}

impl Server {
    pub fn new(transport: Box<dyn Transport>, token: CancellationToken) -> Self {
        Self {
            transport,
            token,
            frame: BytesMut::new(),
            stats: ServeStats::default(),
        }
    }

    /// Serve until the token is cancelled or a fatal transport error occurs.
    pub fn run(&mut self) -> Result<ServeStats, BounceError> {
        while !self.token.is_cancelled() {
            self.transport.begin()?;
            self.serve_connection()?;
            self.transport.finish();
        }
        self.transport.close();
        Ok(self.stats)
    }

    fn serve_connection(&mut self) -> Result<(), BounceError> {
        while !self.token.is_cancelled() {
            let envelope = match self.transport.receive() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!("Peer finished");
                    return Ok(());
                }
                Err(e) if e.is_probe_local() => {
                    warn!(error = %e, "Rejected message");
                    self.stats.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let reply = match engine::on_receive(&envelope.message, envelope.rx_timestamp) {
                Ok(Action::Terminate { reply, elapsed }) => {
                    trace!(elapsed, peer = ?envelope.peer, "Answering terminal probe");
                    self.stats.terminated += 1;
                    reply
                }
                Ok(Action::Relay(next)) => {
                    trace!(hops = next.hops, peer = ?envelope.peer, "Relaying probe");
                    self.stats.relayed += 1;
                    next
                }
                Err(e) if e.is_probe_local() => {
                    warn!(error = %e, "Dropped probe");
                    self.stats.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.frame.clear();
            reply.encode_into(&mut self.frame)?;
            self.transport.send(&self.frame, envelope.peer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProbeClient;
    use crate::config::TransportMode;
    use crate::protocol::ProbeMessage;
    use crate::report::NullReporter;
    use crate::runtime::{self, testing::kernel_timestamps_available, Role};
    use crate::stats::{Aggregator, Schedule};
    use std::net::{SocketAddr, UdpSocket};
    use std::thread;
    use std::time::Duration;

    fn spawn_server(mode: TransportMode) -> (SocketAddr, CancellationToken) {
        let transport =
            runtime::open(Role::Server, mode, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = transport.local_addr().unwrap();
        let token = CancellationToken::new();
        let mut server = Server::new(transport, token.clone());
        // Left detached: it stays blocked in receive after the test ends.
        thread::spawn(move || server.run());
        (addr, token)
    }

    fn run_client(
        mode: TransportMode,
        addr: SocketAddr,
        hops: u8,
        size: usize,
        count: u32,
    ) -> crate::stats::RunSummary {
        let transport = runtime::open(Role::Client, mode, addr).unwrap();
        let mut client = ProbeClient::new(transport, size, hops);
        let schedule = Schedule {
            tests: 1,
            batches: 1,
            count,
            threshold: None,
            cooldown: Duration::ZERO,
            batch_pause: Duration::ZERO,
            test_interval: Duration::ZERO,
        };
        let mut reporter = NullReporter;
        let run = Aggregator::new(schedule, &mut reporter, CancellationToken::new())
            .run(&mut client)
            .unwrap();
        client.close();
        run
    }

    fn end_to_end(mode: TransportMode, hops: u8) {
        if !kernel_timestamps_available() {
            return;
        }
        let (addr, token) = spawn_server(mode);
        let run = run_client(mode, addr, hops, 64, 3);

        let batch = &run.tests[0].batches[0];
        assert_eq!(batch.stats.count(), 3);
        assert_eq!(batch.failures, 0);
        token.cancel();
    }

    #[test]
    fn test_udp_single_hop() {
        end_to_end(TransportMode::Udp, 1);
    }

    #[test]
    fn test_tcp_single_hop() {
        end_to_end(TransportMode::Tcp, 1);
    }

    #[test]
    fn test_tcp_stream_single_hop() {
        end_to_end(TransportMode::TcpStream, 1);
    }

    #[test]
    fn test_udp_relay_chain() {
        end_to_end(TransportMode::Udp, 3);
    }

    #[test]
    fn test_tcp_relay_chain() {
        end_to_end(TransportMode::Tcp, 4);
    }

    #[test]
    fn test_tcp_stream_relay_chain() {
        end_to_end(TransportMode::TcpStream, 5);
    }

    #[test]
    fn test_server_survives_garbage() {
        if !kernel_timestamps_available() {
            return;
        }
        let (addr, token) = spawn_server(TransportMode::Udp);

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[0xAB; 5], addr).unwrap();

        // A well-formed probe after the garbage still gets answered.
        let run = run_client(TransportMode::Udp, addr, 1, 13, 2);
        assert_eq!(run.samples(), 2);
        token.cancel();
    }

    #[test]
    fn test_terminal_reply_on_the_wire() {
        if !kernel_timestamps_available() {
            return;
        }
        let (addr, token) = spawn_server(TransportMode::Udp);

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let origin = runtime::now_micros();
        let frame = ProbeMessage::new(32, origin, 1).encode().unwrap();
        raw.send_to(&frame, addr).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = raw.recv_from(&mut buf).unwrap();
        let reply = ProbeMessage::decode(&buf[..n]).unwrap();
        assert_eq!(reply.size, 32);
        assert_eq!(reply.hops, 0);
        // Elapsed is a loopback one-way delay: well under a second.
        assert!(reply.timestamp < 1_000_000);
        token.cancel();
    }

    #[test]
    fn test_relay_reply_on_the_wire() {
        if !kernel_timestamps_available() {
            return;
        }
        let (addr, token) = spawn_server(TransportMode::Udp);

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let frame = ProbeMessage::new(20, 123_456, 7).encode().unwrap();
        raw.send_to(&frame, addr).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = raw.recv_from(&mut buf).unwrap();
        assert_eq!(
            ProbeMessage::decode(&buf[..n]).unwrap(),
            ProbeMessage::new(20, 123_456, 6)
        );
        token.cancel();
    }
}
