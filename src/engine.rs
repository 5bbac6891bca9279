//! Hop-chain state machine shared by the client and server roles.
//!
//! A node that receives a probe with `hops <= 1` is the terminal hop: it
//! computes `receive - origin` and answers with that elapsed value and
//! `hops = 0`. A node that receives `hops > 1` relays the probe with the hop
//! count decremented and the origin timestamp untouched.
//!
//! The client tracks its own chain with [`Chain`]: it sends the first probe,
//! relays anything that comes back with hops left, and completes when a
//! terminal reply arrives or when it becomes the terminal hop itself.

use crate::error::BounceError;
use crate::protocol::ProbeMessage;
use tracing::{trace, warn};

/// What a node does with a received probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Forward with one fewer hop.
    Relay(ProbeMessage),
    /// End of the chain: answer with the elapsed time.
    Terminate { reply: ProbeMessage, elapsed: u64 },
}

/// Decide terminate-vs-relay for a received probe.
///
/// `rx_timestamp` is only needed on the terminal hop; a relay never reads it.
pub fn on_receive(message: &ProbeMessage, rx_timestamp: Option<u64>) -> Result<Action, BounceError> {
    if message.hops <= 1 {
        let received = rx_timestamp.ok_or(BounceError::TimestampUnavailable)?;
        let elapsed = elapsed_between(message.timestamp, received);
        trace!(hops = message.hops, elapsed, "Terminal hop");
        return Ok(Action::Terminate {
            reply: ProbeMessage::new(message.size, elapsed, 0),
            elapsed,
        });
    }

    trace!(hops = message.hops, "Relaying");
    Ok(Action::Relay(ProbeMessage::new(
        message.size,
        message.timestamp,
        message.hops - 1,
    )))
}

fn elapsed_between(origin: u64, received: u64) -> u64 {
    if received < origin {
        warn!(
            origin,
            received, "Receive timestamp precedes origin, clocks are skewed"
        );
    }
    received.saturating_sub(origin)
}

/// Where a client's chain stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// First probe sent, awaiting a reply.
    Initiated,
    /// The client re-bounced a reply that still had hops left.
    Relaying,
    /// The client observed `hops <= 1` and ended the chain itself.
    Terminal,
    /// A terminal reply arrived from the peer.
    Completed,
}

/// Next step for the client after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Send this probe and keep waiting.
    Continue(ProbeMessage),
    /// The chain ended with this elapsed value in microseconds.
    Completed(u64),
}

/// Client-side view of one probe's hop chain.
#[derive(Debug)]
pub struct Chain {
    state: ChainState,
    /// Hop count on the last probe this client sent.
    last_sent: u8,
    relays: u32,
}

impl Chain {
    /// Start a chain, returning it with the first probe to send.
    pub fn start(size: u32, hops: u8, origin: u64) -> (Self, ProbeMessage) {
        debug_assert!(hops >= 1, "chains need at least one hop");
        let chain = Self {
            state: ChainState::Initiated,
            last_sent: hops,
            relays: 0,
        };
        (chain, ProbeMessage::new(size, origin, hops))
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Relay transitions seen so far, counting both the peer's and ours.
    pub fn relays(&self) -> u32 {
        self.relays
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        matches!(self.state, ChainState::Terminal | ChainState::Completed)
    }

    /// Interpret a reply from the peer.
    pub fn on_reply(
        &mut self,
        reply: &ProbeMessage,
        rx_timestamp: Option<u64>,
    ) -> Result<Step, BounceError> {
        if reply.hops == 0 {
            self.state = ChainState::Completed;
            return Ok(Step::Completed(reply.timestamp));
        }

        // Anything else must be the peer relaying what we last sent.
        if self.last_sent < 2 || reply.hops != self.last_sent - 1 {
            return Err(BounceError::HopViolation {
                sent: self.last_sent,
                received: reply.hops,
            });
        }
        self.relays += 1;

        match on_receive(reply, rx_timestamp)? {
            Action::Terminate { elapsed, .. } => {
                self.state = ChainState::Terminal;
                Ok(Step::Completed(elapsed))
            }
            Action::Relay(next) => {
                self.relays += 1;
                self.last_sent = next.hops;
                self.state = ChainState::Relaying;
                Ok(Step::Continue(next))
            }
        }
    }
}
