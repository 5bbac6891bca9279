//! Client role: originate probes and follow each chain to its end.

use crate::engine::{Chain, Step};
use crate::error::BounceError;
use crate::protocol::ProbeMessage;
use crate::runtime::{now_micros, Transport};
use crate::stats::{ProbeOutcome, Prober};
use bytes::BytesMut;
use tracing::{debug, trace};

pub struct ProbeClient {
    transport: Box<dyn Transport>,
    size: usize,
    hops: u8,
    frame: BytesMut,
}

impl ProbeClient {
    pub fn new(transport: Box<dyn Transport>, size: usize, hops: u8) -> Self {
        Self {
            transport,
            size,
            hops,
            frame: BytesMut::with_capacity(size),
        }
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    fn send(&mut self, message: &ProbeMessage) -> Result<(), BounceError> {
        self.frame.clear();
        message.encode_into(&mut self.frame)?;
        self.transport.send(&self.frame, None)
    }

    fn exchange(&mut self) -> Result<ProbeOutcome, BounceError> {
        let (mut chain, first) = Chain::start(self.size as u32, self.hops, now_micros());
        self.send(&first)?;

        loop {
            let envelope = self.transport.receive()?.ok_or(BounceError::PeerClosed)?;
            let reply = envelope.message.expect_size(self.size)?;
            trace!(hops = reply.hops, "Reply received");

            match chain.on_reply(&reply, envelope.rx_timestamp)? {
                Step::Continue(next) => self.send(&next)?,
                Step::Completed(elapsed) => {
                    debug!(
                        state = ?chain.state(),
                        relays = chain.relays(),
                        elapsed,
                        "Chain finished"
                    );
                    return Ok(ProbeOutcome {
                        elapsed,
                        relays: chain.relays(),
                    })
                }
            }
        }
    }
}

impl Prober for ProbeClient {
    fn probe(&mut self) -> Result<ProbeOutcome, BounceError> {
        self.transport.begin()?;
        let outcome = self.exchange();
        self.transport.finish();
        outcome
    }
}
