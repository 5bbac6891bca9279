//! Error types for the bounce protocol.

use std::io;
use thiserror::Error;

/// Errors raised while exchanging probes.
#[derive(Error, Debug)]
pub enum BounceError {
    /// Socket create/bind/listen/connect/send/receive failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The socket did not deliver a kernel receive timestamp.
    #[error("kernel receive timestamp unavailable")]
    TimestampUnavailable,
    /// Fewer bytes than a probe header, or a header declaring an impossible size.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    /// Declared probe size disagrees with the expected size.
    #[error("protocol size mismatch: declared {declared} bytes, expected {expected}")]
    ProtocolSizeMismatch { declared: usize, expected: usize },
    /// A reply carried a hop count that does not continue the chain.
    #[error("hop violation: sent {sent} hops, received {received}")]
    HopViolation { sent: u8, received: u8 },
    /// The peer closed the connection in the middle of an exchange.
    #[error("peer closed the connection")]
    PeerClosed,
}

impl BounceError {
    /// Errors that abandon the current probe but leave the run intact.
    pub fn is_probe_local(&self) -> bool {
        matches!(
            self,
            BounceError::TimestampUnavailable
                | BounceError::MalformedMessage(_)
                | BounceError::ProtocolSizeMismatch { .. }
                | BounceError::HopViolation { .. }
        )
    }
}
