//! Probe wire format.
//!
//! Every probe is a fixed 13-byte header followed by sentinel padding up to
//! the declared size:
//!
//! ```text
//! +--------+-------------------+------+---------------------+
//! | size   | timestamp/elapsed | hops | padding (0xFF)      |
//! | 4 B    | 8 B               | 1 B  | size - 13 B         |
//! +--------+-------------------+------+---------------------+
//! ```
//!
//! Fields use native byte order; both peers are expected to share it.
//! On request legs `timestamp` is the origin send time in microseconds since
//! the epoch. On a terminal reply it carries the elapsed microseconds and
//! `hops` is 0.

use crate::error::BounceError;
use bytes::{Buf, BufMut, BytesMut};

/// Header size in bytes.
pub const HEADER_LEN: usize = 13;

/// Largest probe that fits in a single UDP datagram.
pub const MAX_PROBE_SIZE: usize = 65_507;

/// Filler byte for the padding region.
pub const SENTINEL: u8 = 0xFF;

/// A decoded probe header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeMessage {
    /// Declared total message length (header + padding).
    pub size: u32,
    /// Origin timestamp on request legs, elapsed latency on terminal replies.
    pub timestamp: u64,
    /// Remaining relay hops.
    pub hops: u8,
}

impl ProbeMessage {
    pub fn new(size: u32, timestamp: u64, hops: u8) -> Self {
        Self {
            size,
            timestamp,
            hops,
        }
    }

    /// Declared size as a buffer length.
    pub fn frame_len(&self) -> usize {
        self.size as usize
    }

    /// Encode into a freshly allocated frame of exactly `size` bytes.
    #[cfg(test)]
    pub fn encode(&self) -> Result<BytesMut, BounceError> {
        let mut frame = BytesMut::with_capacity(self.frame_len());
        self.encode_into(&mut frame)?;
        Ok(frame)
    }

    /// Append the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), BounceError> {
        check_declared(self.frame_len())?;

        out.reserve(self.frame_len());
        out.put_u32_ne(self.size);
        out.put_u64_ne(self.timestamp);
        out.put_u8(self.hops);
        out.put_bytes(SENTINEL, self.frame_len() - HEADER_LEN);
        Ok(())
    }

    /// Decode a complete frame.
    ///
    /// The declared size must equal the number of bytes in `frame`.
    pub fn decode(frame: &[u8]) -> Result<Self, BounceError> {
        let message = Self::decode_header(frame)?;
        if message.frame_len() != frame.len() {
            return Err(BounceError::ProtocolSizeMismatch {
                declared: message.frame_len(),
                expected: frame.len(),
            });
        }
        Ok(message)
    }

    /// Decode only the header, ignoring any bytes past it.
    ///
    /// Used by stream transports to learn how much padding follows.
    pub fn decode_header(buf: &[u8]) -> Result<Self, BounceError> {
        if buf.len() < HEADER_LEN {
            return Err(BounceError::MalformedMessage("shorter than probe header"));
        }

        let mut cursor = &buf[..HEADER_LEN];
        let size = cursor.get_u32_ne();
        let timestamp = cursor.get_u64_ne();
        let hops = cursor.get_u8();

        check_declared(size as usize)?;

        Ok(Self {
            size,
            timestamp,
            hops,
        })
    }

    /// Reject a message whose declared size is not the configured probe size.
    pub fn expect_size(self, expected: usize) -> Result<Self, BounceError> {
        if self.frame_len() != expected {
            return Err(BounceError::ProtocolSizeMismatch {
                declared: self.frame_len(),
                expected,
            });
        }
        Ok(self)
    }
}

fn check_declared(size: usize) -> Result<(), BounceError> {
    if size < HEADER_LEN {
        return Err(BounceError::MalformedMessage(
            "declared size smaller than probe header",
        ));
    }
    if size > MAX_PROBE_SIZE {
        return Err(BounceError::MalformedMessage(
            "declared size exceeds a single datagram",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let frame = ProbeMessage::new(20, 0x0102_0304_0506_0708, 3)
            .encode()
            .unwrap();

        assert_eq!(frame.len(), 20);
        assert_eq!(&frame[0..4], &20u32.to_ne_bytes());
        assert_eq!(&frame[4..12], &0x0102_0304_0506_0708u64.to_ne_bytes());
        assert_eq!(frame[12], 3);
        assert!(frame[13..].iter().all(|&b| b == SENTINEL));
    }

    #[test]
    fn test_minimum_size_has_no_padding() {
        let frame = ProbeMessage::new(13, 1, 1).encode().unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
    }

    #[test]
    fn test_encode_rejects_undersized() {
        let err = ProbeMessage::new(12, 0, 1).encode().unwrap_err();
        assert!(matches!(err, BounceError::MalformedMessage(_)));
    }

    #[test]
    fn test_decode_short_buffer() {
        let err = ProbeMessage::decode(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, BounceError::MalformedMessage(_)));

        let err = ProbeMessage::decode(&[]).unwrap_err();
        assert!(matches!(err, BounceError::MalformedMessage(_)));
    }

    #[test]
    fn test_decode_declared_mismatch() {
        let mut frame = ProbeMessage::new(32, 7, 1).encode().unwrap();
        frame.truncate(20);

        match ProbeMessage::decode(&frame) {
            Err(BounceError::ProtocolSizeMismatch { declared, expected }) => {
                assert_eq!(declared, 32);
                assert_eq!(expected, 20);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_header_ignores_trailing_bytes() {
        let frame = ProbeMessage::new(64, 99, 2).encode().unwrap();
        let header = ProbeMessage::decode_header(&frame[..HEADER_LEN]).unwrap();
        assert_eq!(header, ProbeMessage::new(64, 99, 2));
    }

    #[test]
    fn test_decode_header_rejects_bogus_size() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&4u32.to_ne_bytes());
        assert!(matches!(
            ProbeMessage::decode_header(&buf),
            Err(BounceError::MalformedMessage(_))
        ));

        buf[0..4].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert!(matches!(
            ProbeMessage::decode_header(&buf),
            Err(BounceError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_expect_size() {
        let message = ProbeMessage::new(13, 0, 1);
        assert!(message.expect_size(13).is_ok());
        assert!(matches!(
            message.expect_size(64),
            Err(BounceError::ProtocolSizeMismatch {
                declared: 13,
                expected: 64
            })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(size in HEADER_LEN..=2048usize, value: u64, hops: u8) {
            let message = ProbeMessage::new(size as u32, value, hops);
            let frame = message.encode().unwrap();
            prop_assert_eq!(frame.len(), size);
            prop_assert_eq!(ProbeMessage::decode(&frame).unwrap(), message);
        }
    }
}
