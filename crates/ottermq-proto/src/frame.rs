//! The AMQP frame envelope.
//!
//! Every frame on the wire is
//! `[type: u8][channel: u16 BE][size: u32 BE][payload: size bytes][0xCE]`.
//! This module is a pure data holder plus encode/decode; it never looks
//! inside the payload. Method payloads are parsed by [`crate::methods`],
//! content headers by [`crate::content`].

use bytes::{Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// The fixed 8-byte protocol header opening every connection:
/// `AMQP` followed by protocol id 0 and version 0-9-1.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Frame-end octet closing every frame.
pub const FRAME_END: u8 = 0xCE;

/// Bytes of envelope around a payload: 7-byte header plus the end octet.
pub const FRAME_OVERHEAD: usize = 8;

/// The smallest frame-max any peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Frame type octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Method frame carrying a class/method payload
    Method = 1,
    /// Content header frame
    Header = 2,
    /// Content body frame
    Body = 3,
    /// Heartbeat frame (empty payload, channel 0)
    Heartbeat = 8,
}

impl FrameType {
    /// Parse the type octet. `None` for unrecognised values.
    #[must_use]
    pub fn from_u8(octet: u8) -> Option<Self> {
        match octet {
            1 => Some(Self::Method),
            2 => Some(Self::Header),
            3 => Some(Self::Body),
            8 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    /// Wire value of this frame type.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// One decoded frame envelope: type, channel and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Frame type
    pub kind: FrameType,
    /// Channel the frame belongs to (0 = connection scope)
    pub channel: u16,
    /// Raw payload bytes, not yet interpreted
    pub payload: Bytes,
}

impl RawFrame {
    /// Build a METHOD frame.
    #[must_use]
    pub fn method(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self { kind: FrameType::Method, channel, payload: payload.into() }
    }

    /// Build a content HEADER frame.
    #[must_use]
    pub fn header(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self { kind: FrameType::Header, channel, payload: payload.into() }
    }

    /// Build a content BODY frame.
    #[must_use]
    pub fn body(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self { kind: FrameType::Body, channel, payload: payload.into() }
    }

    /// Build the heartbeat frame: type 8, channel 0, empty payload.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self { kind: FrameType::Heartbeat, channel: 0, payload: Bytes::new() }
    }

    /// Total bytes this frame occupies on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(&[self.kind.to_u8()]);
        dst.extend_from_slice(&self.channel.to_be_bytes());
        dst.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        dst.extend_from_slice(&self.payload);
        dst.extend_from_slice(&[FRAME_END]);
    }

    /// Encode into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed. `frame_max`
    /// bounds the payload size; 0 disables the check (only valid before
    /// tuning completes).
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooShort`] if `buf` does not hold a complete
    ///   frame yet
    /// - [`ProtocolError::UnknownFrameType`] for a bad type octet
    /// - [`ProtocolError::OversizeFrame`] if the announced size exceeds
    ///   `frame_max`
    /// - [`ProtocolError::BadTerminator`] if the end octet is not `0xCE`
    pub fn decode(buf: &[u8], frame_max: u32) -> Result<(Self, usize)> {
        if buf.len() < 7 {
            return Err(ProtocolError::FrameTooShort { expected: 7, actual: buf.len() });
        }

        let kind = FrameType::from_u8(buf[0])
            .ok_or(ProtocolError::UnknownFrameType { kind: buf[0] })?;
        let channel = u16::from_be_bytes([buf[1], buf[2]]);
        let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);

        if frame_max != 0 && size > frame_max {
            return Err(ProtocolError::OversizeFrame { size, max: frame_max });
        }

        let total = 7 + size as usize + 1;
        if buf.len() < total {
            return Err(ProtocolError::FrameTooShort { expected: total, actual: buf.len() });
        }

        let terminator = buf[total - 1];
        if terminator != FRAME_END {
            return Err(ProtocolError::BadTerminator { found: terminator });
        }

        let payload = Bytes::copy_from_slice(&buf[7..total - 1]);
        Ok((Self { kind, channel, payload }, total))
    }
}

/// Check an incoming 8-byte protocol header.
///
/// # Errors
///
/// [`ProtocolError::BadProtocolHeader`] if the bytes differ from
/// [`PROTOCOL_HEADER`]; the server then answers with its own header and
/// closes the TCP connection.
pub fn check_protocol_header(bytes: &[u8; 8]) -> Result<()> {
    if *bytes == PROTOCOL_HEADER { Ok(()) } else { Err(ProtocolError::BadProtocolHeader) }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn heartbeat_is_eight_bytes_ending_in_ce() {
        let wire = RawFrame::heartbeat().to_bytes();
        assert_eq!(wire.as_ref(), &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn decode_rejects_bad_terminator() {
        let mut wire = BytesMut::new();
        RawFrame::method(1, vec![1, 2, 3]).encode(&mut wire);
        let last = wire.len() - 1;
        wire[last] = 0xAA;

        assert_eq!(
            RawFrame::decode(&wire, 0),
            Err(ProtocolError::BadTerminator { found: 0xAA })
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let wire = [9u8, 0, 0, 0, 0, 0, 0, 0xCE];
        assert_eq!(
            RawFrame::decode(&wire, 0),
            Err(ProtocolError::UnknownFrameType { kind: 9 })
        );
    }

    #[test]
    fn decode_rejects_oversize_payload() {
        let mut wire = BytesMut::new();
        RawFrame::body(1, vec![0u8; 5000]).encode(&mut wire);

        assert_eq!(
            RawFrame::decode(&wire, FRAME_MIN_SIZE),
            Err(ProtocolError::OversizeFrame { size: 5000, max: FRAME_MIN_SIZE })
        );
    }

    #[test]
    fn decode_reports_truncation() {
        let mut wire = BytesMut::new();
        RawFrame::method(2, vec![7u8; 16]).encode(&mut wire);

        let result = RawFrame::decode(&wire[..10], 0);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 24, actual: 10 }));
    }

    #[test]
    fn protocol_header_mismatch() {
        assert!(check_protocol_header(&PROTOCOL_HEADER).is_ok());
        assert_eq!(
            check_protocol_header(b"AMQP\x01\x01\x00\x09"),
            Err(ProtocolError::BadProtocolHeader)
        );
    }

    fn arb_frame() -> impl Strategy<Value = RawFrame> {
        (
            prop_oneof![
                Just(FrameType::Method),
                Just(FrameType::Header),
                Just(FrameType::Body),
                Just(FrameType::Heartbeat),
            ],
            any::<u16>(),
            prop::collection::vec(any::<u8>(), 0..512),
        )
            .prop_map(|(kind, channel, payload)| RawFrame {
                kind,
                channel,
                payload: Bytes::from(payload),
            })
    }

    proptest! {
        #[test]
        fn frame_round_trip(frame in arb_frame()) {
            let wire = frame.to_bytes();
            let (parsed, consumed) = RawFrame::decode(&wire, 0).expect("should decode");
            prop_assert_eq!(consumed, wire.len());
            prop_assert_eq!(parsed, frame);
        }

        #[test]
        fn trailing_bytes_are_left_alone(frame in arb_frame(), extra in prop::collection::vec(any::<u8>(), 1..32)) {
            let mut wire = BytesMut::new();
            frame.encode(&mut wire);
            let frame_len = wire.len();
            wire.extend_from_slice(&extra);

            let (parsed, consumed) = RawFrame::decode(&wire, 0).expect("should decode");
            prop_assert_eq!(consumed, frame_len);
            prop_assert_eq!(parsed, frame);
        }
    }
}
