//! Wire-level error types.
//!
//! Everything the codec can reject is enumerated here. Decode errors carry
//! enough context (offsets, offending tags/ids) to produce a useful
//! `Connection.Close` reply without re-parsing the frame.

use thiserror::Error;

/// Errors produced while encoding or decoding AMQP wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ends before a complete frame envelope.
    #[error("frame too short: need {expected} bytes, have {actual}")]
    FrameTooShort {
        /// Bytes required for the complete frame
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Frame-end octet was not `0xCE`.
    #[error("bad frame terminator: {found:#04x}")]
    BadTerminator {
        /// Octet found where `0xCE` was expected
        found: u8,
    },

    /// Frame payload exceeds the negotiated frame-max.
    #[error("frame of {size} bytes exceeds negotiated frame-max {max}")]
    OversizeFrame {
        /// Announced payload size
        size: u32,
        /// Negotiated maximum
        max: u32,
    },

    /// First octet of the frame is not METHOD, HEADER, BODY or HEARTBEAT.
    #[error("unknown frame type: {kind}")]
    UnknownFrameType {
        /// The unrecognised type octet
        kind: u8,
    },

    /// Field-table value carries a tag the codec does not support.
    #[error("unknown field-table value tag: {tag:?}")]
    UnknownFieldType {
        /// The unrecognised tag character
        tag: char,
    },

    /// A primitive read ran past the end of the payload.
    #[error("decode overran the buffer: {needed} more bytes needed at offset {at}")]
    DecodeOverflow {
        /// Offset at which the read started
        at: usize,
        /// How many bytes were missing
        needed: usize,
    },

    /// `(class, method)` pair outside the supported table.
    #[error("unknown method {method_id} for class {class_id}")]
    UnknownMethod {
        /// Class id from the method frame prefix
        class_id: u16,
        /// Method id from the method frame prefix
        method_id: u16,
    },

    /// Class id outside the supported table.
    #[error("unknown class id {class_id}")]
    UnknownClass {
        /// The unrecognised class id
        class_id: u16,
    },

    /// The 8-byte protocol header is not `AMQP\x00\x00\x09\x01`.
    #[error("bad protocol header")]
    BadProtocolHeader,

    /// Short string bytes are not valid UTF-8.
    #[error("short string is not valid UTF-8")]
    Utf8,

    /// Short strings are length-prefixed with a single octet.
    #[error("short string of {len} bytes exceeds 255")]
    ShortStringTooLong {
        /// Length of the rejected string
        len: usize,
    },

    /// SASL PLAIN response without the two NUL separators.
    #[error("malformed SASL PLAIN response")]
    BadSaslResponse,
}

/// Convenience alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;
