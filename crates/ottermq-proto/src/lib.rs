//! AMQP 0-9-1 wire codec.
//!
//! Pure encode/decode with no I/O and no async: the server's read loop hands
//! byte slices in, typed values come out. Layers, bottom up:
//!
//! - [`codec`]: primitive reader/writer pairs (integers, strings, bit groups)
//! - [`table`]: typed field tables with preserved insertion order
//! - [`frame`]: the `[type][channel][size][payload][0xCE]` envelope
//! - [`content`]: content headers and basic properties
//! - [`methods`]: the typed `(class, method)` dispatch table
//! - [`sasl`]: PLAIN credential payloads
//!
//! Nothing here allocates per-connection state; the stateful parts of the
//! protocol (handshake, channel assembly) live in `ottermq-core`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod content;
pub mod errors;
pub mod frame;
pub mod methods;
pub mod sasl;
pub mod table;

pub use codec::{Decoder, Encoder};
pub use content::{BasicProperties, ContentHeader};
pub use errors::{ProtocolError, Result};
pub use frame::{
    FRAME_END, FRAME_MIN_SIZE, FRAME_OVERHEAD, FrameType, PROTOCOL_HEADER, RawFrame,
    check_protocol_header,
};
pub use methods::{
    BasicMethod, ChannelMethod, ClassId, ConnectionMethod, ExchangeMethod, Method, QueueMethod,
};
pub use sasl::PlainCredentials;
pub use table::{FieldTable, FieldValue};
