//! Typed AMQP methods.
//!
//! A METHOD frame payload starts with `[class_id: u16][method_id: u16]`
//! followed by the method's argument list. This module decodes that prefix
//! into the tagged [`Method`] enum; dispatch downstream is a `match` on the
//! variant, never a dynamic lookup. Unknown `(class, method)` pairs surface
//! as [`ProtocolError::UnknownMethod`], which the connection engine answers
//! with reply-code 540 (NOT-IMPLEMENTED).

pub mod basic;
pub mod channel;
pub mod connection;
pub mod exchange;
pub mod queue;

pub use basic::BasicMethod;
use bytes::Bytes;
pub use channel::ChannelMethod;
pub use connection::ConnectionMethod;
pub use exchange::ExchangeMethod;
pub use queue::QueueMethod;

use crate::{
    codec::{Decoder, Encoder},
    errors::{ProtocolError, Result},
    frame::RawFrame,
};

/// AMQP class ids in the 0-9-1 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassId {
    /// Connection class (10)
    Connection = 10,
    /// Channel class (20)
    Channel = 20,
    /// Exchange class (40)
    Exchange = 40,
    /// Queue class (50)
    Queue = 50,
    /// Basic class (60)
    Basic = 60,
}

impl ClassId {
    /// Wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a class id. `None` for classes outside the supported table.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            10 => Some(Self::Connection),
            20 => Some(Self::Channel),
            40 => Some(Self::Exchange),
            50 => Some(Self::Queue),
            60 => Some(Self::Basic),
            _ => None,
        }
    }
}

/// One decoded method, tagged by class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// Connection-class method (channel 0 only)
    Connection(ConnectionMethod),
    /// Channel-class method
    Channel(ChannelMethod),
    /// Exchange-class method
    Exchange(ExchangeMethod),
    /// Queue-class method
    Queue(QueueMethod),
    /// Basic-class method
    Basic(BasicMethod),
}

impl Method {
    /// Class id of this method.
    #[must_use]
    pub fn class_id(&self) -> u16 {
        match self {
            Self::Connection(_) => ClassId::Connection.to_u16(),
            Self::Channel(_) => ClassId::Channel.to_u16(),
            Self::Exchange(_) => ClassId::Exchange.to_u16(),
            Self::Queue(_) => ClassId::Queue.to_u16(),
            Self::Basic(_) => ClassId::Basic.to_u16(),
        }
    }

    /// Method id within the class.
    #[must_use]
    pub fn method_id(&self) -> u16 {
        match self {
            Self::Connection(m) => m.method_id(),
            Self::Channel(m) => m.method_id(),
            Self::Exchange(m) => m.method_id(),
            Self::Queue(m) => m.method_id(),
            Self::Basic(m) => m.method_id(),
        }
    }

    /// Dotted method name for logging, e.g. `"basic.publish"`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection(m) => m.name(),
            Self::Channel(m) => m.name(),
            Self::Exchange(m) => m.name(),
            Self::Queue(m) => m.name(),
            Self::Basic(m) => m.name(),
        }
    }

    /// True for methods announcing content (header + body frames follow).
    #[must_use]
    pub fn carries_content(&self) -> bool {
        matches!(
            self,
            Self::Basic(
                BasicMethod::Publish { .. }
                    | BasicMethod::Return { .. }
                    | BasicMethod::Deliver { .. }
                    | BasicMethod::GetOk { .. }
            )
        )
    }

    /// Decode a METHOD frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(payload);
        let class_id = dec.read_u16()?;
        let method_id = dec.read_u16()?;

        match ClassId::from_u16(class_id) {
            Some(ClassId::Connection) => {
                Ok(Self::Connection(ConnectionMethod::decode(method_id, &mut dec)?))
            },
            Some(ClassId::Channel) => {
                Ok(Self::Channel(ChannelMethod::decode(method_id, &mut dec)?))
            },
            Some(ClassId::Exchange) => {
                Ok(Self::Exchange(ExchangeMethod::decode(method_id, &mut dec)?))
            },
            Some(ClassId::Queue) => Ok(Self::Queue(QueueMethod::decode(method_id, &mut dec)?)),
            Some(ClassId::Basic) => Ok(Self::Basic(BasicMethod::decode(method_id, &mut dec)?)),
            None => Err(ProtocolError::UnknownClass { class_id }),
        }
    }

    /// Encode into a METHOD frame payload.
    pub fn encode(&self) -> Result<Bytes> {
        let mut enc = Encoder::new();
        enc.write_u16(self.class_id());
        enc.write_u16(self.method_id());
        match self {
            Self::Connection(m) => m.encode(&mut enc)?,
            Self::Channel(m) => m.encode(&mut enc)?,
            Self::Exchange(m) => m.encode(&mut enc)?,
            Self::Queue(m) => m.encode(&mut enc)?,
            Self::Basic(m) => m.encode(&mut enc)?,
        }
        Ok(enc.finish())
    }

    /// Encode and wrap in a METHOD frame for `channel`.
    pub fn into_frame(self, channel: u16) -> Result<RawFrame> {
        Ok(RawFrame::method(channel, self.encode()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_class_is_rejected() {
        // tx.select (class 90) is outside the supported table
        let payload = [0u8, 90, 0, 10];
        assert_eq!(
            Method::decode(&payload),
            Err(ProtocolError::UnknownClass { class_id: 90 })
        );
    }

    #[test]
    fn unknown_method_reports_both_ids() {
        let payload = [0u8, 10, 0, 99];
        assert_eq!(
            Method::decode(&payload),
            Err(ProtocolError::UnknownMethod { class_id: 10, method_id: 99 })
        );
    }

    #[test]
    fn content_carriers() {
        let publish = Method::Basic(BasicMethod::Publish {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            mandatory: false,
            immediate: false,
        });
        assert!(publish.carries_content());

        let ack = Method::Basic(BasicMethod::Ack { delivery_tag: 1, multiple: false });
        assert!(!ack.carries_content());

        let open = Method::Channel(ChannelMethod::Open);
        assert!(!open.carries_content());
    }
}
