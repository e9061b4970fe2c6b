//! Content header frames and basic properties.
//!
//! A content header follows the method that announced the content
//! (`Basic.Publish`, `Basic.Deliver`, ...) and carries the body size plus
//! the message properties. Properties are optional fields gated by a 16-bit
//! flag word: bit 15 is the first property, descending from there. Bits 2
//! and below are reserved and must be zero in 0-9-1.

use crate::{
    codec::{Decoder, Encoder},
    errors::Result,
    table::FieldTable,
};

/// The thirteen optional `Basic` content properties.
///
/// Flag-word bit positions, highest first: content-type 15,
/// content-encoding 14, headers 13, delivery-mode 12, priority 11,
/// correlation-id 10, reply-to 9, expiration 8, message-id 7, timestamp 6,
/// type 5, user-id 4, app-id 3.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BasicProperties {
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Application headers
    pub headers: Option<FieldTable>,
    /// 1 = non-persistent, 2 = persistent
    pub delivery_mode: Option<u8>,
    /// Priority 0..=9
    pub priority: Option<u8>,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// Address to reply to
    pub reply_to: Option<String>,
    /// Message expiration, milliseconds as text
    pub expiration: Option<String>,
    /// Application message identifier
    pub message_id: Option<String>,
    /// Message timestamp, seconds since epoch
    pub timestamp: Option<i64>,
    /// Message type name
    pub kind: Option<String>,
    /// Creating user id
    pub user_id: Option<String>,
    /// Creating application id
    pub app_id: Option<String>,
}

impl BasicProperties {
    fn flags(&self) -> u16 {
        let mut flags = 0u16;
        let mut set = |bit: u16, present: bool| {
            if present {
                flags |= 1 << bit;
            }
        };
        set(15, self.content_type.is_some());
        set(14, self.content_encoding.is_some());
        set(13, self.headers.is_some());
        set(12, self.delivery_mode.is_some());
        set(11, self.priority.is_some());
        set(10, self.correlation_id.is_some());
        set(9, self.reply_to.is_some());
        set(8, self.expiration.is_some());
        set(7, self.message_id.is_some());
        set(6, self.timestamp.is_some());
        set(5, self.kind.is_some());
        set(4, self.user_id.is_some());
        set(3, self.app_id.is_some());
        flags
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.write_u16(self.flags());
        if let Some(v) = &self.content_type {
            enc.write_short_str(v)?;
        }
        if let Some(v) = &self.content_encoding {
            enc.write_short_str(v)?;
        }
        if let Some(v) = &self.headers {
            v.encode(enc);
        }
        if let Some(v) = self.delivery_mode {
            enc.write_u8(v);
        }
        if let Some(v) = self.priority {
            enc.write_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            enc.write_short_str(v)?;
        }
        if let Some(v) = &self.reply_to {
            enc.write_short_str(v)?;
        }
        if let Some(v) = &self.expiration {
            enc.write_short_str(v)?;
        }
        if let Some(v) = &self.message_id {
            enc.write_short_str(v)?;
        }
        if let Some(v) = self.timestamp {
            enc.write_i64(v);
        }
        if let Some(v) = &self.kind {
            enc.write_short_str(v)?;
        }
        if let Some(v) = &self.user_id {
            enc.write_short_str(v)?;
        }
        if let Some(v) = &self.app_id {
            enc.write_short_str(v)?;
        }
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let flags = dec.read_u16()?;
        let bit = |n: u16| flags & (1 << n) != 0;

        let mut props = Self::default();
        if bit(15) {
            props.content_type = Some(dec.read_short_str()?);
        }
        if bit(14) {
            props.content_encoding = Some(dec.read_short_str()?);
        }
        if bit(13) {
            props.headers = Some(FieldTable::decode(dec)?);
        }
        if bit(12) {
            props.delivery_mode = Some(dec.read_u8()?);
        }
        if bit(11) {
            props.priority = Some(dec.read_u8()?);
        }
        if bit(10) {
            props.correlation_id = Some(dec.read_short_str()?);
        }
        if bit(9) {
            props.reply_to = Some(dec.read_short_str()?);
        }
        if bit(8) {
            props.expiration = Some(dec.read_short_str()?);
        }
        if bit(7) {
            props.message_id = Some(dec.read_short_str()?);
        }
        if bit(6) {
            props.timestamp = Some(dec.read_i64()?);
        }
        if bit(5) {
            props.kind = Some(dec.read_short_str()?);
        }
        if bit(4) {
            props.user_id = Some(dec.read_short_str()?);
        }
        if bit(3) {
            props.app_id = Some(dec.read_short_str()?);
        }
        Ok(props)
    }
}

/// A decoded content header frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    /// Class of the content-bearing method (60 for `Basic`)
    pub class_id: u16,
    /// Total size of the body that follows, possibly split across frames
    pub body_size: u64,
    /// Message properties
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// Build a header for `Basic` class content.
    #[must_use]
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self { class_id: crate::methods::ClassId::Basic.to_u16(), body_size, properties }
    }

    /// Encode the header frame payload.
    pub fn encode(&self) -> Result<bytes::Bytes> {
        let mut enc = Encoder::new();
        enc.write_u16(self.class_id);
        enc.write_u16(0); // weight, unused
        enc.write_u64(self.body_size);
        self.properties.encode(&mut enc)?;
        Ok(enc.finish())
    }

    /// Decode a header frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(payload);
        let class_id = dec.read_u16()?;
        let _weight = dec.read_u16()?;
        let body_size = dec.read_u64()?;
        let properties = BasicProperties::decode(&mut dec)?;
        Ok(Self { class_id, body_size, properties })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_short() -> impl Strategy<Value = String> {
        "[ -~]{0,48}"
    }

    fn arb_properties() -> impl Strategy<Value = BasicProperties> {
        (
            (
                prop::option::of(arb_short()),
                prop::option::of(arb_short()),
                prop::option::of(any::<u8>()),
                prop::option::of(0u8..=9),
                prop::option::of(arb_short()),
                prop::option::of(arb_short()),
                prop::option::of(arb_short()),
            ),
            (
                prop::option::of(arb_short()),
                prop::option::of(any::<i64>()),
                prop::option::of(arb_short()),
                prop::option::of(arb_short()),
                prop::option::of(arb_short()),
            ),
        )
            .prop_map(
                |(
                    (content_type, content_encoding, delivery_mode, priority, correlation_id, reply_to, expiration),
                    (message_id, timestamp, kind, user_id, app_id),
                )| BasicProperties {
                    content_type,
                    content_encoding,
                    headers: None,
                    delivery_mode,
                    priority,
                    correlation_id,
                    reply_to,
                    expiration,
                    message_id,
                    timestamp,
                    kind,
                    user_id,
                    app_id,
                },
            )
    }

    proptest! {
        #[test]
        fn header_round_trip(body_size in any::<u64>(), props in arb_properties()) {
            let header = ContentHeader::basic(body_size, props);
            let wire = header.encode().expect("should encode");
            let parsed = ContentHeader::decode(&wire).expect("should decode");
            prop_assert_eq!(parsed, header);
        }
    }

    #[test]
    fn empty_properties_encode_zero_flags() {
        let header = ContentHeader::basic(5, BasicProperties::default());
        let wire = header.encode().unwrap();
        // class, weight, body size, flag word
        assert_eq!(wire.len(), 2 + 2 + 8 + 2);
        assert_eq!(&wire[12..14], &[0, 0]);
    }

    #[test]
    fn headers_table_round_trips() {
        let mut headers = FieldTable::new();
        headers.insert("x-origin", "web");
        headers.insert("x-retries", 3_i32);

        let props = BasicProperties { headers: Some(headers), ..Default::default() };
        let header = ContentHeader::basic(0, props);
        let parsed = ContentHeader::decode(&header.encode().unwrap()).unwrap();
        assert_eq!(parsed, header);
    }
}
