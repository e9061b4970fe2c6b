//! Messages in flight.

use bytes::Bytes;
use ottermq_proto::BasicProperties;

/// Random 128-bit message identity, assigned at enqueue.
///
/// Two publishes of identical content yield two distinct ids; nothing else
/// about a message is identifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(u128);

impl MessageId {
    /// Draw a fresh id from the OS RNG.
    ///
    /// # Panics
    ///
    /// Panics if the OS RNG fails; a broker without working randomness
    /// cannot mint message identities.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes)
            .expect("invariant: OS RNG failure is unrecoverable");
        Self(u128::from_be_bytes(bytes))
    }

    /// The raw 128-bit value.
    #[must_use]
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// One published message, owned by a queue FIFO or an unacked record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identity token assigned at enqueue
    pub id: MessageId,
    /// Exchange it was published to (empty for the default exchange)
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Content properties from the header frame
    pub properties: BasicProperties,
    /// Opaque body bytes
    pub body: Bytes,
    /// True once the message has been delivered and put back
    pub redelivered: bool,
}

impl Message {
    /// Mint a message with a fresh id.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: MessageId::random(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties,
            body: body.into(),
            redelivered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = Message::new("ex", "rk", BasicProperties::default(), "same body");
        let b = Message::new("ex", "rk", BasicProperties::default(), "same body");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn id_displays_as_32_hex_digits() {
        let id = MessageId::random();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
