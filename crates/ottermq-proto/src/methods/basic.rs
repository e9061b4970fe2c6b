//! Basic class (60): publishing, consuming and acknowledgement.

use crate::{
    codec::{Decoder, Encoder},
    errors::{ProtocolError, Result},
    methods::ClassId,
    table::FieldTable,
};

/// Methods of the basic class.
///
/// `Publish`, `Return`, `Deliver` and `Get-Ok` announce content: a header
/// frame and zero or more body frames follow on the same channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasicMethod {
    /// Bound the number of unacknowledged messages the peer will hold
    Qos {
        /// Prefetch window in octets (0 = no octet limit)
        prefetch_size: u32,
        /// Prefetch window in messages (0 = no message limit)
        prefetch_count: u16,
        /// Apply per channel rather than per consumer
        global: bool,
    },

    /// Qos accepted
    QosOk,

    /// Start a consumer on a queue
    Consume {
        /// Queue to consume from
        queue: String,
        /// Consumer identity; empty asks the server to generate one
        consumer_tag: String,
        /// Do not deliver messages published on this connection
        no_local: bool,
        /// Deliveries need no acknowledgement
        no_ack: bool,
        /// Request exclusive consumer access to the queue
        exclusive: bool,
        /// Do not send Consume-Ok
        no_wait: bool,
        /// Consume arguments
        arguments: FieldTable,
    },

    /// Consumer started
    ConsumeOk {
        /// The consumer's tag
        consumer_tag: String,
    },

    /// Cancel a consumer
    Cancel {
        /// Tag of the consumer to cancel
        consumer_tag: String,
        /// Do not send Cancel-Ok
        no_wait: bool,
    },

    /// Consumer cancelled
    CancelOk {
        /// The cancelled consumer's tag
        consumer_tag: String,
    },

    /// Publish a message (content follows; no reply)
    Publish {
        /// Target exchange; empty selects the default exchange
        exchange: String,
        /// Routing key (queue name on the default exchange)
        routing_key: String,
        /// Return the message if it cannot be routed to any queue
        mandatory: bool,
        /// Return the message if it cannot be delivered immediately
        immediate: bool,
    },

    /// Server hands back an unroutable mandatory publish (content follows)
    Return {
        /// Why the message came back (313 NO-ROUTE)
        reply_code: u16,
        /// Human-readable reason
        reply_text: String,
        /// Exchange it was published to
        exchange: String,
        /// Routing key it was published with
        routing_key: String,
    },

    /// Server delivers a message to a consumer (content follows)
    Deliver {
        /// Consumer receiving the message
        consumer_tag: String,
        /// Channel-scoped tag for ack/reject
        delivery_tag: u64,
        /// The message was delivered before and requeued
        redelivered: bool,
        /// Exchange it was published to
        exchange: String,
        /// Routing key it was published with
        routing_key: String,
    },

    /// Synchronously fetch one message from a queue
    Get {
        /// Queue to fetch from
        queue: String,
        /// The fetch needs no acknowledgement
        no_ack: bool,
    },

    /// Fetch succeeded (content follows)
    GetOk {
        /// Channel-scoped tag for ack/reject
        delivery_tag: u64,
        /// The message was delivered before and requeued
        redelivered: bool,
        /// Exchange it was published to
        exchange: String,
        /// Routing key it was published with
        routing_key: String,
        /// Messages left in the queue
        message_count: u32,
    },

    /// Fetch found the queue empty
    GetEmpty,

    /// Acknowledge one or more deliveries
    Ack {
        /// Delivery to acknowledge
        delivery_tag: u64,
        /// Also acknowledge all earlier tags on this channel
        multiple: bool,
    },

    /// Refuse a single delivery
    Reject {
        /// Delivery to refuse
        delivery_tag: u64,
        /// Put the message back at the head of its queue
        requeue: bool,
    },

    /// Redeliver all unacknowledged messages on this channel
    Recover {
        /// Requeue instead of redelivering to the same consumer
        requeue: bool,
    },

    /// Recover done
    RecoverOk,

    /// Refuse one or more deliveries (RabbitMQ extension of Reject)
    Nack {
        /// Delivery to refuse
        delivery_tag: u64,
        /// Also refuse all earlier tags on this channel
        multiple: bool,
        /// Put the messages back at the head of their queues
        requeue: bool,
    },
}

impl BasicMethod {
    /// Method id within class 60.
    #[must_use]
    pub fn method_id(&self) -> u16 {
        match self {
            Self::Qos { .. } => 10,
            Self::QosOk => 11,
            Self::Consume { .. } => 20,
            Self::ConsumeOk { .. } => 21,
            Self::Cancel { .. } => 30,
            Self::CancelOk { .. } => 31,
            Self::Publish { .. } => 40,
            Self::Return { .. } => 50,
            Self::Deliver { .. } => 60,
            Self::Get { .. } => 70,
            Self::GetOk { .. } => 71,
            Self::GetEmpty => 72,
            Self::Ack { .. } => 80,
            Self::Reject { .. } => 90,
            Self::Recover { .. } => 110,
            Self::RecoverOk => 111,
            Self::Nack { .. } => 120,
        }
    }

    /// Dotted name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Qos { .. } => "basic.qos",
            Self::QosOk => "basic.qos-ok",
            Self::Consume { .. } => "basic.consume",
            Self::ConsumeOk { .. } => "basic.consume-ok",
            Self::Cancel { .. } => "basic.cancel",
            Self::CancelOk { .. } => "basic.cancel-ok",
            Self::Publish { .. } => "basic.publish",
            Self::Return { .. } => "basic.return",
            Self::Deliver { .. } => "basic.deliver",
            Self::Get { .. } => "basic.get",
            Self::GetOk { .. } => "basic.get-ok",
            Self::GetEmpty => "basic.get-empty",
            Self::Ack { .. } => "basic.ack",
            Self::Reject { .. } => "basic.reject",
            Self::Recover { .. } => "basic.recover",
            Self::RecoverOk => "basic.recover-ok",
            Self::Nack { .. } => "basic.nack",
        }
    }

    pub(crate) fn decode(method_id: u16, dec: &mut Decoder<'_>) -> Result<Self> {
        match method_id {
            10 => Ok(Self::Qos {
                prefetch_size: dec.read_u32()?,
                prefetch_count: dec.read_u16()?,
                global: dec.read_bit()?,
            }),
            11 => Ok(Self::QosOk),
            20 => {
                let _ticket = dec.read_u16()?;
                let queue = dec.read_short_str()?;
                let consumer_tag = dec.read_short_str()?;
                let no_local = dec.read_bit()?;
                let no_ack = dec.read_bit()?;
                let exclusive = dec.read_bit()?;
                let no_wait = dec.read_bit()?;
                let arguments = FieldTable::decode(dec)?;
                Ok(Self::Consume {
                    queue,
                    consumer_tag,
                    no_local,
                    no_ack,
                    exclusive,
                    no_wait,
                    arguments,
                })
            },
            21 => Ok(Self::ConsumeOk { consumer_tag: dec.read_short_str()? }),
            30 => Ok(Self::Cancel {
                consumer_tag: dec.read_short_str()?,
                no_wait: dec.read_bit()?,
            }),
            31 => Ok(Self::CancelOk { consumer_tag: dec.read_short_str()? }),
            40 => {
                let _ticket = dec.read_u16()?;
                let exchange = dec.read_short_str()?;
                let routing_key = dec.read_short_str()?;
                let mandatory = dec.read_bit()?;
                let immediate = dec.read_bit()?;
                Ok(Self::Publish { exchange, routing_key, mandatory, immediate })
            },
            50 => Ok(Self::Return {
                reply_code: dec.read_u16()?,
                reply_text: dec.read_short_str()?,
                exchange: dec.read_short_str()?,
                routing_key: dec.read_short_str()?,
            }),
            60 => Ok(Self::Deliver {
                consumer_tag: dec.read_short_str()?,
                delivery_tag: dec.read_u64()?,
                redelivered: dec.read_bit()?,
                exchange: dec.read_short_str()?,
                routing_key: dec.read_short_str()?,
            }),
            70 => {
                let _ticket = dec.read_u16()?;
                let queue = dec.read_short_str()?;
                let no_ack = dec.read_bit()?;
                Ok(Self::Get { queue, no_ack })
            },
            71 => Ok(Self::GetOk {
                delivery_tag: dec.read_u64()?,
                redelivered: dec.read_bit()?,
                exchange: dec.read_short_str()?,
                routing_key: dec.read_short_str()?,
                message_count: dec.read_u32()?,
            }),
            72 => {
                let _reserved = dec.read_short_str()?;
                Ok(Self::GetEmpty)
            },
            80 => Ok(Self::Ack { delivery_tag: dec.read_u64()?, multiple: dec.read_bit()? }),
            90 => Ok(Self::Reject { delivery_tag: dec.read_u64()?, requeue: dec.read_bit()? }),
            110 => Ok(Self::Recover { requeue: dec.read_bit()? }),
            111 => Ok(Self::RecoverOk),
            120 => Ok(Self::Nack {
                delivery_tag: dec.read_u64()?,
                multiple: dec.read_bit()?,
                requeue: dec.read_bit()?,
            }),
            other => Err(ProtocolError::UnknownMethod {
                class_id: ClassId::Basic.to_u16(),
                method_id: other,
            }),
        }
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Qos { prefetch_size, prefetch_count, global } => {
                enc.write_u32(*prefetch_size);
                enc.write_u16(*prefetch_count);
                enc.write_bit(*global);
            },
            Self::QosOk | Self::RecoverOk => {},
            Self::Consume { queue, consumer_tag, no_local, no_ack, exclusive, no_wait, arguments } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(queue)?;
                enc.write_short_str(consumer_tag)?;
                enc.write_bit(*no_local);
                enc.write_bit(*no_ack);
                enc.write_bit(*exclusive);
                enc.write_bit(*no_wait);
                arguments.encode(enc);
            },
            Self::ConsumeOk { consumer_tag } | Self::CancelOk { consumer_tag } => {
                enc.write_short_str(consumer_tag)?;
            },
            Self::Cancel { consumer_tag, no_wait } => {
                enc.write_short_str(consumer_tag)?;
                enc.write_bit(*no_wait);
            },
            Self::Publish { exchange, routing_key, mandatory, immediate } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(exchange)?;
                enc.write_short_str(routing_key)?;
                enc.write_bit(*mandatory);
                enc.write_bit(*immediate);
            },
            Self::Return { reply_code, reply_text, exchange, routing_key } => {
                enc.write_u16(*reply_code);
                enc.write_short_str(reply_text)?;
                enc.write_short_str(exchange)?;
                enc.write_short_str(routing_key)?;
            },
            Self::Deliver { consumer_tag, delivery_tag, redelivered, exchange, routing_key } => {
                enc.write_short_str(consumer_tag)?;
                enc.write_u64(*delivery_tag);
                enc.write_bit(*redelivered);
                enc.write_short_str(exchange)?;
                enc.write_short_str(routing_key)?;
            },
            Self::Get { queue, no_ack } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(queue)?;
                enc.write_bit(*no_ack);
            },
            Self::GetOk { delivery_tag, redelivered, exchange, routing_key, message_count } => {
                enc.write_u64(*delivery_tag);
                enc.write_bit(*redelivered);
                enc.write_short_str(exchange)?;
                enc.write_short_str(routing_key)?;
                enc.write_u32(*message_count);
            },
            Self::GetEmpty => {
                enc.write_short_str("")?; // reserved: cluster-id
            },
            Self::Ack { delivery_tag, multiple } => {
                enc.write_u64(*delivery_tag);
                enc.write_bit(*multiple);
            },
            Self::Reject { delivery_tag, requeue } => {
                enc.write_u64(*delivery_tag);
                enc.write_bit(*requeue);
            },
            Self::Recover { requeue } => enc.write_bit(*requeue),
            Self::Nack { delivery_tag, multiple, requeue } => {
                enc.write_u64(*delivery_tag);
                enc.write_bit(*multiple);
                enc.write_bit(*requeue);
            },
        }
        Ok(())
    }
}
