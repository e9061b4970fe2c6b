//! Queue class (50): declaring, binding, purging and deleting queues.

use crate::{
    codec::{Decoder, Encoder},
    errors::{ProtocolError, Result},
    methods::ClassId,
    table::FieldTable,
};

/// Methods of the queue class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMethod {
    /// Create a queue, or verify one exists when `passive`
    Declare {
        /// Queue name; empty asks the server to generate one
        queue: String,
        /// Only check existence, never create
        passive: bool,
        /// Survive broker restart (stored but not enforced here)
        durable: bool,
        /// Restrict the queue to this connection and delete it on close
        exclusive: bool,
        /// Delete when the last consumer cancels
        auto_delete: bool,
        /// Do not send Declare-Ok
        no_wait: bool,
        /// Declaration arguments (e.g. `x-message-ttl`)
        arguments: FieldTable,
    },

    /// Declare succeeded
    DeclareOk {
        /// Actual queue name
        queue: String,
        /// Messages currently queued
        message_count: u32,
        /// Active consumers
        consumer_count: u32,
    },

    /// Bind a queue to an exchange under a routing key
    Bind {
        /// Queue name
        queue: String,
        /// Source exchange
        exchange: String,
        /// Routing key for direct exchanges; ignored by fanout
        routing_key: String,
        /// Do not send Bind-Ok
        no_wait: bool,
        /// Binding arguments
        arguments: FieldTable,
    },

    /// Bind succeeded
    BindOk,

    /// Drop all ready messages from a queue
    Purge {
        /// Queue name
        queue: String,
        /// Do not send Purge-Ok
        no_wait: bool,
    },

    /// Purge succeeded
    PurgeOk {
        /// Messages removed
        message_count: u32,
    },

    /// Delete a queue
    Delete {
        /// Queue name
        queue: String,
        /// Fail with 406 if consumers are attached
        if_unused: bool,
        /// Fail with 406 if messages remain
        if_empty: bool,
        /// Do not send Delete-Ok
        no_wait: bool,
    },

    /// Delete succeeded
    DeleteOk {
        /// Messages discarded with the queue
        message_count: u32,
    },

    /// Remove a binding
    Unbind {
        /// Queue name
        queue: String,
        /// Source exchange
        exchange: String,
        /// Routing key of the binding to remove
        routing_key: String,
        /// Binding arguments
        arguments: FieldTable,
    },

    /// Unbind succeeded
    UnbindOk,
}

impl QueueMethod {
    /// Method id within class 50.
    #[must_use]
    pub fn method_id(&self) -> u16 {
        match self {
            Self::Declare { .. } => 10,
            Self::DeclareOk { .. } => 11,
            Self::Bind { .. } => 20,
            Self::BindOk => 21,
            Self::Purge { .. } => 30,
            Self::PurgeOk { .. } => 31,
            Self::Delete { .. } => 40,
            Self::DeleteOk { .. } => 41,
            Self::Unbind { .. } => 50,
            Self::UnbindOk => 51,
        }
    }

    /// Dotted name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Declare { .. } => "queue.declare",
            Self::DeclareOk { .. } => "queue.declare-ok",
            Self::Bind { .. } => "queue.bind",
            Self::BindOk => "queue.bind-ok",
            Self::Purge { .. } => "queue.purge",
            Self::PurgeOk { .. } => "queue.purge-ok",
            Self::Delete { .. } => "queue.delete",
            Self::DeleteOk { .. } => "queue.delete-ok",
            Self::Unbind { .. } => "queue.unbind",
            Self::UnbindOk => "queue.unbind-ok",
        }
    }

    pub(crate) fn decode(method_id: u16, dec: &mut Decoder<'_>) -> Result<Self> {
        match method_id {
            10 => {
                let _ticket = dec.read_u16()?;
                let queue = dec.read_short_str()?;
                let passive = dec.read_bit()?;
                let durable = dec.read_bit()?;
                let exclusive = dec.read_bit()?;
                let auto_delete = dec.read_bit()?;
                let no_wait = dec.read_bit()?;
                let arguments = FieldTable::decode(dec)?;
                Ok(Self::Declare {
                    queue,
                    passive,
                    durable,
                    exclusive,
                    auto_delete,
                    no_wait,
                    arguments,
                })
            },
            11 => Ok(Self::DeclareOk {
                queue: dec.read_short_str()?,
                message_count: dec.read_u32()?,
                consumer_count: dec.read_u32()?,
            }),
            20 => {
                let _ticket = dec.read_u16()?;
                let queue = dec.read_short_str()?;
                let exchange = dec.read_short_str()?;
                let routing_key = dec.read_short_str()?;
                let no_wait = dec.read_bit()?;
                let arguments = FieldTable::decode(dec)?;
                Ok(Self::Bind { queue, exchange, routing_key, no_wait, arguments })
            },
            21 => Ok(Self::BindOk),
            30 => {
                let _ticket = dec.read_u16()?;
                let queue = dec.read_short_str()?;
                let no_wait = dec.read_bit()?;
                Ok(Self::Purge { queue, no_wait })
            },
            31 => Ok(Self::PurgeOk { message_count: dec.read_u32()? }),
            40 => {
                let _ticket = dec.read_u16()?;
                let queue = dec.read_short_str()?;
                let if_unused = dec.read_bit()?;
                let if_empty = dec.read_bit()?;
                let no_wait = dec.read_bit()?;
                Ok(Self::Delete { queue, if_unused, if_empty, no_wait })
            },
            41 => Ok(Self::DeleteOk { message_count: dec.read_u32()? }),
            50 => {
                let _ticket = dec.read_u16()?;
                let queue = dec.read_short_str()?;
                let exchange = dec.read_short_str()?;
                let routing_key = dec.read_short_str()?;
                let arguments = FieldTable::decode(dec)?;
                Ok(Self::Unbind { queue, exchange, routing_key, arguments })
            },
            51 => Ok(Self::UnbindOk),
            other => Err(ProtocolError::UnknownMethod {
                class_id: ClassId::Queue.to_u16(),
                method_id: other,
            }),
        }
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Declare { queue, passive, durable, exclusive, auto_delete, no_wait, arguments } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(queue)?;
                enc.write_bit(*passive);
                enc.write_bit(*durable);
                enc.write_bit(*exclusive);
                enc.write_bit(*auto_delete);
                enc.write_bit(*no_wait);
                arguments.encode(enc);
            },
            Self::DeclareOk { queue, message_count, consumer_count } => {
                enc.write_short_str(queue)?;
                enc.write_u32(*message_count);
                enc.write_u32(*consumer_count);
            },
            Self::Bind { queue, exchange, routing_key, no_wait, arguments } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(queue)?;
                enc.write_short_str(exchange)?;
                enc.write_short_str(routing_key)?;
                enc.write_bit(*no_wait);
                arguments.encode(enc);
            },
            Self::BindOk | Self::UnbindOk => {},
            Self::Purge { queue, no_wait } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(queue)?;
                enc.write_bit(*no_wait);
            },
            Self::PurgeOk { message_count } | Self::DeleteOk { message_count } => {
                enc.write_u32(*message_count);
            },
            Self::Delete { queue, if_unused, if_empty, no_wait } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(queue)?;
                enc.write_bit(*if_unused);
                enc.write_bit(*if_empty);
                enc.write_bit(*no_wait);
            },
            Self::Unbind { queue, exchange, routing_key, arguments } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(queue)?;
                enc.write_short_str(exchange)?;
                enc.write_short_str(routing_key)?;
                arguments.encode(enc);
            },
        }
        Ok(())
    }
}
