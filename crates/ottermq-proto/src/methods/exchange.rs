//! Exchange class (40): declaring and deleting exchanges.

use crate::{
    codec::{Decoder, Encoder},
    errors::{ProtocolError, Result},
    methods::ClassId,
    table::FieldTable,
};

/// Methods of the exchange class.
///
/// Declare packs five booleans into one flag octet (LSB first: passive,
/// durable, auto-delete, internal, no-wait); Delete packs two (if-unused,
/// no-wait).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeMethod {
    /// Create an exchange, or verify one exists when `passive`
    Declare {
        /// Exchange name
        exchange: String,
        /// Exchange type string: direct, fanout, topic or headers
        kind: String,
        /// Only check existence, never create
        passive: bool,
        /// Survive broker restart (stored but not enforced here)
        durable: bool,
        /// Delete when the last binding is removed
        auto_delete: bool,
        /// Refuse direct publishes; only other exchanges may route here
        internal: bool,
        /// Do not send Declare-Ok
        no_wait: bool,
        /// Declaration arguments
        arguments: FieldTable,
    },

    /// Declare succeeded
    DeclareOk,

    /// Delete an exchange
    Delete {
        /// Exchange name
        exchange: String,
        /// Fail with 406 if the exchange still has bindings
        if_unused: bool,
        /// Do not send Delete-Ok
        no_wait: bool,
    },

    /// Delete succeeded
    DeleteOk,
}

impl ExchangeMethod {
    /// Method id within class 40.
    #[must_use]
    pub fn method_id(&self) -> u16 {
        match self {
            Self::Declare { .. } => 10,
            Self::DeclareOk => 11,
            Self::Delete { .. } => 20,
            Self::DeleteOk => 21,
        }
    }

    /// Dotted name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Declare { .. } => "exchange.declare",
            Self::DeclareOk => "exchange.declare-ok",
            Self::Delete { .. } => "exchange.delete",
            Self::DeleteOk => "exchange.delete-ok",
        }
    }

    pub(crate) fn decode(method_id: u16, dec: &mut Decoder<'_>) -> Result<Self> {
        match method_id {
            10 => {
                let _ticket = dec.read_u16()?;
                let exchange = dec.read_short_str()?;
                let kind = dec.read_short_str()?;
                let passive = dec.read_bit()?;
                let durable = dec.read_bit()?;
                let auto_delete = dec.read_bit()?;
                let internal = dec.read_bit()?;
                let no_wait = dec.read_bit()?;
                let arguments = FieldTable::decode(dec)?;
                Ok(Self::Declare {
                    exchange,
                    kind,
                    passive,
                    durable,
                    auto_delete,
                    internal,
                    no_wait,
                    arguments,
                })
            },
            11 => Ok(Self::DeclareOk),
            20 => {
                let _ticket = dec.read_u16()?;
                let exchange = dec.read_short_str()?;
                let if_unused = dec.read_bit()?;
                let no_wait = dec.read_bit()?;
                Ok(Self::Delete { exchange, if_unused, no_wait })
            },
            21 => Ok(Self::DeleteOk),
            other => Err(ProtocolError::UnknownMethod {
                class_id: ClassId::Exchange.to_u16(),
                method_id: other,
            }),
        }
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Declare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(exchange)?;
                enc.write_short_str(kind)?;
                enc.write_bit(*passive);
                enc.write_bit(*durable);
                enc.write_bit(*auto_delete);
                enc.write_bit(*internal);
                enc.write_bit(*no_wait);
                arguments.encode(enc);
            },
            Self::DeclareOk | Self::DeleteOk => {},
            Self::Delete { exchange, if_unused, no_wait } => {
                enc.write_u16(0); // reserved: ticket
                enc.write_short_str(exchange)?;
                enc.write_bit(*if_unused);
                enc.write_bit(*no_wait);
            },
        }
        Ok(())
    }
}
