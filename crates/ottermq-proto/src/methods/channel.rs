//! Channel class (20): opening, flow control and closing channels.

use crate::{
    codec::{Decoder, Encoder},
    errors::{ProtocolError, Result},
    methods::ClassId,
};

/// Methods of the channel class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMethod {
    /// Open a new channel on this connection
    Open,

    /// Channel is ready for use
    OpenOk,

    /// Ask the peer to pause or resume content delivery
    Flow {
        /// True to start delivery, false to stop
        active: bool,
    },

    /// Confirm a flow change
    FlowOk {
        /// The flow state now in effect
        active: bool,
    },

    /// Close the channel, reporting any error that caused it
    Close {
        /// AMQP reply code
        reply_code: u16,
        /// Human-readable reason
        reply_text: String,
        /// Class of the offending method, or 0
        class_id: u16,
        /// Offending method, or 0
        method_id: u16,
    },

    /// Acknowledge a channel Close
    CloseOk,
}

impl ChannelMethod {
    /// Method id within class 20.
    #[must_use]
    pub fn method_id(&self) -> u16 {
        match self {
            Self::Open => 10,
            Self::OpenOk => 11,
            Self::Flow { .. } => 20,
            Self::FlowOk { .. } => 21,
            Self::Close { .. } => 40,
            Self::CloseOk => 41,
        }
    }

    /// Dotted name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "channel.open",
            Self::OpenOk => "channel.open-ok",
            Self::Flow { .. } => "channel.flow",
            Self::FlowOk { .. } => "channel.flow-ok",
            Self::Close { .. } => "channel.close",
            Self::CloseOk => "channel.close-ok",
        }
    }

    pub(crate) fn decode(method_id: u16, dec: &mut Decoder<'_>) -> Result<Self> {
        match method_id {
            10 => {
                let _reserved = dec.read_short_str()?;
                Ok(Self::Open)
            },
            11 => {
                let _reserved = dec.read_long_str()?;
                Ok(Self::OpenOk)
            },
            20 => Ok(Self::Flow { active: dec.read_bit()? }),
            21 => Ok(Self::FlowOk { active: dec.read_bit()? }),
            40 => Ok(Self::Close {
                reply_code: dec.read_u16()?,
                reply_text: dec.read_short_str()?,
                class_id: dec.read_u16()?,
                method_id: dec.read_u16()?,
            }),
            41 => Ok(Self::CloseOk),
            other => Err(ProtocolError::UnknownMethod {
                class_id: ClassId::Channel.to_u16(),
                method_id: other,
            }),
        }
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Open => enc.write_short_str("")?, // reserved
            Self::OpenOk => enc.write_long_str(&[]), // reserved
            Self::Flow { active } | Self::FlowOk { active } => enc.write_bit(*active),
            Self::Close { reply_code, reply_text, class_id, method_id } => {
                enc.write_u16(*reply_code);
                enc.write_short_str(reply_text)?;
                enc.write_u16(*class_id);
                enc.write_u16(*method_id);
            },
            Self::CloseOk => {},
        }
        Ok(())
    }
}
