//! Connection class (10): handshake, tuning and teardown.

use crate::{
    codec::{Decoder, Encoder},
    errors::{ProtocolError, Result},
    methods::ClassId,
    table::FieldTable,
};

/// Methods of the connection class.
///
/// The handshake runs Start → Start-Ok → (Secure → Secure-Ok) → Tune →
/// Tune-Ok → Open → Open-Ok, all on channel 0. Either peer may send Close
/// at any point after that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMethod {
    /// Server greeting opening SASL negotiation
    Start {
        /// Protocol major version (0)
        version_major: u8,
        /// Protocol minor version (9)
        version_minor: u8,
        /// Server identification and capability table
        server_properties: FieldTable,
        /// Space-separated SASL mechanisms, e.g. `"PLAIN"`
        mechanisms: String,
        /// Space-separated locales, e.g. `"en_US"`
        locales: String,
    },

    /// Client reply carrying the selected mechanism and credentials
    StartOk {
        /// Client identification table
        client_properties: FieldTable,
        /// Selected SASL mechanism
        mechanism: String,
        /// Opaque SASL response (PLAIN: `\0user\0pass`)
        response: Vec<u8>,
        /// Selected locale
        locale: String,
    },

    /// Additional SASL challenge (unused when PLAIN succeeds at Start-Ok)
    Secure {
        /// Challenge bytes for the client
        challenge: Vec<u8>,
    },

    /// Client answer to a Secure challenge
    SecureOk {
        /// SASL response bytes
        response: Vec<u8>,
    },

    /// Server's proposed connection limits
    Tune {
        /// Highest channel number the server accepts (0 = no limit)
        channel_max: u16,
        /// Largest frame payload the server accepts
        frame_max: u32,
        /// Desired heartbeat delay in seconds (0 = disabled)
        heartbeat: u16,
    },

    /// Client's accepted connection limits (each ≤ the server's offer)
    TuneOk {
        /// Accepted channel limit
        channel_max: u16,
        /// Accepted frame size
        frame_max: u32,
        /// Accepted heartbeat delay
        heartbeat: u16,
    },

    /// Select a virtual host
    Open {
        /// Virtual host path, e.g. `"/"`
        virtual_host: String,
    },

    /// Virtual host accepted; the connection is now running
    OpenOk,

    /// Orderly shutdown request, from either peer
    Close {
        /// AMQP reply code
        reply_code: u16,
        /// Human-readable reason
        reply_text: String,
        /// Class of the method that caused the close, or 0
        class_id: u16,
        /// Method that caused the close, or 0
        method_id: u16,
    },

    /// Acknowledge a Close; the socket drops after this
    CloseOk,
}

impl ConnectionMethod {
    /// Method id within class 10.
    #[must_use]
    pub fn method_id(&self) -> u16 {
        match self {
            Self::Start { .. } => 10,
            Self::StartOk { .. } => 11,
            Self::Secure { .. } => 20,
            Self::SecureOk { .. } => 21,
            Self::Tune { .. } => 30,
            Self::TuneOk { .. } => 31,
            Self::Open { .. } => 40,
            Self::OpenOk => 41,
            Self::Close { .. } => 50,
            Self::CloseOk => 51,
        }
    }

    /// Dotted name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "connection.start",
            Self::StartOk { .. } => "connection.start-ok",
            Self::Secure { .. } => "connection.secure",
            Self::SecureOk { .. } => "connection.secure-ok",
            Self::Tune { .. } => "connection.tune",
            Self::TuneOk { .. } => "connection.tune-ok",
            Self::Open { .. } => "connection.open",
            Self::OpenOk => "connection.open-ok",
            Self::Close { .. } => "connection.close",
            Self::CloseOk => "connection.close-ok",
        }
    }

    pub(crate) fn decode(method_id: u16, dec: &mut Decoder<'_>) -> Result<Self> {
        match method_id {
            10 => {
                let version_major = dec.read_u8()?;
                let version_minor = dec.read_u8()?;
                let server_properties = FieldTable::decode(dec)?;
                let mechanisms = long_str_text(dec)?;
                let locales = long_str_text(dec)?;
                Ok(Self::Start {
                    version_major,
                    version_minor,
                    server_properties,
                    mechanisms,
                    locales,
                })
            },
            11 => {
                let client_properties = FieldTable::decode(dec)?;
                let mechanism = dec.read_short_str()?;
                let response = dec.read_long_str()?;
                let locale = dec.read_short_str()?;
                Ok(Self::StartOk { client_properties, mechanism, response, locale })
            },
            20 => Ok(Self::Secure { challenge: dec.read_long_str()? }),
            21 => Ok(Self::SecureOk { response: dec.read_long_str()? }),
            30 => Ok(Self::Tune {
                channel_max: dec.read_u16()?,
                frame_max: dec.read_u32()?,
                heartbeat: dec.read_u16()?,
            }),
            31 => Ok(Self::TuneOk {
                channel_max: dec.read_u16()?,
                frame_max: dec.read_u32()?,
                heartbeat: dec.read_u16()?,
            }),
            40 => {
                let virtual_host = dec.read_short_str()?;
                let _reserved_capabilities = dec.read_short_str()?;
                let _reserved_insist = dec.read_bit()?;
                Ok(Self::Open { virtual_host })
            },
            41 => {
                let _reserved_known_hosts = dec.read_short_str()?;
                Ok(Self::OpenOk)
            },
            50 => Ok(Self::Close {
                reply_code: dec.read_u16()?,
                reply_text: dec.read_short_str()?,
                class_id: dec.read_u16()?,
                method_id: dec.read_u16()?,
            }),
            51 => Ok(Self::CloseOk),
            other => Err(ProtocolError::UnknownMethod {
                class_id: ClassId::Connection.to_u16(),
                method_id: other,
            }),
        }
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Start { version_major, version_minor, server_properties, mechanisms, locales } => {
                enc.write_u8(*version_major);
                enc.write_u8(*version_minor);
                server_properties.encode(enc);
                enc.write_long_str(mechanisms.as_bytes());
                enc.write_long_str(locales.as_bytes());
            },
            Self::StartOk { client_properties, mechanism, response, locale } => {
                client_properties.encode(enc);
                enc.write_short_str(mechanism)?;
                enc.write_long_str(response);
                enc.write_short_str(locale)?;
            },
            Self::Secure { challenge } => enc.write_long_str(challenge),
            Self::SecureOk { response } => enc.write_long_str(response),
            Self::Tune { channel_max, frame_max, heartbeat }
            | Self::TuneOk { channel_max, frame_max, heartbeat } => {
                enc.write_u16(*channel_max);
                enc.write_u32(*frame_max);
                enc.write_u16(*heartbeat);
            },
            Self::Open { virtual_host } => {
                enc.write_short_str(virtual_host)?;
                enc.write_short_str("")?; // reserved: capabilities
                enc.write_bit(false); // reserved: insist
            },
            Self::OpenOk => {
                enc.write_short_str("")?; // reserved: known-hosts
            },
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

fn long_str_text(dec: &mut Decoder<'_>) -> Result<String> {
    String::from_utf8(dec.read_long_str()?).map_err(|_| ProtocolError::Utf8)
}
