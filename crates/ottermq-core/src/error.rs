//! Protocol-plane error types.
//!
//! Errors that reach a peer are [`AmqpException`]s: a reply code from the
//! AMQP table, a human-readable text, the offending class/method ids, and a
//! scope deciding whether the answer is `Channel.Close` or
//! `Connection.Close`. Internal errors (I/O, poisoned locks) never take this
//! path; they are logged and the connection is closed with 541.

use ottermq_proto::ProtocolError;
use thiserror::Error;

/// AMQP reply codes used by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// 311: content larger than the peer will accept
    ContentTooLarge = 311,
    /// 313: mandatory publish had no matching queue
    NoRoute = 313,
    /// 403: credentials or permissions refused
    AccessRefused = 403,
    /// 404: exchange or queue does not exist
    NotFound = 404,
    /// 405: entity is locked by another connection
    ResourceLocked = 405,
    /// 406: declare/delete precondition not met
    PreconditionFailed = 406,
    /// 501: malformed frame
    FrameError = 501,
    /// 502: frame was well-formed but its arguments were not
    SyntaxError = 502,
    /// 503: method invalid for the current state
    CommandInvalid = 503,
    /// 504: channel id invalid or channel not open
    ChannelError = 504,
    /// 505: frame type not expected in the current assembly state
    UnexpectedFrame = 505,
    /// 506: resource limits exceeded
    ResourceError = 506,
    /// 530: operation not allowed (bad vhost, channel limit)
    NotAllowed = 530,
    /// 540: method outside the supported table
    NotImplemented = 540,
    /// 541: internal invariant violation
    InternalError = 541,
}

impl ReplyCode {
    /// Numeric wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Constant name as it appears in the AMQP specification.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ContentTooLarge => "CONTENT-TOO-LARGE",
            Self::NoRoute => "NO-ROUTE",
            Self::AccessRefused => "ACCESS-REFUSED",
            Self::NotFound => "NOT-FOUND",
            Self::ResourceLocked => "RESOURCE-LOCKED",
            Self::PreconditionFailed => "PRECONDITION-FAILED",
            Self::FrameError => "FRAME-ERROR",
            Self::SyntaxError => "SYNTAX-ERROR",
            Self::CommandInvalid => "COMMAND-INVALID",
            Self::ChannelError => "CHANNEL-ERROR",
            Self::UnexpectedFrame => "UNEXPECTED-FRAME",
            Self::ResourceError => "RESOURCE-ERROR",
            Self::NotAllowed => "NOT-ALLOWED",
            Self::NotImplemented => "NOT-IMPLEMENTED",
            Self::InternalError => "INTERNAL-ERROR",
        }
    }

    /// Whether this code closes the whole connection rather than a channel.
    #[must_use]
    pub fn is_hard_error(self) -> bool {
        matches!(
            self,
            Self::FrameError
                | Self::SyntaxError
                | Self::CommandInvalid
                | Self::ChannelError
                | Self::UnexpectedFrame
                | Self::ResourceError
                | Self::NotAllowed
                | Self::NotImplemented
                | Self::InternalError
        )
    }
}

/// Scope of an exception: what the peer gets closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Answered with `Channel.Close` on the offending channel
    Channel,
    /// Answered with `Connection.Close` on channel 0
    Connection,
}

/// A protocol-plane error on its way to the peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} ({}): {text}", .code.name(), .code.to_u16())]
pub struct AmqpException {
    /// Reply code from the AMQP table
    pub code: ReplyCode,
    /// Human-readable reason
    pub text: String,
    /// Class of the offending method, or 0
    pub class_id: u16,
    /// Offending method, or 0
    pub method_id: u16,
    /// Channel or connection scope
    pub scope: ErrorScope,
}

impl AmqpException {
    /// Channel-scoped exception.
    #[must_use]
    pub fn channel(code: ReplyCode, text: impl Into<String>) -> Self {
        Self { code, text: text.into(), class_id: 0, method_id: 0, scope: ErrorScope::Channel }
    }

    /// Connection-scoped exception.
    #[must_use]
    pub fn connection(code: ReplyCode, text: impl Into<String>) -> Self {
        Self { code, text: text.into(), class_id: 0, method_id: 0, scope: ErrorScope::Connection }
    }

    /// Attach the offending method ids, echoed in the Close frame.
    #[must_use]
    pub fn with_method(mut self, class_id: u16, method_id: u16) -> Self {
        self.class_id = class_id;
        self.method_id = method_id;
        self
    }
}

impl From<ProtocolError> for AmqpException {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownMethod { class_id, method_id } => {
                Self::connection(ReplyCode::NotImplemented, err.to_string())
                    .with_method(class_id, method_id)
            },
            ProtocolError::UnknownClass { class_id } => {
                Self::connection(ReplyCode::NotImplemented, err.to_string())
                    .with_method(class_id, 0)
            },
            ProtocolError::FrameTooShort { .. }
            | ProtocolError::BadTerminator { .. }
            | ProtocolError::OversizeFrame { .. }
            | ProtocolError::UnknownFrameType { .. }
            | ProtocolError::BadProtocolHeader => {
                Self::connection(ReplyCode::FrameError, err.to_string())
            },
            ProtocolError::UnknownFieldType { .. }
            | ProtocolError::DecodeOverflow { .. }
            | ProtocolError::Utf8
            | ProtocolError::ShortStringTooLong { .. }
            | ProtocolError::BadSaslResponse => {
                Self::connection(ReplyCode::SyntaxError, err.to_string())
            },
        }
    }
}
