//! Per-channel state: content assembly, consumers and acknowledgement.
//!
//! A channel splits into two pieces with different sharing needs:
//!
//! - [`ChannelEngine`] is owned by the connection's read path. It runs the
//!   assembly state machine (`Idle → AwaitingHeader → AwaitingBody → Idle`)
//!   and tracks which consumer tags this channel registered.
//! - [`ChannelLink`] is shared (`Arc`) with every queue the channel consumes
//!   from. Queue dispatch running on *other* connections' tasks uses it to
//!   assign delivery tags, record unacked messages under prefetch limits,
//!   and push frames into this connection's outbound mailbox.
//!
//! Lock order: a queue's mutex may be held while taking a link's state
//! mutex, never the reverse.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use ottermq_proto::{
    BasicMethod, BasicProperties, ChannelMethod, ClassId, ContentHeader, FrameType, Method,
    RawFrame,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    delivery::content_frames,
    error::{AmqpException, ReplyCode},
    lock_unpoisoned,
    message::Message,
};

/// A delivered-but-unacknowledged message, retained until ack/reject.
#[derive(Debug, Clone)]
pub struct UnackedRecord {
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    /// The message itself, owned here until resolution
    pub message: Message,
    /// Consumer it was delivered to; empty for `Basic.Get`
    pub consumer_tag: String,
    /// Queue the message came from
    pub queue: String,
    /// When it was handed to the peer
    pub delivered_at: Instant,
}

#[derive(Debug)]
struct LinkState {
    next_delivery_tag: u64,
    /// Ordered by delivery tag (append-only between removals)
    unacked: Vec<UnackedRecord>,
    /// Per-consumer cap from `basic.qos(global=false)`; 0 = unlimited
    prefetch_consumer: u16,
    /// Whole-channel cap from `basic.qos(global=true)`; 0 = unlimited
    prefetch_channel: u16,
}

/// The shareable half of a channel, used by queue dispatch.
#[derive(Debug)]
pub struct ChannelLink {
    /// Connection that owns the channel
    pub connection_id: u64,
    /// Channel number
    pub channel_id: u16,
    /// Negotiated frame size, for body splitting
    pub frame_max: u32,
    outbound: UnboundedSender<RawFrame>,
    state: Mutex<LinkState>,
}

impl ChannelLink {
    /// Create a link for a freshly opened channel.
    #[must_use]
    pub fn new(
        connection_id: u64,
        channel_id: u16,
        frame_max: u32,
        outbound: UnboundedSender<RawFrame>,
    ) -> Self {
        Self {
            connection_id,
            channel_id,
            frame_max,
            outbound,
            state: Mutex::new(LinkState {
                next_delivery_tag: 1,
                unacked: Vec::new(),
                prefetch_consumer: 0,
                prefetch_channel: 0,
            }),
        }
    }

    /// Apply `basic.qos`.
    pub fn set_qos(&self, prefetch_count: u16, global: bool) {
        let mut state = lock_unpoisoned(&self.state);
        if global {
            state.prefetch_channel = prefetch_count;
        } else {
            state.prefetch_consumer = prefetch_count;
        }
    }

    /// Whether a delivery to `consumer_tag` would stay within prefetch.
    #[must_use]
    pub fn eligible(&self, consumer_tag: &str) -> bool {
        let state = lock_unpoisoned(&self.state);
        if state.prefetch_channel != 0 && state.unacked.len() >= state.prefetch_channel as usize
        {
            return false;
        }
        if state.prefetch_consumer != 0 {
            let held =
                state.unacked.iter().filter(|r| r.consumer_tag == consumer_tag).count();
            if held >= state.prefetch_consumer as usize {
                return false;
            }
        }
        true
    }

    /// Deliver `message` to a consumer: assign a tag, send the frame triple
    /// into the outbound mailbox, and record it as unacked unless `no_ack`.
    ///
    /// On failure (the connection's mailbox is gone, or the frames would not
    /// encode) the message is handed back so the queue can requeue it.
    pub fn deliver(
        &self,
        consumer_tag: &str,
        no_ack: bool,
        message: Message,
        queue: &str,
        now: Instant,
    ) -> Result<(), Message> {
        let mut state = lock_unpoisoned(&self.state);
        let delivery_tag = state.next_delivery_tag;

        let method = Method::Basic(BasicMethod::Deliver {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
        });

        let frames = match content_frames(
            self.channel_id,
            method,
            &message.properties,
            &message.body,
            self.frame_max,
        ) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::error!(channel = self.channel_id, %err, "failed to render delivery");
                return Err(message);
            },
        };

        for frame in frames {
            if self.outbound.send(frame).is_err() {
                return Err(message);
            }
        }

        state.next_delivery_tag += 1;
        if !no_ack {
            state.unacked.push(UnackedRecord {
                delivery_tag,
                message,
                consumer_tag: consumer_tag.to_string(),
                queue: queue.to_string(),
                delivered_at: now,
            });
        }
        Ok(())
    }

    /// Assign a tag for a `Basic.Get` and render the Get-Ok frame triple.
    ///
    /// Frames are returned (not sent) so the engine can keep them ordered
    /// with its other replies.
    pub fn deliver_get(
        &self,
        message: Message,
        no_ack: bool,
        queue: &str,
        remaining: u32,
        now: Instant,
    ) -> Result<Vec<RawFrame>, AmqpException> {
        let mut state = lock_unpoisoned(&self.state);
        let delivery_tag = state.next_delivery_tag;

        let method = Method::Basic(BasicMethod::GetOk {
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            message_count: remaining,
        });

        let frames = content_frames(
            self.channel_id,
            method,
            &message.properties,
            &message.body,
            self.frame_max,
        )
        .map_err(|err| {
            AmqpException::connection(ReplyCode::InternalError, err.to_string())
        })?;

        state.next_delivery_tag += 1;
        if !no_ack {
            state.unacked.push(UnackedRecord {
                delivery_tag,
                message,
                consumer_tag: String::new(),
                queue: queue.to_string(),
                delivered_at: now,
            });
        }
        Ok(frames)
    }

    /// Resolve `basic.ack`: remove and return the acknowledged records.
    ///
    /// `multiple` acknowledges every tag ≤ `delivery_tag`; tag 0 with
    /// `multiple` acknowledges everything outstanding.
    pub fn ack(
        &self,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<Vec<UnackedRecord>, AmqpException> {
        let mut state = lock_unpoisoned(&self.state);
        if multiple {
            let upto = if delivery_tag == 0 { u64::MAX } else { delivery_tag };
            let (acked, kept): (Vec<_>, Vec<_>) =
                state.unacked.drain(..).partition(|r| r.delivery_tag <= upto);
            state.unacked = kept;
            Ok(acked)
        } else {
            match state.unacked.iter().position(|r| r.delivery_tag == delivery_tag) {
                Some(index) => Ok(vec![state.unacked.remove(index)]),
                None => Err(AmqpException::channel(
                    ReplyCode::PreconditionFailed,
                    format!("unknown delivery tag {delivery_tag}"),
                )),
            }
        }
    }

    /// Resolve `basic.reject` / `basic.nack`: remove the refused records.
    /// Identical bookkeeping to [`Self::ack`]; the caller decides whether
    /// the messages are requeued or discarded.
    pub fn reject(
        &self,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<Vec<UnackedRecord>, AmqpException> {
        self.ack(delivery_tag, multiple)
    }

    /// Drain every unacked record, in delivery order. Used by
    /// `basic.recover` and channel teardown.
    #[must_use]
    pub fn drain_unacked(&self) -> Vec<UnackedRecord> {
        let mut state = lock_unpoisoned(&self.state);
        std::mem::take(&mut state.unacked)
    }

    /// Outstanding unacked records on this channel.
    #[must_use]
    pub fn unacked_len(&self) -> usize {
        lock_unpoisoned(&self.state).unacked.len()
    }
}

/// What a channel hands the connection engine once a frame (or a whole
/// content sequence) is ready for processing.
#[derive(Debug)]
pub enum ChannelInput {
    /// A complete non-content method
    Method(Method),
    /// A fully assembled publish
    Publish {
        /// The `basic.publish` that announced the content
        publish: BasicMethod,
        /// Properties from the content header
        properties: BasicProperties,
        /// Concatenated body bytes
        body: Bytes,
    },
}

#[derive(Debug)]
enum Assembly {
    Idle,
    AwaitingHeader {
        publish: BasicMethod,
    },
    AwaitingBody {
        publish: BasicMethod,
        properties: BasicProperties,
        body: BytesMut,
        body_size: u64,
    },
}

/// The read-path half of a channel: assembly plus consumer bookkeeping.
#[derive(Debug)]
pub struct ChannelEngine {
    id: u16,
    assembly: Assembly,
    closing: bool,
    link: Arc<ChannelLink>,
    /// consumer tag → queue name
    consumers: HashMap<String, String>,
    consumer_seq: u64,
}

impl ChannelEngine {
    /// Open a channel with its shareable link.
    #[must_use]
    pub fn new(id: u16, link: Arc<ChannelLink>) -> Self {
        Self {
            id,
            assembly: Assembly::Idle,
            closing: false,
            link,
            consumers: HashMap::new(),
            consumer_seq: 0,
        }
    }

    /// Channel number.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The shareable delivery link.
    #[must_use]
    pub fn link(&self) -> &Arc<ChannelLink> {
        &self.link
    }

    /// Mark the channel as closing (server sent `Channel.Close`). In-flight
    /// assembly is discarded; only `Channel.Close-Ok` will be surfaced.
    pub fn set_closing(&mut self) {
        self.closing = true;
        self.assembly = Assembly::Idle;
    }

    /// True while awaiting the peer's `Channel.Close-Ok`.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Register a consumer tag for `queue`, generating a tag if the client
    /// sent none. Returns the effective tag, or `None` if the tag is taken.
    pub fn register_consumer(&mut self, tag: &str, queue: &str) -> Option<String> {
        let tag = if tag.is_empty() {
            self.consumer_seq += 1;
            format!("ctag-{}-{}", self.id, self.consumer_seq)
        } else {
            tag.to_string()
        };
        if self.consumers.contains_key(&tag) {
            return None;
        }
        self.consumers.insert(tag.clone(), queue.to_string());
        Some(tag)
    }

    /// Remove a consumer registration. Returns the queue it consumed from.
    pub fn remove_consumer(&mut self, tag: &str) -> Option<String> {
        self.consumers.remove(tag)
    }

    /// Iterate `(consumer_tag, queue)` pairs, for teardown.
    pub fn consumers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.consumers.iter().map(|(t, q)| (t.as_str(), q.as_str()))
    }

    /// Take all consumer registrations, leaving the map empty.
    #[must_use]
    pub fn take_consumers(&mut self) -> HashMap<String, String> {
        std::mem::take(&mut self.consumers)
    }

    /// Feed one frame through the assembly state machine.
    ///
    /// Returns `Ok(None)` while more frames are needed (or the frame was
    /// swallowed by the closing state), `Ok(Some(_))` once a method or a
    /// complete content sequence is ready.
    ///
    /// # Errors
    ///
    /// 505 UNEXPECTED-FRAME for frames out of assembly order, 503
    /// COMMAND-INVALID for server-to-client content methods, plus whatever
    /// the codec rejects.
    pub fn accept_frame(&mut self, frame: &RawFrame) -> Result<Option<ChannelInput>, AmqpException> {
        match frame.kind {
            FrameType::Method => self.accept_method(frame),
            FrameType::Header => self.accept_header(frame),
            FrameType::Body => self.accept_body(frame),
            // Heartbeats are connection-scoped; the connection engine never
            // routes them here.
            FrameType::Heartbeat => Ok(None),
        }
    }

    fn accept_method(&mut self, frame: &RawFrame) -> Result<Option<ChannelInput>, AmqpException> {
        let method = Method::decode(&frame.payload)?;

        if self.closing {
            if matches!(method, Method::Channel(ChannelMethod::CloseOk)) {
                return Ok(Some(ChannelInput::Method(method)));
            }
            tracing::debug!(channel = self.id, method = method.name(), "discarded while closing");
            return Ok(None);
        }

        if !matches!(self.assembly, Assembly::Idle) {
            return Err(AmqpException::connection(
                ReplyCode::UnexpectedFrame,
                "METHOD frame during content assembly",
            )
            .with_method(method.class_id(), method.method_id()));
        }

        if method.carries_content() {
            return match method {
                Method::Basic(publish @ BasicMethod::Publish { .. }) => {
                    self.assembly = Assembly::AwaitingHeader { publish };
                    Ok(None)
                },
                other => Err(AmqpException::connection(
                    ReplyCode::CommandInvalid,
                    format!("{} is server-to-client only", other.name()),
                )
                .with_method(other.class_id(), other.method_id())),
            };
        }

        Ok(Some(ChannelInput::Method(method)))
    }

    fn accept_header(&mut self, frame: &RawFrame) -> Result<Option<ChannelInput>, AmqpException> {
        if self.closing {
            return Ok(None);
        }

        let Assembly::AwaitingHeader { publish } =
            std::mem::replace(&mut self.assembly, Assembly::Idle)
        else {
            return Err(AmqpException::connection(
                ReplyCode::UnexpectedFrame,
                "HEADER frame without a content method",
            ));
        };

        let header = ContentHeader::decode(&frame.payload)?;
        if header.class_id != ClassId::Basic.to_u16() {
            return Err(AmqpException::connection(
                ReplyCode::UnexpectedFrame,
                format!("content header for class {} after basic.publish", header.class_id),
            ));
        }

        if header.body_size == 0 {
            return Ok(Some(ChannelInput::Publish {
                publish,
                properties: header.properties,
                body: Bytes::new(),
            }));
        }

        self.assembly = Assembly::AwaitingBody {
            publish,
            properties: header.properties,
            body: BytesMut::with_capacity(header.body_size.min(1 << 20) as usize),
            body_size: header.body_size,
        };
        Ok(None)
    }

    fn accept_body(&mut self, frame: &RawFrame) -> Result<Option<ChannelInput>, AmqpException> {
        if self.closing {
            return Ok(None);
        }

        let Assembly::AwaitingBody { publish, properties, mut body, body_size } =
            std::mem::replace(&mut self.assembly, Assembly::Idle)
        else {
            return Err(AmqpException::connection(
                ReplyCode::UnexpectedFrame,
                "BODY frame without a content header",
            ));
        };

        body.extend_from_slice(&frame.payload);
        let received = body.len() as u64;

        if received > body_size {
            return Err(AmqpException::connection(
                ReplyCode::UnexpectedFrame,
                format!("body of {received} bytes exceeds announced {body_size}"),
            ));
        }

        if received == body_size {
            return Ok(Some(ChannelInput::Publish {
                publish,
                properties,
                body: body.freeze(),
            }));
        }

        self.assembly = Assembly::AwaitingBody { publish, properties, body, body_size };
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn test_engine() -> (ChannelEngine, mpsc::UnboundedReceiver<RawFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(ChannelLink::new(1, 1, 131_072, tx));
        (ChannelEngine::new(1, link), rx)
    }

    fn publish_frame() -> RawFrame {
        let method = Method::Basic(BasicMethod::Publish {
            exchange: "ex1".into(),
            routing_key: "rk1".into(),
            mandatory: false,
            immediate: false,
        });
        method.into_frame(1).unwrap()
    }

    fn header_frame(body_size: u64) -> RawFrame {
        let header = ContentHeader::basic(body_size, BasicProperties::default());
        RawFrame::header(1, header.encode().unwrap())
    }

    #[test]
    fn publish_assembles_across_body_frames() {
        let (mut engine, _rx) = test_engine();

        assert!(engine.accept_frame(&publish_frame()).unwrap().is_none());
        assert!(engine.accept_frame(&header_frame(10)).unwrap().is_none());
        assert!(
            engine.accept_frame(&RawFrame::body(1, &b"hello"[..])).unwrap().is_none()
        );

        let done = engine.accept_frame(&RawFrame::body(1, &b"world"[..])).unwrap();
        match done {
            Some(ChannelInput::Publish { body, .. }) => {
                assert_eq!(body.as_ref(), b"helloworld");
            },
            other => panic!("expected assembled publish, got {other:?}"),
        }
    }

    #[test]
    fn empty_body_skips_body_phase() {
        let (mut engine, _rx) = test_engine();

        engine.accept_frame(&publish_frame()).unwrap();
        let done = engine.accept_frame(&header_frame(0)).unwrap();
        assert!(matches!(done, Some(ChannelInput::Publish { body, .. }) if body.is_empty()));
    }

    #[test]
    fn method_during_assembly_is_unexpected_frame() {
        let (mut engine, _rx) = test_engine();

        engine.accept_frame(&publish_frame()).unwrap();
        engine.accept_frame(&header_frame(5)).unwrap();

        let method = Method::Basic(BasicMethod::Ack { delivery_tag: 1, multiple: false });
        let err = engine.accept_frame(&method.into_frame(1).unwrap()).unwrap_err();
        assert_eq!(err.code, ReplyCode::UnexpectedFrame);
    }

    #[test]
    fn header_without_method_is_unexpected_frame() {
        let (mut engine, _rx) = test_engine();
        let err = engine.accept_frame(&header_frame(5)).unwrap_err();
        assert_eq!(err.code, ReplyCode::UnexpectedFrame);
    }

    #[test]
    fn body_without_header_is_unexpected_frame() {
        let (mut engine, _rx) = test_engine();
        let err = engine.accept_frame(&RawFrame::body(1, &b"x"[..])).unwrap_err();
        assert_eq!(err.code, ReplyCode::UnexpectedFrame);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let (mut engine, _rx) = test_engine();
        engine.accept_frame(&publish_frame()).unwrap();
        engine.accept_frame(&header_frame(3)).unwrap();

        let err = engine.accept_frame(&RawFrame::body(1, &b"toolong"[..])).unwrap_err();
        assert_eq!(err.code, ReplyCode::UnexpectedFrame);
    }

    #[test]
    fn server_to_client_content_method_rejected() {
        let (mut engine, _rx) = test_engine();
        let method = Method::Basic(BasicMethod::Deliver {
            consumer_tag: "t".into(),
            delivery_tag: 1,
            redelivered: false,
            exchange: "e".into(),
            routing_key: "r".into(),
        });
        let err = engine.accept_frame(&method.into_frame(1).unwrap()).unwrap_err();
        assert_eq!(err.code, ReplyCode::CommandInvalid);
    }

    #[test]
    fn closing_channel_only_surfaces_close_ok() {
        let (mut engine, _rx) = test_engine();
        engine.set_closing();

        let ack = Method::Basic(BasicMethod::Ack { delivery_tag: 1, multiple: false });
        assert!(engine.accept_frame(&ack.into_frame(1).unwrap()).unwrap().is_none());

        let close_ok = Method::Channel(ChannelMethod::CloseOk);
        let input = engine.accept_frame(&close_ok.into_frame(1).unwrap()).unwrap();
        assert!(matches!(
            input,
            Some(ChannelInput::Method(Method::Channel(ChannelMethod::CloseOk)))
        ));
    }

    #[test]
    fn delivery_tags_are_monotonic_from_one() {
        let (engine, mut rx) = test_engine();
        let now = Instant::now();

        let m1 = Message::new("ex", "rk", BasicProperties::default(), "a");
        let m2 = Message::new("ex", "rk", BasicProperties::default(), "b");
        engine.link().deliver("ctag", false, m1, "q", now).unwrap();
        engine.link().deliver("ctag", false, m2, "q", now).unwrap();

        let mut tags = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if frame.kind == FrameType::Method {
                if let Method::Basic(BasicMethod::Deliver { delivery_tag, .. }) =
                    Method::decode(&frame.payload).unwrap()
                {
                    tags.push(delivery_tag);
                }
            }
        }
        assert_eq!(tags, vec![1, 2]);
        assert_eq!(engine.link().unacked_len(), 2);
    }

    #[test]
    fn ack_multiple_clears_up_to_tag() {
        let (engine, _rx) = test_engine();
        let now = Instant::now();
        for body in ["a", "b", "c"] {
            let msg = Message::new("ex", "rk", BasicProperties::default(), body);
            engine.link().deliver("ctag", false, msg, "q", now).unwrap();
        }

        let acked = engine.link().ack(2, true).unwrap();
        assert_eq!(acked.len(), 2);
        assert_eq!(engine.link().unacked_len(), 1);
    }

    #[test]
    fn ack_unknown_tag_is_precondition_failed() {
        let (engine, _rx) = test_engine();
        let err = engine.link().ack(7, false).unwrap_err();
        assert_eq!(err.code, ReplyCode::PreconditionFailed);
    }

    #[test]
    fn prefetch_blocks_delivery_at_limit() {
        let (engine, _rx) = test_engine();
        let now = Instant::now();
        engine.link().set_qos(2, false);

        for body in ["a", "b"] {
            let msg = Message::new("ex", "rk", BasicProperties::default(), body);
            engine.link().deliver("ctag", false, msg, "q", now).unwrap();
        }

        assert!(!engine.link().eligible("ctag"));
        assert!(engine.link().eligible("other-tag"));

        engine.link().ack(1, false).unwrap();
        assert!(engine.link().eligible("ctag"));
    }

    #[test]
    fn global_prefetch_caps_the_whole_channel() {
        let (engine, _rx) = test_engine();
        let now = Instant::now();
        engine.link().set_qos(1, true);

        let msg = Message::new("ex", "rk", BasicProperties::default(), "a");
        engine.link().deliver("one", false, msg, "q", now).unwrap();

        assert!(!engine.link().eligible("one"));
        assert!(!engine.link().eligible("two"));
    }

    #[test]
    fn generated_consumer_tags_are_unique() {
        let (mut engine, _rx) = test_engine();
        let t1 = engine.register_consumer("", "q1").unwrap();
        let t2 = engine.register_consumer("", "q2").unwrap();
        assert_ne!(t1, t2);
        assert!(engine.register_consumer(&t1, "q3").is_none());
    }
}
