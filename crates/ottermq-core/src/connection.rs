//! The per-connection protocol engine.
//!
//! A linear handshake state machine followed by per-channel dispatch:
//!
//! ```text
//! ┌──────┐ header ┌─────────────────┐ Start-Ok ┌────────────────┐
//! │ Init │───────>│ AwaitingStartOk │─────────>│ AwaitingTuneOk │
//! └──────┘        └─────────────────┘          └────────────────┘
//!                                                      │ Tune-Ok
//!                         ┌─────────┐   Open     ┌─────▼────────┐
//!                         │ Running │<───────────│ AwaitingOpen │
//!                         └─────────┘            └──────────────┘
//!                              │ Close (either peer) / fatal error
//!                              ▼
//!                         ┌─────────┐  Close-Ok  ┌────────┐
//!                         │ Closing │───────────>│ Closed │
//!                         └─────────┘            └────────┘
//! ```
//!
//! The engine is sans-IO: the server feeds it decoded frames and explicit
//! `Instant`s, and it pushes reply frames into the connection's outbound
//! mailbox (the same mailbox queue dispatch writes into, so ordering is
//! simply production order). The returned actions carry only what cannot
//! travel as a frame: raw protocol-header bytes and the close verdict.

use std::{collections::HashMap, sync::Arc, time::Instant};

use bytes::Bytes;
use ottermq_proto::{
    BasicMethod, BasicProperties, ChannelMethod, ConnectionMethod, FRAME_MIN_SIZE, FieldTable,
    FrameType, Method, PROTOCOL_HEADER, RawFrame, check_protocol_header,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    channel::{ChannelEngine, ChannelInput, ChannelLink, UnackedRecord},
    config::HANDSHAKE_TIMEOUT,
    delivery::content_frames,
    error::{AmqpException, ErrorScope, ReplyCode},
    message::Message,
    queue::Consumer,
    registry::Broker,
    vhost::{RouteResult, VHost},
    wal::WalRecord,
};

/// What the engine asks the runtime to do besides writing frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Write these raw bytes (the server's protocol header on version
    /// mismatch; not a frame)
    SendRaw(Bytes),

    /// Close the socket
    Close {
        /// Reason for the log
        reason: String,
    },
}

/// Handshake and lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the 8-byte protocol header
    Init,
    /// `Connection.Start` sent
    AwaitingStartOk,
    /// `Connection.Tune` sent
    AwaitingTuneOk,
    /// Tuning agreed, waiting for `Connection.Open`
    AwaitingOpen,
    /// Open for channels and methods
    Running,
    /// `Connection.Close` sent, waiting for `Close-Ok`
    Closing,
    /// Dead; frames are ignored
    Closed,
}

/// The negotiated connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    /// Highest usable channel number (0 = unlimited)
    pub channel_max: u16,
    /// Largest frame payload either peer may send
    pub frame_max: u32,
    /// Heartbeat delay in seconds (0 = disabled)
    pub heartbeat: u16,
}

/// The engine for one client connection.
pub struct ConnectionEngine {
    id: u64,
    broker: Arc<Broker>,
    outbound: UnboundedSender<RawFrame>,
    state: ConnectionState,
    state_since: Instant,
    user: Option<String>,
    vhost: Option<Arc<VHost>>,
    tuning: Tuning,
    channels: HashMap<u16, ChannelEngine>,
    last_recv: Instant,
}

impl ConnectionEngine {
    /// Engine for a freshly accepted connection. `outbound` is the single
    /// send path of the connection; everything written to the socket goes
    /// through it.
    #[must_use]
    pub fn new(
        id: u64,
        broker: Arc<Broker>,
        outbound: UnboundedSender<RawFrame>,
        now: Instant,
    ) -> Self {
        let config = broker.config();
        let tuning = Tuning {
            channel_max: config.channel_max,
            frame_max: config.frame_max,
            heartbeat: config.heartbeat,
        };
        Self {
            id,
            broker,
            outbound,
            state: ConnectionState::Init,
            state_since: now,
            user: None,
            vhost: None,
            tuning,
            channels: HashMap::new(),
            last_recv: now,
        }
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The negotiated limits (the server's offer until `Tune-Ok` lands).
    #[must_use]
    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    /// Open channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Validate the client's 8-byte protocol header and start the
    /// handshake.
    pub fn handle_protocol_header(
        &mut self,
        header: &[u8; 8],
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Init {
            return self.fatal("protocol header after handshake started");
        }

        if check_protocol_header(header).is_err() {
            tracing::debug!(connection = self.id, "unsupported protocol header, answering ours");
            self.state = ConnectionState::Closed;
            return vec![
                ConnectionAction::SendRaw(Bytes::from_static(&PROTOCOL_HEADER)),
                ConnectionAction::Close { reason: "protocol version mismatch".to_string() },
            ];
        }

        self.send_method(0, Method::Connection(ConnectionMethod::Start {
            version_major: 0,
            version_minor: 9,
            server_properties: server_properties(),
            mechanisms: "PLAIN".to_string(),
            locales: "en_US".to_string(),
        }));
        self.enter(ConnectionState::AwaitingStartOk, now);
        Vec::new()
    }

    /// Process one decoded frame.
    pub fn handle_frame(&mut self, frame: &RawFrame, now: Instant) -> Vec<ConnectionAction> {
        self.last_recv = now;

        if frame.kind == FrameType::Heartbeat {
            self.broker.touch_heartbeat(self.id);
            return Vec::new();
        }

        match self.state {
            ConnectionState::Init => self.fatal("frame before protocol header"),
            ConnectionState::AwaitingStartOk
            | ConnectionState::AwaitingTuneOk
            | ConnectionState::AwaitingOpen => self.handle_handshake_frame(frame, now),
            ConnectionState::Running => self.handle_running_frame(frame, now),
            ConnectionState::Closing => self.handle_closing_frame(frame),
            ConnectionState::Closed => Vec::new(),
        }
    }

    /// Periodic maintenance: handshake deadlines and heartbeats.
    ///
    /// `last_write` is when the writer task last put bytes on the wire;
    /// the engine owes the peer a heartbeat once that is `heartbeat`
    /// seconds ago.
    pub fn tick(&mut self, now: Instant, last_write: Instant) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Closed => Vec::new(),

            ConnectionState::Init
            | ConnectionState::AwaitingStartOk
            | ConnectionState::AwaitingTuneOk
            | ConnectionState::AwaitingOpen => {
                if now.duration_since(self.state_since) > HANDSHAKE_TIMEOUT {
                    self.state = ConnectionState::Closed;
                    vec![ConnectionAction::Close { reason: "handshake-timeout".to_string() }]
                } else {
                    Vec::new()
                }
            },

            ConnectionState::Closing => {
                if now.duration_since(self.state_since) > HANDSHAKE_TIMEOUT {
                    self.state = ConnectionState::Closed;
                    vec![ConnectionAction::Close {
                        reason: "close-ok never arrived".to_string(),
                    }]
                } else {
                    Vec::new()
                }
            },

            ConnectionState::Running => {
                let heartbeat = u64::from(self.tuning.heartbeat);
                if heartbeat == 0 {
                    return Vec::new();
                }

                if now.duration_since(self.last_recv).as_secs() >= 2 * heartbeat {
                    tracing::warn!(connection = self.id, "peer missed its heartbeat window");
                    self.requeue_all_channels(now);
                    self.state = ConnectionState::Closed;
                    return vec![ConnectionAction::Close {
                        reason: "missed-heartbeat".to_string(),
                    }];
                }

                if now.duration_since(last_write).as_secs() >= heartbeat {
                    self.send(RawFrame::heartbeat());
                }
                Vec::new()
            },
        }
    }

    /// A frame failed to decode at the transport layer (bad terminator,
    /// oversize, unknown frame type). Answers with the matching
    /// connection exception.
    pub fn handle_decode_error(
        &mut self,
        err: ottermq_proto::ProtocolError,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        let exc = AmqpException::from(err);
        self.raise(0, &exc, now)
    }

    /// The socket dropped without a protocol close. Requeues every unacked
    /// message and releases registry state. Idempotent.
    pub fn teardown(&mut self, now: Instant) {
        if self.state != ConnectionState::Closed {
            tracing::debug!(connection = self.id, "tearing down without close handshake");
        }
        self.requeue_all_channels(now);
        if let Some(vhost) = &self.vhost {
            for name in vhost.remove_connection(self.id) {
                tracing::debug!(connection = self.id, queue = name, "exclusive queue removed");
            }
        }
        self.broker.unregister_connection(self.id);
        self.state = ConnectionState::Closed;
    }

    fn enter(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        self.state_since = now;
    }

    fn send(&self, frame: RawFrame) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!(connection = self.id, "outbound mailbox gone, dropping frame");
        }
    }

    fn send_method(&self, channel: u16, method: Method) {
        match method.into_frame(channel) {
            Ok(frame) => self.send(frame),
            Err(err) => {
                tracing::error!(connection = self.id, %err, "failed to encode reply method");
            },
        }
    }

    fn fatal(&mut self, reason: &str) -> Vec<ConnectionAction> {
        tracing::warn!(connection = self.id, reason, "closing connection");
        self.state = ConnectionState::Closed;
        vec![ConnectionAction::Close { reason: reason.to_string() }]
    }

    /// Answer a protocol-plane error per its scope.
    fn raise(&mut self, channel: u16, exc: &AmqpException, now: Instant) -> Vec<ConnectionAction> {
        tracing::warn!(connection = self.id, channel, error = %exc, "protocol exception");

        if exc.scope == ErrorScope::Channel && channel != 0 {
            if let Some(engine) = self.channels.get(&channel) {
                if engine.is_closing() {
                    return Vec::new();
                }
            }
            self.teardown_channel(channel, now);
            if let Some(engine) = self.channels.get_mut(&channel) {
                engine.set_closing();
            }
            self.send_method(
                channel,
                Method::Channel(ChannelMethod::Close {
                    reply_code: exc.code.to_u16(),
                    reply_text: exc.text.clone(),
                    class_id: exc.class_id,
                    method_id: exc.method_id,
                }),
            );
            return Vec::new();
        }

        // Connection scope: everything is requeued before the close goes out
        self.requeue_all_channels(now);
        self.send_method(
            0,
            Method::Connection(ConnectionMethod::Close {
                reply_code: exc.code.to_u16(),
                reply_text: exc.text.clone(),
                class_id: exc.class_id,
                method_id: exc.method_id,
            }),
        );
        self.enter(ConnectionState::Closing, now);
        Vec::new()
    }

    // Handshake

    fn handle_handshake_frame(
        &mut self,
        frame: &RawFrame,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if frame.channel != 0 || frame.kind != FrameType::Method {
            let exc = AmqpException::connection(
                ReplyCode::CommandInvalid,
                "only channel-0 methods are valid during the handshake",
            );
            return self.raise(0, &exc, now);
        }

        let method = match Method::decode(&frame.payload) {
            Ok(method) => method,
            Err(err) => {
                let exc = AmqpException::from(err);
                return self.raise(0, &exc, now);
            },
        };

        let result = match (self.state, method) {
            (
                ConnectionState::AwaitingStartOk,
                Method::Connection(ConnectionMethod::StartOk {
                    mechanism, response, ..
                }),
            ) => self.handle_start_ok(&mechanism, &response, now),
            (
                ConnectionState::AwaitingTuneOk,
                Method::Connection(ConnectionMethod::TuneOk {
                    channel_max,
                    frame_max,
                    heartbeat,
                }),
            ) => {
                self.handle_tune_ok(channel_max, frame_max, heartbeat, now);
                Ok(())
            },
            (
                ConnectionState::AwaitingOpen,
                Method::Connection(ConnectionMethod::Open { virtual_host }),
            ) => self.handle_open(&virtual_host, now),
            (_, Method::Connection(ConnectionMethod::Close { reply_code, reply_text, .. })) => {
                tracing::debug!(
                    connection = self.id,
                    reply_code,
                    reply_text,
                    "peer closed during handshake"
                );
                self.send_method(0, Method::Connection(ConnectionMethod::CloseOk));
                self.state = ConnectionState::Closed;
                return vec![ConnectionAction::Close { reason: "client close".to_string() }];
            },
            (state, method) => Err(AmqpException::connection(
                ReplyCode::CommandInvalid,
                format!("{} not valid in {state:?}", method.name()),
            )
            .with_method(method.class_id(), method.method_id())),
        };

        match result {
            Ok(()) => Vec::new(),
            Err(exc) => self.raise(0, &exc, now),
        }
    }

    fn handle_start_ok(
        &mut self,
        mechanism: &str,
        response: &[u8],
        now: Instant,
    ) -> Result<(), AmqpException> {
        let user = self.broker.auth().authenticate(mechanism, response).map_err(|err| {
            tracing::warn!(connection = self.id, %err, "authentication failed");
            AmqpException::connection(ReplyCode::AccessRefused, "access refused")
        })?;

        tracing::debug!(connection = self.id, user = user.name, "authenticated");
        self.user = Some(user.name);

        let config = self.broker.config();
        self.send_method(0, Method::Connection(ConnectionMethod::Tune {
            channel_max: config.channel_max,
            frame_max: config.frame_max,
            heartbeat: config.heartbeat,
        }));
        self.enter(ConnectionState::AwaitingTuneOk, now);
        Ok(())
    }

    fn handle_tune_ok(&mut self, channel_max: u16, frame_max: u32, heartbeat: u16, now: Instant) {
        let config = self.broker.config();

        let mut frame_max = nonzero_min(u64::from(config.frame_max), u64::from(frame_max)) as u32;
        if frame_max != 0 && frame_max < FRAME_MIN_SIZE {
            frame_max = FRAME_MIN_SIZE;
        }

        self.tuning = Tuning {
            channel_max: nonzero_min(u64::from(config.channel_max), u64::from(channel_max))
                as u16,
            frame_max,
            // 0 from either side disables heartbeats entirely
            heartbeat: config.heartbeat.min(heartbeat),
        };

        tracing::debug!(
            connection = self.id,
            channel_max = self.tuning.channel_max,
            frame_max = self.tuning.frame_max,
            heartbeat = self.tuning.heartbeat,
            "tuned"
        );
        self.enter(ConnectionState::AwaitingOpen, now);
    }

    fn handle_open(&mut self, virtual_host: &str, now: Instant) -> Result<(), AmqpException> {
        let vhost = self.broker.vhost(virtual_host).ok_or_else(|| {
            AmqpException::connection(
                ReplyCode::NotAllowed,
                format!("no vhost '{virtual_host}'"),
            )
        })?;

        let user = self.user.clone().unwrap_or_default();
        if !vhost.is_permitted(&user) {
            return Err(AmqpException::connection(
                ReplyCode::NotAllowed,
                format!("user '{user}' may not access vhost '{virtual_host}'"),
            ));
        }

        tracing::info!(connection = self.id, vhost = virtual_host, user, "connection open");
        self.vhost = Some(vhost);

        let tuning = self.tuning;
        let vhost_name = virtual_host.to_string();
        let user_name = user;
        self.broker.update_connection(self.id, move |entry| {
            entry.vhost = Some(vhost_name);
            entry.user = Some(user_name);
            entry.state = "running";
            entry.tuning = (tuning.channel_max, tuning.frame_max, tuning.heartbeat);
        });

        self.send_method(0, Method::Connection(ConnectionMethod::OpenOk));
        self.enter(ConnectionState::Running, now);
        Ok(())
    }

    // Running

    fn handle_running_frame(&mut self, frame: &RawFrame, now: Instant) -> Vec<ConnectionAction> {
        if frame.channel == 0 {
            return self.handle_channel0_frame(frame, now);
        }

        if !self.channels.contains_key(&frame.channel) {
            return self.handle_unopened_channel(frame, now);
        }

        let input = match self.channels.get_mut(&frame.channel) {
            Some(engine) => engine.accept_frame(frame),
            None => return Vec::new(),
        };

        match input {
            Ok(Some(input)) => self.process_input(frame.channel, input, now),
            Ok(None) => Vec::new(),
            Err(exc) => self.raise(frame.channel, &exc, now),
        }
    }

    fn handle_channel0_frame(&mut self, frame: &RawFrame, now: Instant) -> Vec<ConnectionAction> {
        if frame.kind != FrameType::Method {
            let exc = AmqpException::connection(
                ReplyCode::UnexpectedFrame,
                "content frames are not valid on channel 0",
            );
            return self.raise(0, &exc, now);
        }

        let method = match Method::decode(&frame.payload) {
            Ok(method) => method,
            Err(err) => {
                let exc = AmqpException::from(err);
                return self.raise(0, &exc, now);
            },
        };

        match method {
            Method::Connection(ConnectionMethod::Close {
                reply_code, reply_text, ..
            }) => {
                tracing::info!(connection = self.id, reply_code, reply_text, "peer close");
                self.requeue_all_channels(now);
                self.send_method(0, Method::Connection(ConnectionMethod::CloseOk));
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close { reason: "client close".to_string() }]
            },
            Method::Connection(other) => {
                let exc = AmqpException::connection(
                    ReplyCode::CommandInvalid,
                    format!("{} not valid while running", other.name()),
                )
                .with_method(10, other.method_id());
                self.raise(0, &exc, now)
            },
            other => {
                let exc = AmqpException::connection(
                    ReplyCode::CommandInvalid,
                    format!("{} not valid on channel 0", other.name()),
                )
                .with_method(other.class_id(), other.method_id());
                self.raise(0, &exc, now)
            },
        }
    }

    fn handle_unopened_channel(
        &mut self,
        frame: &RawFrame,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        if frame.kind == FrameType::Method {
            match Method::decode(&frame.payload) {
                Ok(Method::Channel(ChannelMethod::Open)) => {
                    return match self.open_channel(frame.channel) {
                        Ok(()) => Vec::new(),
                        Err(exc) => self.raise(frame.channel, &exc, now),
                    };
                },
                Ok(method) => {
                    let exc = AmqpException::connection(
                        ReplyCode::ChannelError,
                        format!("channel {} is not open", frame.channel),
                    )
                    .with_method(method.class_id(), method.method_id());
                    return self.raise(frame.channel, &exc, now);
                },
                Err(err) => {
                    let exc = AmqpException::from(err);
                    return self.raise(frame.channel, &exc, now);
                },
            }
        }

        let exc = AmqpException::connection(
            ReplyCode::ChannelError,
            format!("content frame for unopened channel {}", frame.channel),
        );
        self.raise(frame.channel, &exc, now)
    }

    fn open_channel(&mut self, channel: u16) -> Result<(), AmqpException> {
        let max = self.tuning.channel_max;
        if max != 0 && (channel > max || self.channels.len() >= max as usize) {
            return Err(AmqpException::connection(
                ReplyCode::NotAllowed,
                format!("channel limit {max} reached"),
            )
            .with_method(20, 10));
        }

        let link = Arc::new(ChannelLink::new(
            self.id,
            channel,
            self.tuning.frame_max,
            self.outbound.clone(),
        ));
        self.channels.insert(channel, ChannelEngine::new(channel, link));
        self.sync_channel_count();

        tracing::debug!(connection = self.id, channel, "channel open");
        self.send_method(channel, Method::Channel(ChannelMethod::OpenOk));
        Ok(())
    }

    fn process_input(
        &mut self,
        channel: u16,
        input: ChannelInput,
        now: Instant,
    ) -> Vec<ConnectionAction> {
        let result = match input {
            ChannelInput::Method(method) => self.handle_channel_method(channel, method, now),
            ChannelInput::Publish { publish, properties, body } => {
                self.handle_publish(channel, &publish, properties, body, now)
            },
        };

        match result {
            Ok(()) => Vec::new(),
            Err(exc) => self.raise(channel, &exc, now),
        }
    }

    fn handle_channel_method(
        &mut self,
        channel: u16,
        method: Method,
        now: Instant,
    ) -> Result<(), AmqpException> {
        match method {
            Method::Channel(ChannelMethod::Open) => Err(AmqpException::connection(
                ReplyCode::ChannelError,
                format!("channel {channel} is already open"),
            )
            .with_method(20, 10)),

            Method::Channel(ChannelMethod::Close { reply_code, reply_text, .. }) => {
                tracing::debug!(connection = self.id, channel, reply_code, reply_text, "channel close");
                self.teardown_channel(channel, now);
                self.channels.remove(&channel);
                self.sync_channel_count();
                self.send_method(channel, Method::Channel(ChannelMethod::CloseOk));
                Ok(())
            },

            Method::Channel(ChannelMethod::CloseOk) => {
                // We initiated the close; the channel was torn down then
                self.channels.remove(&channel);
                self.sync_channel_count();
                Ok(())
            },

            Method::Channel(ChannelMethod::Flow { active }) => {
                // Flow control is not implemented; acknowledge the state
                tracing::debug!(connection = self.id, channel, active, "flow ignored");
                self.send_method(channel, Method::Channel(ChannelMethod::FlowOk { active }));
                Ok(())
            },

            Method::Channel(ChannelMethod::OpenOk | ChannelMethod::FlowOk { .. }) => {
                Err(AmqpException::connection(
                    ReplyCode::CommandInvalid,
                    "reply method from client",
                ))
            },

            Method::Exchange(m) => self.handle_exchange_method(channel, &m),
            Method::Queue(m) => self.handle_queue_method(channel, m),
            Method::Basic(m) => self.handle_basic_method(channel, &m, now),

            Method::Connection(m) => Err(AmqpException::connection(
                ReplyCode::CommandInvalid,
                format!("{} on a non-zero channel", m.name()),
            )
            .with_method(10, m.method_id())),
        }
    }

    fn handle_exchange_method(
        &mut self,
        channel: u16,
        method: &ottermq_proto::ExchangeMethod,
    ) -> Result<(), AmqpException> {
        use ottermq_proto::ExchangeMethod;

        let vhost = self.require_vhost()?;
        match method {
            ExchangeMethod::Declare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => {
                vhost
                    .declare_exchange(
                        exchange,
                        kind,
                        *passive,
                        *durable,
                        *auto_delete,
                        *internal,
                        arguments.clone(),
                    )
                    .map_err(|exc| exc.with_method(40, 10))?;
                self.append_wal(WalRecord::ExchangeDeclared {
                    vhost: vhost.name().to_string(),
                    exchange: exchange.clone(),
                });
                if !no_wait {
                    self.send_method(channel, Method::Exchange(ExchangeMethod::DeclareOk));
                }
                Ok(())
            },
            ExchangeMethod::Delete { exchange, if_unused, no_wait } => {
                vhost
                    .delete_exchange(exchange, *if_unused)
                    .map_err(|exc| exc.with_method(40, 20))?;
                if !no_wait {
                    self.send_method(channel, Method::Exchange(ExchangeMethod::DeleteOk));
                }
                Ok(())
            },
            ExchangeMethod::DeclareOk | ExchangeMethod::DeleteOk => Err(
                AmqpException::connection(ReplyCode::CommandInvalid, "reply method from client"),
            ),
        }
    }

    fn handle_queue_method(
        &mut self,
        channel: u16,
        method: ottermq_proto::QueueMethod,
    ) -> Result<(), AmqpException> {
        use ottermq_proto::QueueMethod;

        let vhost = self.require_vhost()?;
        match method {
            QueueMethod::Declare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                let (name, message_count, consumer_count) = vhost
                    .declare_queue(
                        &queue, passive, durable, exclusive, auto_delete, arguments, self.id,
                    )
                    .map_err(|exc| exc.with_method(50, 10))?;
                self.append_wal(WalRecord::QueueDeclared {
                    vhost: vhost.name().to_string(),
                    queue: name.clone(),
                });
                if !no_wait {
                    self.send_method(
                        channel,
                        Method::Queue(QueueMethod::DeclareOk {
                            queue: name,
                            message_count,
                            consumer_count,
                        }),
                    );
                }
                Ok(())
            },

            QueueMethod::Bind { queue, exchange, routing_key, no_wait, arguments } => {
                vhost
                    .bind_queue(&queue, &exchange, &routing_key, arguments, self.id)
                    .map_err(|exc| exc.with_method(50, 20))?;
                self.append_wal(WalRecord::BindingChanged {
                    vhost: vhost.name().to_string(),
                    exchange,
                    queue,
                    routing_key,
                    bound: true,
                });
                if !no_wait {
                    self.send_method(channel, Method::Queue(QueueMethod::BindOk));
                }
                Ok(())
            },

            QueueMethod::Unbind { queue, exchange, routing_key, .. } => {
                vhost
                    .unbind_queue(&queue, &exchange, &routing_key)
                    .map_err(|exc| exc.with_method(50, 50))?;
                self.append_wal(WalRecord::BindingChanged {
                    vhost: vhost.name().to_string(),
                    exchange,
                    queue,
                    routing_key,
                    bound: false,
                });
                self.send_method(channel, Method::Queue(QueueMethod::UnbindOk));
                Ok(())
            },

            QueueMethod::Purge { queue, no_wait } => {
                let message_count = vhost
                    .purge_queue(&queue, self.id)
                    .map_err(|exc| exc.with_method(50, 30))?;
                if !no_wait {
                    self.send_method(channel, Method::Queue(QueueMethod::PurgeOk { message_count }));
                }
                Ok(())
            },

            QueueMethod::Delete { queue, if_unused, if_empty, no_wait } => {
                let message_count = vhost
                    .delete_queue(&queue, if_unused, if_empty, self.id)
                    .map_err(|exc| exc.with_method(50, 40))?;
                if !no_wait {
                    self.send_method(
                        channel,
                        Method::Queue(QueueMethod::DeleteOk { message_count }),
                    );
                }
                Ok(())
            },

            QueueMethod::DeclareOk { .. }
            | QueueMethod::BindOk
            | QueueMethod::UnbindOk
            | QueueMethod::PurgeOk { .. }
            | QueueMethod::DeleteOk { .. } => Err(AmqpException::connection(
                ReplyCode::CommandInvalid,
                "reply method from client",
            )),
        }
    }

    fn handle_basic_method(
        &mut self,
        channel: u16,
        method: &BasicMethod,
        now: Instant,
    ) -> Result<(), AmqpException> {
        match method {
            BasicMethod::Qos { prefetch_size, prefetch_count, global } => {
                if *prefetch_size != 0 {
                    tracing::debug!(connection = self.id, channel, "prefetch-size ignored");
                }
                self.link(channel)?.set_qos(*prefetch_count, *global);
                self.send_method(channel, Method::Basic(BasicMethod::QosOk));
                Ok(())
            },

            BasicMethod::Consume {
                queue,
                consumer_tag,
                no_ack,
                exclusive,
                no_wait,
                ..
            } => self.handle_consume(channel, queue, consumer_tag, *no_ack, *exclusive, *no_wait, now),

            BasicMethod::Cancel { consumer_tag, no_wait } => {
                self.handle_cancel(channel, consumer_tag, *no_wait)
            },

            BasicMethod::Get { queue, no_ack } => self.handle_get(channel, queue, *no_ack, now),

            BasicMethod::Ack { delivery_tag, multiple } => {
                let records = self.link(channel)?.ack(*delivery_tag, *multiple)?;
                self.finish_acked(records, now);
                Ok(())
            },

            BasicMethod::Reject { delivery_tag, requeue } => {
                let records = self.link(channel)?.reject(*delivery_tag, false)?;
                self.finish_rejected(records, *requeue, now);
                Ok(())
            },

            BasicMethod::Nack { delivery_tag, multiple, requeue } => {
                let records = self.link(channel)?.reject(*delivery_tag, *multiple)?;
                self.finish_rejected(records, *requeue, now);
                Ok(())
            },

            BasicMethod::Recover { requeue } => {
                let records = self.link(channel)?.drain_unacked();
                self.send_method(channel, Method::Basic(BasicMethod::RecoverOk));
                if *requeue {
                    self.requeue_records(records, now);
                } else {
                    self.redeliver_records(channel, records, now);
                }
                Ok(())
            },

            BasicMethod::Publish { .. } => {
                // Publish arrives via content assembly, never directly
                Err(AmqpException::connection(
                    ReplyCode::InternalError,
                    "publish outside content assembly",
                ))
            },

            BasicMethod::QosOk
            | BasicMethod::ConsumeOk { .. }
            | BasicMethod::CancelOk { .. }
            | BasicMethod::Return { .. }
            | BasicMethod::Deliver { .. }
            | BasicMethod::GetOk { .. }
            | BasicMethod::GetEmpty
            | BasicMethod::RecoverOk => Err(AmqpException::connection(
                ReplyCode::CommandInvalid,
                "reply method from client",
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_consume(
        &mut self,
        channel: u16,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        now: Instant,
    ) -> Result<(), AmqpException> {
        let vhost = self.require_vhost()?;
        let queue = vhost.queue(queue_name).ok_or_else(|| {
            AmqpException::channel(
                ReplyCode::NotFound,
                format!("no queue '{queue_name}' in vhost '{}'", vhost.name()),
            )
            .with_method(60, 20)
        })?;
        queue.check_access(self.id).map_err(|exc| exc.with_method(60, 20))?;

        let engine = self.channels.get_mut(&channel).ok_or_else(|| {
            AmqpException::connection(ReplyCode::ChannelError, "channel vanished")
        })?;
        let tag = engine.register_consumer(consumer_tag, queue_name).ok_or_else(|| {
            AmqpException::connection(
                ReplyCode::NotAllowed,
                format!("consumer tag '{consumer_tag}' already in use"),
            )
            .with_method(60, 20)
        })?;
        let link = Arc::clone(engine.link());

        // Consume-Ok must hit the wire before the first delivery, and
        // add_consumer starts delivering immediately
        if !no_wait {
            self.send_method(
                channel,
                Method::Basic(BasicMethod::ConsumeOk { consumer_tag: tag.clone() }),
            );
        }

        let consumer = Consumer { tag: tag.clone(), no_ack, exclusive, link };
        if let Err(exc) = queue.add_consumer(consumer, now) {
            if let Some(engine) = self.channels.get_mut(&channel) {
                let _ = engine.remove_consumer(&tag);
            }
            return Err(exc.with_method(60, 20));
        }

        tracing::debug!(connection = self.id, channel, queue = queue_name, tag, "consume");
        Ok(())
    }

    fn handle_cancel(
        &mut self,
        channel: u16,
        consumer_tag: &str,
        no_wait: bool,
    ) -> Result<(), AmqpException> {
        let engine = self.channels.get_mut(&channel).ok_or_else(|| {
            AmqpException::connection(ReplyCode::ChannelError, "channel vanished")
        })?;

        let queue_name = engine.remove_consumer(consumer_tag);
        let link = Arc::clone(engine.link());

        if let Some(queue_name) = queue_name {
            let vhost = self.require_vhost()?;
            if let Some(queue) = vhost.queue(&queue_name) {
                queue.remove_consumer(consumer_tag, &link);
                if queue.attrs().auto_delete && vhost.reap_auto_delete(&queue_name) {
                    tracing::debug!(queue = queue_name, "auto-delete queue reaped");
                }
            }
        }

        if !no_wait {
            self.send_method(
                channel,
                Method::Basic(BasicMethod::CancelOk { consumer_tag: consumer_tag.to_string() }),
            );
        }
        Ok(())
    }

    fn handle_get(
        &mut self,
        channel: u16,
        queue_name: &str,
        no_ack: bool,
        now: Instant,
    ) -> Result<(), AmqpException> {
        let vhost = self.require_vhost()?;
        let queue = vhost.queue(queue_name).ok_or_else(|| {
            AmqpException::channel(
                ReplyCode::NotFound,
                format!("no queue '{queue_name}' in vhost '{}'", vhost.name()),
            )
            .with_method(60, 70)
        })?;
        queue.check_access(self.id).map_err(|exc| exc.with_method(60, 70))?;

        match queue.pop() {
            None => {
                self.send_method(channel, Method::Basic(BasicMethod::GetEmpty));
                Ok(())
            },
            Some((message, remaining)) => {
                let frames =
                    self.link(channel)?.deliver_get(message, no_ack, queue_name, remaining, now)?;
                for frame in frames {
                    self.send(frame);
                }
                Ok(())
            },
        }
    }

    fn handle_publish(
        &mut self,
        channel: u16,
        publish: &BasicMethod,
        properties: BasicProperties,
        body: Bytes,
        now: Instant,
    ) -> Result<(), AmqpException> {
        let BasicMethod::Publish { exchange, routing_key, mandatory, immediate } = publish
        else {
            return Err(AmqpException::connection(
                ReplyCode::InternalError,
                "non-publish content input",
            ));
        };

        if *immediate {
            return Err(AmqpException::connection(
                ReplyCode::NotImplemented,
                "immediate delivery is not implemented",
            )
            .with_method(60, 40));
        }

        let vhost = self.require_vhost()?;
        match vhost.route(exchange, routing_key).map_err(|exc| exc.with_method(60, 40))? {
            RouteResult::Routed(queues) => {
                for queue in queues {
                    let message =
                        Message::new(exchange.clone(), routing_key.clone(), properties.clone(), body.clone());
                    self.append_wal(WalRecord::MessagePublished {
                        vhost: vhost.name().to_string(),
                        queue: queue.name().to_string(),
                        message_id: message.id.to_string(),
                    });
                    queue.publish(message, now);
                }
                Ok(())
            },

            RouteResult::NoRoute => {
                if *mandatory {
                    tracing::debug!(
                        connection = self.id,
                        exchange,
                        routing_key,
                        "mandatory publish returned"
                    );
                    let method = Method::Basic(BasicMethod::Return {
                        reply_code: ReplyCode::NoRoute.to_u16(),
                        reply_text: "NO_ROUTE".to_string(),
                        exchange: exchange.clone(),
                        routing_key: routing_key.clone(),
                    });
                    let frames =
                        content_frames(channel, method, &properties, &body, self.tuning.frame_max)
                            .map_err(|err| {
                                AmqpException::connection(
                                    ReplyCode::InternalError,
                                    err.to_string(),
                                )
                            })?;
                    for frame in frames {
                        self.send(frame);
                    }
                } else {
                    tracing::debug!(connection = self.id, exchange, routing_key, "unroutable, dropped");
                }
                Ok(())
            },

            RouteResult::NoExchange => {
                if *mandatory {
                    Err(AmqpException::channel(
                        ReplyCode::NotFound,
                        format!("no exchange '{exchange}' in vhost '{}'", vhost.name()),
                    )
                    .with_method(60, 40))
                } else {
                    tracing::debug!(connection = self.id, exchange, "unknown exchange, dropped");
                    Ok(())
                }
            },
        }
    }

    // Closing

    fn handle_closing_frame(&mut self, frame: &RawFrame) -> Vec<ConnectionAction> {
        if frame.kind != FrameType::Method || frame.channel != 0 {
            return Vec::new();
        }
        match Method::decode(&frame.payload) {
            Ok(Method::Connection(ConnectionMethod::CloseOk)) => {
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close { reason: "close handshake complete".to_string() }]
            },
            Ok(Method::Connection(ConnectionMethod::Close { .. })) => {
                // Close crossed on the wire; answer and drop
                self.send_method(0, Method::Connection(ConnectionMethod::CloseOk));
                self.state = ConnectionState::Closed;
                vec![ConnectionAction::Close { reason: "close crossed".to_string() }]
            },
            _ => Vec::new(),
        }
    }

    // Shared plumbing

    fn require_vhost(&self) -> Result<Arc<VHost>, AmqpException> {
        self.vhost.clone().ok_or_else(|| {
            AmqpException::connection(ReplyCode::InternalError, "running without a vhost")
        })
    }

    fn link(&self, channel: u16) -> Result<Arc<ChannelLink>, AmqpException> {
        self.channels
            .get(&channel)
            .map(|engine| Arc::clone(engine.link()))
            .ok_or_else(|| {
                AmqpException::connection(
                    ReplyCode::ChannelError,
                    format!("channel {channel} is not open"),
                )
            })
    }

    fn sync_channel_count(&self) {
        let channels = self.channels.len();
        self.broker.update_connection(self.id, move |entry| entry.channels = channels);
    }

    fn append_wal(&self, record: WalRecord) {
        if let Err(err) = self.broker.wal().append(record) {
            tracing::error!(connection = self.id, %err, "wal append failed");
        }
    }

    /// Settle acknowledged records: log them and re-dispatch the queues
    /// whose prefetch capacity just freed up.
    fn finish_acked(&self, records: Vec<UnackedRecord>, now: Instant) {
        let Some(vhost) = &self.vhost else { return };
        let mut affected: Vec<String> = Vec::new();

        for record in &records {
            self.append_wal(WalRecord::MessageAcked {
                vhost: vhost.name().to_string(),
                queue: record.queue.clone(),
                message_id: record.message.id.to_string(),
            });
            if !affected.contains(&record.queue) {
                affected.push(record.queue.clone());
            }
        }

        for queue_name in affected {
            if let Some(queue) = vhost.queue(&queue_name) {
                queue.dispatch(now);
            }
        }
    }

    /// Settle rejected records: back to the queue head, or discarded.
    /// Either way the freed capacity re-dispatches.
    fn finish_rejected(&self, records: Vec<UnackedRecord>, requeue: bool, now: Instant) {
        if requeue {
            self.requeue_records(records, now);
        } else {
            self.finish_acked(records, now);
        }
    }

    /// Cancel a channel's consumers and requeue its unacked messages.
    /// The channel engine itself stays in the map (callers decide).
    fn teardown_channel(&mut self, channel: u16, now: Instant) {
        let Some(engine) = self.channels.get_mut(&channel) else { return };
        let consumers = engine.take_consumers();
        let link = Arc::clone(engine.link());

        if let Some(vhost) = &self.vhost {
            for (tag, queue_name) in &consumers {
                if let Some(queue) = vhost.queue(queue_name) {
                    queue.remove_consumer(tag, &link);
                }
            }
            for queue_name in consumers.values() {
                vhost.reap_auto_delete(queue_name);
            }
        }

        let records = link.drain_unacked();
        self.requeue_records(records, now);
    }

    /// Requeue records at the heads of their source queues, in reverse
    /// delivery order so the earliest delivery ends up at the head.
    fn requeue_records(&self, records: Vec<UnackedRecord>, now: Instant) {
        let Some(vhost) = &self.vhost else { return };
        let mut affected: Vec<String> = Vec::new();

        for record in records.into_iter().rev() {
            let queue_name = record.queue.clone();
            if let Some(queue) = vhost.queue(&queue_name) {
                queue.requeue_front(record.message);
                if !affected.contains(&queue_name) {
                    affected.push(queue_name);
                }
            }
        }

        for queue_name in affected {
            if let Some(queue) = vhost.queue(&queue_name) {
                queue.dispatch(now);
            }
        }
    }

    /// `basic.recover(requeue=false)`: hand the messages back to the same
    /// channel under fresh delivery tags. Consumers that vanished fall
    /// back to a requeue.
    fn redeliver_records(&self, channel: u16, records: Vec<UnackedRecord>, now: Instant) {
        let Ok(link) = self.link(channel) else {
            self.requeue_records(records, now);
            return;
        };

        let mut leftovers = Vec::new();
        for mut record in records {
            record.message.redelivered = true;
            let no_ack = false;
            if let Err(message) =
                link.deliver(&record.consumer_tag, no_ack, record.message, &record.queue, now)
            {
                record.message = message;
                leftovers.push(record);
            }
        }
        if !leftovers.is_empty() {
            self.requeue_records(leftovers, now);
        }
    }

    fn requeue_all_channels(&mut self, now: Instant) {
        let ids: Vec<u16> = self.channels.keys().copied().collect();
        for channel in ids {
            self.teardown_channel(channel, now);
        }
        self.channels.clear();
        self.sync_channel_count();
    }
}

impl std::fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

fn nonzero_min(server: u64, client: u64) -> u64 {
    match (server, client) {
        (0, other) | (other, 0) => other,
        (a, b) => a.min(b),
    }
}

/// The server-properties table sent in `Connection.Start`.
fn server_properties() -> FieldTable {
    let mut capabilities = FieldTable::new();
    capabilities.insert("basic.nack", true);
    capabilities.insert("publisher_confirms", false);

    let mut properties = FieldTable::new();
    properties.insert("product", "OtterMQ");
    properties.insert("version", env!("CARGO_PKG_VERSION"));
    properties.insert("platform", "Rust");
    properties.insert(
        "capabilities",
        ottermq_proto::FieldValue::Table(capabilities),
    );
    properties
}
