//! OtterMQ production runtime.
//!
//! Thin async glue around [`ottermq_core`]: one accept loop, and per
//! connection a reader task (frame decode), a writer task draining the
//! connection's outbound mailbox (the single send path), and a one-second
//! ticker driving heartbeats and handshake deadlines. All protocol logic
//! lives in the core engines; this crate only moves bytes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::BytesMut;
pub use error::ServerError;
use ottermq_core::{Broker, ConnectionAction, ConnectionEngine, ConnectionState, config};
use ottermq_proto::{ProtocolError, RawFrame};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};

/// The listening broker.
pub struct Server {
    listener: TcpListener,
    broker: Arc<Broker>,
}

impl Server {
    /// Bind the configured listen address.
    pub async fn bind(broker: Arc<Broker>) -> Result<Self, ServerError> {
        let addr = broker.config().listen_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self { listener, broker })
    }

    /// Local address the listener bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener itself fails. Per-connection
    /// errors never escape this loop.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut accept_failures: u32 = 0;
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    accept_failures = 0;
                    let broker = Arc::clone(&self.broker);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, peer, broker).await {
                            tracing::debug!(%peer, %err, "connection ended with error");
                        }
                    });
                },
                Err(err) => {
                    accept_failures += 1;
                    tracing::warn!(%err, accept_failures, "accept failed");
                    if accept_failures >= 16 {
                        return Err(ServerError::Listener(err));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                },
            }
        }
    }
}

/// Anything the coordinator can wake up on.
enum ConnEvent {
    Frame(RawFrame),
    DecodeError(ProtocolError),
    /// Reader hit EOF or an I/O error: equivalent to an abrupt close
    Disconnected,
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
) -> Result<(), ServerError> {
    let id = broker.register_connection(peer.to_string());
    tracing::debug!(connection = id, %peer, "accepted");

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<RawFrame>();
    let mut engine = ConnectionEngine::new(id, Arc::clone(&broker), outbound_tx, Instant::now());

    // Protocol header first; everything after it is frames
    let mut header = [0u8; 8];
    let header_read = tokio::time::timeout(
        config::HANDSHAKE_TIMEOUT,
        stream.read_exact(&mut header),
    )
    .await;

    match header_read {
        Ok(Ok(_)) => {},
        Ok(Err(err)) => {
            tracing::debug!(connection = id, %err, "closed before protocol header");
            engine.teardown(Instant::now());
            return Ok(());
        },
        Err(_elapsed) => {
            tracing::debug!(connection = id, "handshake-timeout waiting for header");
            engine.teardown(Instant::now());
            return Ok(());
        },
    }

    let actions = engine.handle_protocol_header(&header, Instant::now());
    let mut closed = false;
    for action in &actions {
        if let ConnectionAction::SendRaw(bytes) = action {
            let _ = stream.write_all(bytes).await;
            closed = true;
        }
    }
    if closed || engine.state() == ConnectionState::Closed {
        engine.teardown(Instant::now());
        return Ok(());
    }

    let (read_half, write_half) = stream.into_split();

    // Writer: the single send path of this connection
    let last_write = Arc::new(Mutex::new(Instant::now()));
    let writer = tokio::spawn(writer_task(write_half, outbound_rx, Arc::clone(&last_write)));

    // Reader: frames in, over a channel so the coordinator's select stays
    // cancellation-safe
    let (event_tx, mut event_rx) = mpsc::channel::<ConnEvent>(64);
    // The reader caps frame sizes at the server's own offer; the engine's
    // negotiated value can only be lower, and the stricter check is there
    let frame_cap = broker.config().frame_max;
    let reader = tokio::spawn(reader_task(read_half, event_tx, frame_cap));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'conn: loop {
        tokio::select! {
            event = event_rx.recv() => {
                let now = Instant::now();
                let actions = match event {
                    Some(ConnEvent::Frame(frame)) => engine.handle_frame(&frame, now),
                    Some(ConnEvent::DecodeError(err)) => {
                        // The reader is already gone; flush the close frame
                        // and drop instead of waiting for a Close-Ok that
                        // can never be read
                        tracing::warn!(connection = id, %err, "frame decode failed");
                        let actions = engine.handle_decode_error(err, now);
                        let _ = execute(id, &actions);
                        break 'conn;
                    },
                    Some(ConnEvent::Disconnected) | None => {
                        tracing::debug!(connection = id, "peer disconnected");
                        break 'conn;
                    },
                };
                if execute(id, &actions) {
                    break 'conn;
                }
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                let last = last_write_instant(&last_write);
                let actions = engine.tick(now, last);
                if execute(id, &actions) {
                    break 'conn;
                }
            },
        }
    }

    engine.teardown(Instant::now());
    reader.abort();
    drop(engine); // drops the last outbound sender; the writer flushes and exits
    let _ = writer.await;

    tracing::debug!(connection = id, "connection finished");
    Ok(())
}

/// Apply actions; returns true once the connection should drop.
fn execute(id: u64, actions: &[ConnectionAction]) -> bool {
    let mut done = false;
    for action in actions {
        match action {
            ConnectionAction::Close { reason } => {
                tracing::info!(connection = id, reason, "closing");
                done = true;
            },
            ConnectionAction::SendRaw(_) => {
                // Only valid before the split; nothing sane to do here
                tracing::error!(connection = id, "unexpected raw send after handshake");
                done = true;
            },
        }
    }
    done
}

fn last_write_instant(shared: &Mutex<Instant>) -> Instant {
    *shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<RawFrame>,
    last_write: Arc<Mutex<Instant>>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(frame) = outbound.recv().await {
        buf.clear();
        frame.encode(&mut buf);
        if let Err(err) = write_half.write_all(&buf).await {
            tracing::debug!(%err, "write failed, stopping writer");
            break;
        }
        *last_write.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }
    let _ = write_half.shutdown().await;
}

/// Read frames off the socket: 7-byte envelope head, size-checked payload,
/// then the `0xCE` terminator, handed to `RawFrame::decode` as one buffer.
async fn reader_task(
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<ConnEvent>,
    frame_cap: u32,
) {
    loop {
        let mut head = [0u8; 7];
        if read_half.read_exact(&mut head).await.is_err() {
            let _ = events.send(ConnEvent::Disconnected).await;
            return;
        }

        let size = u32::from_be_bytes([head[3], head[4], head[5], head[6]]);
        if frame_cap != 0 && size > frame_cap {
            let _ = events
                .send(ConnEvent::DecodeError(ProtocolError::OversizeFrame {
                    size,
                    max: frame_cap,
                }))
                .await;
            return;
        }

        let total = 7 + size as usize + 1;
        let mut wire = vec![0u8; total];
        wire[..7].copy_from_slice(&head);
        if read_half.read_exact(&mut wire[7..]).await.is_err() {
            let _ = events.send(ConnEvent::Disconnected).await;
            return;
        }

        match RawFrame::decode(&wire, frame_cap) {
            Ok((frame, _consumed)) => {
                if events.send(ConnEvent::Frame(frame)).await.is_err() {
                    return;
                }
            },
            Err(err) => {
                let _ = events.send(ConnEvent::DecodeError(err)).await;
                return;
            },
        }
    }
}
