//! End-to-end tests over a real loopback socket.
//!
//! A minimal hand-rolled AMQP client drives the production server through
//! the literal wire scenarios: the full handshake, a declare/publish/get
//! round, and the heartbeat-timeout death of a silent client.

use std::time::Duration;

use bytes::BytesMut;
use ottermq_core::{Broker, BrokerConfig};
use ottermq_proto::{
    BasicMethod, BasicProperties, ChannelMethod, ConnectionMethod, ContentHeader, ExchangeMethod,
    FieldTable, FrameType, Method, PROTOCOL_HEADER, QueueMethod, RawFrame,
};
use ottermq_server::Server;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

async fn start_server(config: BrokerConfig) -> std::net::SocketAddr {
    let config = BrokerConfig { listen_addr: "127.0.0.1:0".to_string(), ..config };
    let broker = Broker::with_defaults(config);
    let server = Server::bind(broker).await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    addr
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self { stream }
    }

    async fn send_header(&mut self) {
        self.stream.write_all(&PROTOCOL_HEADER).await.expect("write header");
    }

    async fn send_frame(&mut self, frame: RawFrame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.stream.write_all(&buf).await.expect("write frame");
    }

    async fn send_method(&mut self, channel: u16, method: Method) {
        let frame = method.into_frame(channel).expect("encode method");
        self.send_frame(frame).await;
    }

    async fn read_frame(&mut self) -> RawFrame {
        let mut head = [0u8; 7];
        self.stream.read_exact(&mut head).await.expect("read frame head");
        let size = u32::from_be_bytes([head[3], head[4], head[5], head[6]]) as usize;

        let mut rest = vec![0u8; size + 1];
        self.stream.read_exact(&mut rest).await.expect("read frame rest");

        let mut wire = head.to_vec();
        wire.extend_from_slice(&rest);
        let (frame, _) = RawFrame::decode(&wire, 0).expect("decode frame");
        frame
    }

    /// Read frames until the next METHOD frame, decoded.
    async fn expect_method(&mut self) -> Method {
        loop {
            let frame = self.read_frame().await;
            if frame.kind == FrameType::Method {
                return Method::decode(&frame.payload).expect("decode method");
            }
        }
    }

    /// Run the good-path handshake and open channel 1. Returns the
    /// negotiated tuple.
    async fn open(&mut self) -> (u16, u32, u16) {
        self.send_header().await;

        let Method::Connection(ConnectionMethod::Start { mechanisms, locales, .. }) =
            self.expect_method().await
        else {
            panic!("expected connection.start");
        };
        assert!(mechanisms.contains("PLAIN"));
        assert!(locales.contains("en_US"));

        self.send_method(0, Method::Connection(ConnectionMethod::StartOk {
            client_properties: FieldTable::new(),
            mechanism: "PLAIN".into(),
            response: b"\x00guest\x00guest".to_vec(),
            locale: "en_US".into(),
        }))
        .await;

        let Method::Connection(ConnectionMethod::Tune { channel_max, frame_max, heartbeat }) =
            self.expect_method().await
        else {
            panic!("expected connection.tune");
        };

        self.send_method(0, Method::Connection(ConnectionMethod::TuneOk {
            channel_max,
            frame_max,
            heartbeat,
        }))
        .await;
        self.send_method(0, Method::Connection(ConnectionMethod::Open {
            virtual_host: "/".into(),
        }))
        .await;

        let Method::Connection(ConnectionMethod::OpenOk) = self.expect_method().await else {
            panic!("expected connection.open-ok");
        };

        self.send_method(1, Method::Channel(ChannelMethod::Open)).await;
        let Method::Channel(ChannelMethod::OpenOk) = self.expect_method().await else {
            panic!("expected channel.open-ok");
        };

        (channel_max, frame_max, heartbeat)
    }

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) {
        self.send_method(1, Method::Basic(BasicMethod::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
        }))
        .await;
        let header = ContentHeader::basic(body.len() as u64, BasicProperties::default());
        self.send_frame(RawFrame::header(1, header.encode().expect("encode header"))).await;
        if !body.is_empty() {
            self.send_frame(RawFrame::body(1, body.to_vec())).await;
        }
    }
}

#[tokio::test]
async fn scenario_handshake_negotiates_the_literal_tuple() {
    let addr = start_server(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;

    let negotiated = timeout(Duration::from_secs(5), client.open()).await.expect("handshake");
    assert_eq!(negotiated, (2047, 131_072, 60));
}

#[tokio::test]
async fn scenario_declare_bind_publish_get_over_tcp() {
    let addr = start_server(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    timeout(Duration::from_secs(5), client.open()).await.expect("handshake");

    client
        .send_method(1, Method::Exchange(ExchangeMethod::Declare {
            exchange: "ex1".into(),
            kind: "direct".into(),
            passive: false,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: FieldTable::new(),
        }))
        .await;
    assert!(matches!(
        client.expect_method().await,
        Method::Exchange(ExchangeMethod::DeclareOk)
    ));

    client
        .send_method(1, Method::Queue(QueueMethod::Declare {
            queue: "q1".into(),
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            no_wait: false,
            arguments: FieldTable::new(),
        }))
        .await;
    assert!(matches!(
        client.expect_method().await,
        Method::Queue(QueueMethod::DeclareOk { .. })
    ));

    client
        .send_method(1, Method::Queue(QueueMethod::Bind {
            queue: "q1".into(),
            exchange: "ex1".into(),
            routing_key: "rk1".into(),
            no_wait: false,
            arguments: FieldTable::new(),
        }))
        .await;
    assert!(matches!(client.expect_method().await, Method::Queue(QueueMethod::BindOk)));

    client.publish("ex1", "rk1", b"hello").await;

    client
        .send_method(1, Method::Basic(BasicMethod::Get { queue: "q1".into(), no_ack: true }))
        .await;

    let Method::Basic(BasicMethod::GetOk { exchange, routing_key, message_count, .. }) =
        timeout(Duration::from_secs(5), client.expect_method()).await.expect("get-ok")
    else {
        panic!("expected basic.get-ok");
    };
    assert_eq!(exchange, "ex1");
    assert_eq!(routing_key, "rk1");
    assert_eq!(message_count, 0);

    let header = client.read_frame().await;
    assert_eq!(header.kind, FrameType::Header);
    let parsed = ContentHeader::decode(&header.payload).expect("decode content header");
    assert_eq!(parsed.body_size, 5);

    let body = client.read_frame().await;
    assert_eq!(body.kind, FrameType::Body);
    assert_eq!(body.payload.as_ref(), b"hello");
}

#[tokio::test]
async fn scenario_consume_delivers_over_tcp() {
    let addr = start_server(BrokerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    timeout(Duration::from_secs(5), client.open()).await.expect("handshake");

    client
        .send_method(1, Method::Queue(QueueMethod::Declare {
            queue: "jobs".into(),
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            no_wait: false,
            arguments: FieldTable::new(),
        }))
        .await;
    client.expect_method().await;

    client.publish("", "jobs", b"payload").await;

    client
        .send_method(1, Method::Basic(BasicMethod::Consume {
            queue: "jobs".into(),
            consumer_tag: String::new(),
            no_local: false,
            no_ack: true,
            exclusive: false,
            no_wait: false,
            arguments: FieldTable::new(),
        }))
        .await;

    let Method::Basic(BasicMethod::ConsumeOk { consumer_tag }) =
        timeout(Duration::from_secs(5), client.expect_method()).await.expect("consume-ok")
    else {
        panic!("expected basic.consume-ok");
    };
    assert!(!consumer_tag.is_empty());

    let Method::Basic(BasicMethod::Deliver { delivery_tag, redelivered, .. }) =
        timeout(Duration::from_secs(5), client.expect_method()).await.expect("deliver")
    else {
        panic!("expected basic.deliver");
    };
    assert_eq!(delivery_tag, 1);
    assert!(!redelivered);

    let header = client.read_frame().await;
    assert_eq!(header.kind, FrameType::Header);
    let body = client.read_frame().await;
    assert_eq!(body.payload.as_ref(), b"payload");
}

#[tokio::test]
async fn scenario_silent_client_is_closed_for_missed_heartbeat() {
    let config = BrokerConfig { heartbeat: 1, ..Default::default() };
    let addr = start_server(config).await;
    let mut client = TestClient::connect(addr).await;
    timeout(Duration::from_secs(5), client.open()).await.expect("handshake");

    // Say nothing. The server should emit a heartbeat around t=1s and
    // close the socket once nothing arrived for 2 x heartbeat.
    let deadline = Duration::from_secs(6);
    let outcome = timeout(deadline, async {
        let mut heartbeats = 0u32;
        loop {
            let mut head = [0u8; 7];
            match client.stream.read_exact(&mut head).await {
                Ok(_) => {
                    let size =
                        u32::from_be_bytes([head[3], head[4], head[5], head[6]]) as usize;
                    let mut rest = vec![0u8; size + 1];
                    client.stream.read_exact(&mut rest).await.expect("frame rest");
                    if head[0] == FrameType::Heartbeat.to_u8() {
                        heartbeats += 1;
                    }
                },
                Err(_) => return heartbeats, // server closed on us
            }
        }
    })
    .await
    .expect("server should close the silent connection");

    assert!(outcome >= 1, "expected at least one server heartbeat before the close");
}

#[tokio::test]
async fn bad_protocol_header_gets_the_server_header_back() {
    let addr = start_server(BrokerConfig::default()).await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    stream.write_all(b"AMQP\x01\x01\x00\x09").await.expect("write bogus header");

    let mut reply = [0u8; 8];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("read reply")
        .expect("server header");
    assert_eq!(reply, PROTOCOL_HEADER);

    // And then the socket closes
    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(5), stream.read_exact(&mut probe)).await;
    assert!(matches!(read, Ok(Err(_))), "expected EOF after header exchange");
}
