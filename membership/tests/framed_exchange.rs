use {
    crossbeam_channel::{unbounded, Receiver, Sender},
    serial_test::serial,
    std::{net::TcpStream, sync::Arc, time::Duration},
    test_case::test_case,
    trv1_membership::{
        config::MembershipConfig,
        error::Result,
        framing::FrameFormat,
        io_connection::{FrameSink, FramedConnection, IoConnection},
        reactor::{ChannelHandler, HandlerFactory, Reactor, ReactorHandle, Token},
    },
};

const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Answers every frame with the same bytes reversed.
struct Reverser;

impl FrameSink for Reverser {
    fn deliver(&self, connection: &Arc<FramedConnection>, mut payload: Vec<u8>) -> Result<()> {
        payload.reverse();
        connection.send(payload)
    }

    fn closing(&self, _token: Token) {}
}

struct ReverserFactory(FrameFormat);

impl HandlerFactory for ReverserFactory {
    fn create_handler(
        &self,
        stream: TcpStream,
        token: Token,
        reactor: &ReactorHandle,
    ) -> Arc<dyn ChannelHandler> {
        FramedConnection::new(stream, token, reactor, self.0, MAX_FRAME_SIZE, Arc::new(Reverser))
    }
}

struct Collector {
    frames: Sender<Vec<u8>>,
    closed: Sender<Token>,
}

impl FrameSink for Collector {
    fn deliver(&self, _connection: &Arc<FramedConnection>, payload: Vec<u8>) -> Result<()> {
        let _ = self.frames.send(payload);
        Ok(())
    }

    fn closing(&self, token: Token) {
        let _ = self.closed.send(token);
    }
}

fn connect(
    client: &Reactor,
    server: &Reactor,
    format: FrameFormat,
) -> (Arc<FramedConnection>, Receiver<Vec<u8>>, Receiver<Token>) {
    let addr = server
        .listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(ReverserFactory(format)),
        )
        .unwrap();
    let (stream_sender, stream_receiver) = unbounded();
    client
        .handle()
        .connect(addr, move |result| {
            let _ = stream_sender.send(result);
        })
        .unwrap();
    let stream = stream_receiver
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    let (frames, frame_receiver) = unbounded();
    let (closed, closed_receiver) = unbounded();
    let handle = client.handle();
    let connection = FramedConnection::new(
        stream,
        handle.next_token(),
        handle,
        format,
        MAX_FRAME_SIZE,
        Arc::new(Collector { frames, closed }),
    );
    connection.register();
    connection.start_reading().unwrap();
    (connection, frame_receiver, closed_receiver)
}

#[test_case(FrameFormat::Plain; "plain")]
#[test_case(FrameFormat::Sequenced; "sequenced")]
#[serial]
fn test_request_reply_over_loopback(format: FrameFormat) {
    trv1_logger::setup();
    let config = MembershipConfig::dev_default();
    let server = Reactor::new("srv", &config).unwrap();
    let client = Reactor::new("cli", &config).unwrap();
    let (connection, frames, _closed) = connect(&client, &server, format);

    let payloads: Vec<Vec<u8>> = (0..200u32)
        .map(|i| {
            let len = usize::try_from(i * 97 % 5000).unwrap();
            (0..len).map(|b| (b % 251) as u8).collect()
        })
        .collect();
    for payload in &payloads {
        connection.send(payload.clone()).unwrap();
    }
    for payload in &payloads {
        let mut expected = payload.clone();
        expected.reverse();
        assert_eq!(
            frames.recv_timeout(Duration::from_secs(5)).unwrap(),
            expected
        );
    }
    assert!(client.handle().stats().frames_written.get() >= 200);

    client.shutdown();
    server.shutdown();
}

#[test]
#[serial]
fn test_large_frame_survives_partial_io() {
    trv1_logger::setup();
    let config = MembershipConfig::dev_default();
    let server = Reactor::new("srv", &config).unwrap();
    let client = Reactor::new("cli", &config).unwrap();
    let (connection, frames, _closed) = connect(&client, &server, FrameFormat::Sequenced);

    let big = vec![7u8; MAX_FRAME_SIZE];
    connection.send(big.clone()).unwrap();
    connection.send(b"after".to_vec()).unwrap();
    assert_eq!(frames.recv_timeout(Duration::from_secs(5)).unwrap(), big);
    assert_eq!(
        frames.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"retfa".to_vec()
    );

    client.shutdown();
    server.shutdown();
}

#[test]
#[serial]
fn test_server_shutdown_closes_client() {
    trv1_logger::setup();
    let config = MembershipConfig::dev_default();
    let server = Reactor::new("srv", &config).unwrap();
    let client = Reactor::new("cli", &config).unwrap();
    let (connection, frames, closed) = connect(&client, &server, FrameFormat::Sequenced);

    connection.send(b"ping".to_vec()).unwrap();
    assert_eq!(
        frames.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"gnip".to_vec()
    );

    server.shutdown();
    assert_eq!(
        closed.recv_timeout(Duration::from_secs(5)).unwrap(),
        connection.token()
    );
    assert!(!connection.is_open());
    assert!(connection.send(b"late".to_vec()).is_err());

    client.shutdown();
}
