//! Connection engine tests against a scripted peer over an in-memory pipe.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio::time::{Instant, timeout};
use wsconn::codec::FrameReader;
use wsconn::extensions::ExtensionPipeline;
use wsconn::protocol::{Frame, OpCode};
use wsconn::{
    CloseCode, CloseFrame, Config, Connection, ConnectionState, Error, Message, Role, Transport,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The other end of the connection, driven frame by frame.
struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    mask: bool,
    pipeline: Mutex<ExtensionPipeline>,
}

impl Peer {
    fn new(io: DuplexStream, role: Role) -> Self {
        let (read, writer) = tokio::io::split(io);
        Self {
            reader: FrameReader::new(read, role.expects_masked(), 4096),
            writer,
            mask: role.must_mask(),
            pipeline: Mutex::new(ExtensionPipeline::default()),
        }
    }

    async fn send(&mut self, frame: Frame) {
        let key = self.mask.then_some([0x11, 0x22, 0x33, 0x44]);
        let mut buf = BytesMut::new();
        frame.write(&mut buf, key);
        self.writer.write_all(&buf).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn send_close(&mut self, code: u16, reason: &str) {
        let payload = CloseFrame::new(CloseCode::from_u16(code), reason)
            .serialize()
            .unwrap();
        self.send(Frame::close(payload)).await;
    }

    async fn recv(&mut self) -> Option<Frame> {
        self.reader.read_frame(None, &self.pipeline).await.unwrap()
    }

    async fn recv_close(&mut self) -> CloseFrame {
        let frame = self.recv().await.expect("expected a close frame");
        assert_eq!(frame.opcode, OpCode::Close);
        CloseFrame::parse(&frame.payload).unwrap()
    }

    /// Read until the engine closes its side, returning the frames seen.
    async fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv().await {
            frames.push(frame);
        }
        frames
    }
}

fn server_pair(config: &Config) -> (Connection<DuplexStream>, Peer) {
    init_tracing();
    let (local, remote) = tokio::io::duplex(64 * 1024);
    (
        Connection::new(local, Role::Server, config),
        Peer::new(remote, Role::Client),
    )
}

fn closed(code: u16, reason: &str) -> Error {
    Error::ConnectionClosed {
        code,
        reason: reason.to_string(),
    }
}

#[tokio::test]
async fn test_receive_text_and_binary() {
    let (conn, mut peer) = server_pair(&Config::server());
    peer.send(Frame::text("hello")).await;
    peer.send(Frame::binary(vec![1, 2, 3])).await;

    assert_eq!(conn.recv().await.unwrap(), Message::text("hello"));
    assert_eq!(conn.recv().await.unwrap(), Message::binary(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_send_is_unmasked_from_server() {
    let (conn, mut peer) = server_pair(&Config::server());
    conn.send("hi").await.unwrap();
    conn.send(vec![0xAB; 300]).await.unwrap();

    let text = peer.recv().await.unwrap();
    assert_eq!(text, Frame::text("hi"));
    let binary = peer.recv().await.unwrap();
    assert_eq!(binary.payload.len(), 300);
}

#[tokio::test]
async fn test_fragmented_message_with_interleaved_ping() {
    let (conn, mut peer) = server_pair(&Config::server());
    peer.send(Frame::new(false, OpCode::Text, b"hel".to_vec())).await;
    peer.send(Frame::ping(b"p".to_vec())).await;
    peer.send(Frame::new(true, OpCode::Continuation, b"lo".to_vec())).await;

    assert_eq!(conn.recv().await.unwrap(), Message::text("hello"));
    assert_eq!(peer.recv().await.unwrap(), Frame::pong(b"p".to_vec()));
}

#[tokio::test]
async fn test_messages_keep_order_with_small_queue() {
    let config = Config::server().with_max_queue(1);
    let (conn, mut peer) = server_pair(&config);
    for i in 0..5 {
        peer.send(Frame::text(format!("message {i}"))).await;
    }
    for i in 0..5 {
        assert_eq!(conn.recv().await.unwrap(), Message::text(format!("message {i}")));
    }
}

#[tokio::test]
async fn test_unsolicited_pong_is_ignored() {
    let (conn, mut peer) = server_pair(&Config::server());
    peer.send(Frame::pong(b"nobody asked".to_vec())).await;
    peer.send(Frame::text("still open")).await;
    assert_eq!(conn.recv().await.unwrap(), Message::text("still open"));
    assert!(conn.is_open());
}

#[tokio::test]
async fn test_pong_acknowledges_earlier_pings() {
    let (conn, mut peer) = server_pair(&Config::server());
    let a = conn.ping(Some(b"A".to_vec())).await.unwrap();
    let b = conn.ping(Some(b"B".to_vec())).await.unwrap();
    let c = conn.ping(Some(b"C".to_vec())).await.unwrap();
    for expected in [b"A", b"B", b"C"] {
        assert_eq!(peer.recv().await.unwrap(), Frame::ping(expected.to_vec()));
    }

    peer.send(Frame::pong(b"B".to_vec())).await;
    assert_eq!(a.await, Ok(()));
    assert_eq!(b.await, Ok(()));
    assert!(timeout(Duration::from_millis(50), c).await.is_err());
}

#[tokio::test]
async fn test_duplicate_ping_is_rejected() {
    let (conn, _peer) = server_pair(&Config::server());
    let _waiter = conn.ping(Some(b"same".to_vec())).await.unwrap();
    assert_eq!(
        conn.ping(Some(b"same".to_vec())).await.unwrap_err(),
        Error::DuplicatePing
    );
    assert!(matches!(
        conn.ping(Some(vec![0; 126])).await,
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn test_ping_with_random_payload() {
    let (conn, mut peer) = server_pair(&Config::server());
    let waiter = conn.ping(None).await.unwrap();
    let ping = peer.recv().await.unwrap();
    assert_eq!(ping.opcode, OpCode::Ping);
    assert_eq!(ping.payload.len(), 4);
    peer.send(Frame::pong(ping.payload)).await;
    assert_eq!(waiter.await, Ok(()));
}

#[tokio::test]
async fn test_unsolicited_pong_is_sent() {
    let (conn, mut peer) = server_pair(&Config::server());
    conn.pong(b"heartbeat".to_vec()).await.unwrap();
    assert_eq!(peer.recv().await.unwrap(), Frame::pong(b"heartbeat".to_vec()));
}

#[tokio::test]
async fn test_peer_close_is_echoed() {
    let (conn, mut peer) = server_pair(&Config::server());
    peer.send_close(1000, "bye").await;

    let echo = peer.recv_close().await;
    assert_eq!(echo, CloseFrame::new(CloseCode::Normal, "bye"));
    assert!(peer.drain().await.is_empty());
    drop(peer);

    conn.wait_closed().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.close_code(), Some(1000));
    assert_eq!(conn.close_reason().as_deref(), Some("bye"));
    assert_eq!(conn.recv().await.unwrap_err(), closed(1000, "bye"));
    assert_eq!(conn.send("late").await.unwrap_err(), closed(1000, "bye"));
}

#[tokio::test]
async fn test_close_without_status_code() {
    let (conn, mut peer) = server_pair(&Config::server());
    peer.send(Frame::close(Vec::new())).await;

    let echo = peer.recv().await.unwrap();
    assert_eq!(echo, Frame::close(Vec::new()));
    drop(peer);

    conn.wait_closed().await;
    assert_eq!(conn.close_code(), Some(1005));
}

#[tokio::test]
async fn test_close_inside_fragmented_message_is_echoed() {
    let (conn, mut peer) = server_pair(&Config::server());
    peer.send(Frame::new(false, OpCode::Binary, vec![1, 2])).await;
    peer.send_close(1000, "abandon").await;

    assert_eq!(peer.recv_close().await.reason, "abandon");
    drop(peer);
    assert_eq!(conn.recv().await.unwrap_err(), closed(1000, "abandon"));
}

#[tokio::test]
async fn test_messages_before_close_are_delivered() {
    let (conn, mut peer) = server_pair(&Config::server());
    peer.send(Frame::text("first")).await;
    peer.send_close(1001, "going").await;
    peer.recv_close().await;
    drop(peer);

    assert_eq!(conn.recv().await.unwrap(), Message::text("first"));
    assert_eq!(conn.recv().await.unwrap_err(), closed(1001, "going"));
}

async fn expect_failure(config: &Config, bytes: Option<&[u8]>, frame: Option<Frame>, code: u16) {
    let (conn, mut peer) = server_pair(config);
    if let Some(bytes) = bytes {
        peer.send_raw(bytes).await;
    }
    if let Some(frame) = frame {
        peer.send(frame).await;
    }

    let close = peer.recv_close().await;
    assert_eq!(close.code.as_u16(), code);
    drop(peer);

    let err = conn.recv().await.unwrap_err();
    assert!(
        matches!(err, Error::ConnectionClosed { code: c, .. } if c == code),
        "unexpected {err:?}"
    );
    conn.wait_closed().await;
    assert_eq!(conn.close_code(), Some(code));
}

#[tokio::test]
async fn test_unmasked_frame_fails_with_protocol_error() {
    expect_failure(&Config::server(), Some(&[0x81, 0x02, b'h', b'i']), None, 1002).await;
}

#[tokio::test]
async fn test_reserved_bits_fail_with_protocol_error() {
    let mut frame = Frame::text("x");
    frame.rsv2 = true;
    expect_failure(&Config::server(), None, Some(frame), 1002).await;
}

#[tokio::test]
async fn test_continuation_without_start_fails() {
    let frame = Frame::new(true, OpCode::Continuation, b"x".to_vec());
    expect_failure(&Config::server(), None, Some(frame), 1002).await;
}

#[tokio::test]
async fn test_fragmented_control_frame_fails() {
    let frame = Frame::new(false, OpCode::Ping, Vec::new());
    expect_failure(&Config::server(), None, Some(frame), 1002).await;
}

#[tokio::test]
async fn test_invalid_close_code_fails() {
    let frame = Frame::close(1006u16.to_be_bytes().to_vec());
    expect_failure(&Config::server(), None, Some(frame), 1002).await;
}

#[tokio::test]
async fn test_oversized_message_fails_with_1009() {
    let config = Config::server().with_max_size(Some(10));
    expect_failure(&config, None, Some(Frame::binary(vec![0; 11])), 1009).await;
}

#[tokio::test]
async fn test_oversized_fragments_fail_with_1009() {
    let config = Config::server().with_max_size(Some(10));
    let (conn, mut peer) = server_pair(&config);
    peer.send(Frame::new(false, OpCode::Binary, vec![0; 6])).await;
    peer.send(Frame::new(true, OpCode::Continuation, vec![0; 6])).await;

    assert_eq!(peer.recv_close().await.code, CloseCode::MessageTooBig);
    drop(peer);
    assert_eq!(conn.recv().await.unwrap_err().close_code(), 1009);
}

#[tokio::test]
async fn test_invalid_utf8_fails_with_1007() {
    let frame = Frame::new(true, OpCode::Text, vec![0xFF, 0xFE]);
    expect_failure(&Config::server(), None, Some(frame), 1007).await;
}

#[tokio::test]
async fn test_invalid_utf8_close_reason_fails_with_1007() {
    let frame = Frame::close(vec![0x03, 0xE8, 0xFF]);
    expect_failure(&Config::server(), None, Some(frame), 1007).await;
}

#[tokio::test]
async fn test_eof_without_close_is_abnormal() {
    let (conn, peer) = server_pair(&Config::server());
    drop(peer);

    assert_eq!(conn.recv().await.unwrap_err(), closed(1006, ""));
    conn.wait_closed().await;
    assert!(conn.is_closed());
    assert_eq!(conn.close_code(), Some(1006));
    assert_eq!(conn.send("x").await.unwrap_err(), closed(1006, ""));
}

#[tokio::test]
async fn test_pending_ping_fails_when_connection_ends() {
    let (conn, mut peer) = server_pair(&Config::server());
    let waiter = conn.ping(Some(b"lost".to_vec())).await.unwrap();
    peer.recv().await.unwrap();
    drop(peer);

    assert_eq!(waiter.await, Err(closed(1006, "")));
}

#[tokio::test]
async fn test_local_close() {
    let (conn, mut peer) = server_pair(&Config::server());
    let peer_side = async move {
        let close = peer.recv_close().await;
        assert_eq!(close, CloseFrame::new(CloseCode::Normal, "done"));
        peer.send_close(1000, "done").await;
        assert!(peer.drain().await.is_empty());
    };

    let (result, ()) = tokio::join!(conn.close(CloseCode::Normal, "done"), peer_side);
    result.unwrap();
    assert!(conn.is_closed());
    assert_eq!(conn.close_code(), Some(1000));
    assert_eq!(conn.close_reason().as_deref(), Some("done"));
}

#[tokio::test]
async fn test_simultaneous_close_keeps_remote_reason() {
    let (conn, mut peer) = server_pair(&Config::server());

    // Both close frames are on the wire before either side reads.
    let peer_side = async move {
        peer.send_close(1000, "remote").await;
        let close = peer.recv_close().await;
        assert_eq!(close.reason, "local");
        assert!(peer.drain().await.is_empty());
    };
    let ((), result) = tokio::join!(peer_side, conn.close(1000u16, "local"));
    result.unwrap();

    assert!(conn.is_closed());
    assert_eq!(conn.close_code(), Some(1000));
    assert_eq!(conn.close_reason().as_deref(), Some("remote"));
}

#[tokio::test]
async fn test_concurrent_close_writes_one_frame() {
    let (conn, mut peer) = server_pair(&Config::server());
    let peer_side = async move {
        let first = peer.recv_close().await;
        peer.send_close(first.code.as_u16(), &first.reason).await;
        peer.drain().await
    };

    let (a, b, rest) = tokio::join!(
        conn.close(CloseCode::Normal, "a"),
        conn.close(CloseCode::GoingAway, "b"),
        peer_side
    );
    a.unwrap();
    b.unwrap();
    assert!(rest.is_empty(), "unexpected frames after close: {rest:?}");
    assert!(conn.is_closed());

    // Closing again is a no-op.
    conn.close(CloseCode::Normal, "again").await.unwrap();
}

#[tokio::test]
async fn test_close_rejects_invalid_arguments() {
    let (conn, _peer) = server_pair(&Config::server());
    assert_eq!(
        conn.close(1006u16, "").await,
        Err(Error::InvalidCloseCode(1006))
    );
    assert!(matches!(
        conn.close(CloseCode::Normal, &"x".repeat(124)).await,
        Err(Error::Protocol(_))
    ));
    assert!(conn.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_close_is_bounded_when_peer_is_silent() {
    let config = Config::server().with_timeout(Duration::from_secs(2));
    let (conn, _peer) = server_pair(&config);

    let started = Instant::now();
    conn.close(CloseCode::Normal, "").await.unwrap();
    let elapsed = started.elapsed();

    assert!(conn.is_closed());
    assert_eq!(conn.close_code(), Some(1006));
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed <= Duration::from_secs(10), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_abort_interrupts_blocked_send() {
    init_tracing();
    let (local, mut remote) = tokio::io::duplex(1024);
    let config = Config::server().with_timeout(Duration::from_secs(1));
    let conn = Arc::new(Connection::new(local, Role::Server, &config));

    // The peer never reads, so this write fills the pipe and blocks.
    let sender = Arc::clone(&conn);
    let send = tokio::spawn(async move { sender.send(vec![0u8; 1 << 20]).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!send.is_finished());

    conn.close(CloseCode::Normal, "").await.unwrap();
    assert!(conn.is_closed());
    assert_eq!(conn.close_code(), Some(1006));

    let result = timeout(Duration::from_secs(5), send)
        .await
        .expect("send still blocked after close")
        .unwrap();
    assert_eq!(result, Err(closed(1006, "")));

    // The transport was released.
    assert!(remote.write_all(b"late").await.is_err());
}

#[tokio::test]
async fn test_cancelled_recv_loses_no_message() {
    let (conn, mut peer) = server_pair(&Config::server());

    assert!(timeout(Duration::from_millis(20), conn.recv()).await.is_err());
    peer.send(Frame::text("after timeout")).await;
    assert_eq!(conn.recv().await.unwrap(), Message::text("after timeout"));

    for i in 0..20 {
        let text = format!("message {i}");
        // The pending recv is dropped as soon as the frame is written.
        tokio::select! {
            biased;
            message = conn.recv() => panic!("unexpected {message:?}"),
            () = peer.send(Frame::text(text.clone())) => {}
        }
        assert_eq!(conn.recv().await.unwrap(), Message::text(text));
    }
}

/// A stream that cannot shut down one direction alone, like TLS.
struct WholeStream(DuplexStream);

impl AsyncRead for WholeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for WholeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Transport for WholeStream {
    fn supports_half_close(&self) -> bool {
        false
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_peer_without_half_close() {
    init_tracing();
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let config = Config::server().with_timeout(Duration::from_secs(2));
    let conn = Connection::new(WholeStream(local), Role::Server, &config);
    let mut peer = Peer::new(remote, Role::Client);

    let peer_side = async move {
        let close = peer.recv_close().await;
        peer.send_close(close.code.as_u16(), &close.reason).await;
        assert!(peer.drain().await.is_empty());
        // Linger before closing our end.
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    let started = Instant::now();
    let (result, ()) = tokio::join!(conn.close(CloseCode::Normal, "done"), peer_side);
    result.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(conn.close_code(), Some(1000));
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test]
async fn test_drop_aborts_transport() {
    let (conn, mut peer) = server_pair(&Config::server());
    drop(conn);
    assert!(peer.drain().await.is_empty());
}

#[tokio::test]
async fn test_client_masks_and_waits_for_server_to_close() {
    init_tracing();
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(local, Role::Client, &Config::client());
    let mut server = Peer::new(remote, Role::Server);

    conn.send("masked").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), Frame::text("masked"));

    let server_side = async move {
        let close = server.recv_close().await;
        server.send_close(close.code.as_u16(), &close.reason).await;
        // The server closes the transport first.
    };
    let (result, ()) = tokio::join!(conn.close(CloseCode::Normal, ""), server_side);
    result.unwrap();
    assert_eq!(conn.close_code(), Some(1000));
}
