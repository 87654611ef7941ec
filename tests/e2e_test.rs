//! End-to-end integration tests for xrelay.
//!
//! These tests run a relay on loopback between a real client socket and a
//! real backend socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use xrelay::{
    Acceptor, CipherKey, Deadlines, KeyedReader, KeyedWriter, MessageCipher, MessageRead,
    MessageWrite, RelayConfig, RelayEngine, TransportError, DEFAULT_BUFFER_SIZE, MAX_MESSAGE_SIZE,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A running relay on loopback.
struct TestRelay {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestRelay {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(TEST_TIMEOUT, self.handle)
            .await
            .expect("relay did not shut down")
            .unwrap();
    }
}

fn relay_config(backend: &str, front: Option<&str>, back: Option<&str>) -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        backend: backend.to_string(),
        front_secret: front.map(str::to_string),
        back_secret: back.map(str::to_string),
        deadlines: Deadlines::default(),
        buffer_size: DEFAULT_BUFFER_SIZE,
        max_idle_buffers: 64,
    }
}

async fn start_relay_with<A: Acceptor + 'static>(
    acceptor: A,
    addr: SocketAddr,
    config: RelayConfig,
) -> TestRelay {
    let engine = Arc::new(RelayEngine::new(&config));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(engine.serve(acceptor, async move {
        let _ = shutdown_rx.await;
    }));
    println!("Relay listening on {}", addr);
    TestRelay {
        addr,
        shutdown_tx,
        handle,
    }
}

async fn start_relay(backend: &str, front: Option<&str>, back: Option<&str>) -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    start_relay_with(listener, addr, relay_config(backend, front, back)).await
}

/// Starts a backend that echoes every byte back until the peer closes.
async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, peer)) = listener.accept().await else {
                return;
            };
            println!("Backend: accepted connection from {}", peer);
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn cipher(secret: &str) -> Arc<MessageCipher> {
    Arc::new(MessageCipher::new(&CipherKey::derive(secret).unwrap()))
}

/// Reads until EOF or a socket error, returning what was read.
async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}

#[tokio::test]
async fn test_keyed_front_plain_back() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();

    let backend_task = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        println!("Backend: received {:?}", &buf);
        assert_eq!(&buf, b"PING");
        stream.write_all(b"PONG").await.unwrap();
        stream.flush().await.unwrap();
        // hold the socket open until the client is done
        let _ = read_to_close(&mut stream).await;
    });

    let relay = start_relay(&backend_addr.to_string(), Some("abc"), None).await;

    let client = TcpStream::connect(relay.addr).await.unwrap();
    let (read_half, write_half) = client.into_split();
    let mut writer = KeyedWriter::new(write_half, cipher("abc"), Duration::from_secs(5));
    let mut reader = KeyedReader::new(read_half, cipher("abc"), Duration::from_secs(5));

    let wire = writer.write_message(b"PING").await.unwrap();
    assert_eq!(wire, 4 + 12 + 4 + 16);

    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let n = reader.read_message(&mut buf).await.unwrap();
    println!("Client: received {:?}", &buf[..n]);
    assert_eq!(&buf[..n], b"PONG");

    drop(writer);
    drop(reader);
    tokio::time::timeout(TEST_TIMEOUT, backend_task)
        .await
        .expect("backend did not observe close")
        .unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_plain_pass_through_large_transfer() {
    let backend_addr = start_echo_backend().await;
    let relay = start_relay(&backend_addr.to_string(), None, None).await;

    let client = TcpStream::connect(relay.addr).await.unwrap();
    let (mut read_half, mut write_half) = client.into_split();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let write_task = tokio::spawn(async move {
        write_half.write_all(&payload).await.unwrap();
        write_half
    });

    let mut received = vec![0u8; expected.len()];
    tokio::time::timeout(TEST_TIMEOUT, read_half.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(received, expected);

    drop(write_task.await.unwrap());
    relay.stop().await;
}

#[tokio::test]
async fn test_keyed_messages_pass_unchanged() {
    let backend_addr = start_echo_backend().await;
    let relay = start_relay(&backend_addr.to_string(), Some("front"), None).await;

    let client = TcpStream::connect(relay.addr).await.unwrap();
    let (read_half, write_half) = client.into_split();
    let mut writer = KeyedWriter::new(write_half, cipher("front"), Duration::from_secs(5));
    let mut reader = KeyedReader::new(read_half, cipher("front"), Duration::from_secs(5));

    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    for message in [&b"x"[..], &b"hello world"[..], &[7u8; 4000][..]] {
        writer.write_message(message).await.unwrap();

        // the echo may split the reply across several frames
        let mut echoed = Vec::new();
        while echoed.len() < message.len() {
            let n = tokio::time::timeout(TEST_TIMEOUT, reader.read_message(&mut buf))
                .await
                .expect("echo timed out")
                .unwrap();
            assert!(n > 0);
            echoed.extend_from_slice(&buf[..n]);
        }
        assert_eq!(echoed, message);
    }

    relay.stop().await;
}

#[tokio::test]
async fn test_keyed_message_larger_than_relay_buffer() {
    let backend_addr = start_echo_backend().await;
    let relay = start_relay(&backend_addr.to_string(), Some("front"), None).await;

    let client = TcpStream::connect(relay.addr).await.unwrap();
    let (read_half, write_half) = client.into_split();
    let mut writer = KeyedWriter::new(write_half, cipher("front"), Duration::from_secs(5));
    let mut reader = KeyedReader::new(read_half, cipher("front"), Duration::from_secs(5));

    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    for len in [10 * 1024, MAX_MESSAGE_SIZE] {
        let message: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        writer.write_message(&message).await.unwrap();
        println!("Client: sent {} byte message", len);

        // the reply comes back in relay-buffer sized frames
        let mut echoed = Vec::new();
        while echoed.len() < message.len() {
            let n = tokio::time::timeout(TEST_TIMEOUT, reader.read_message(&mut buf))
                .await
                .expect("echo timed out")
                .unwrap();
            assert!(n > 0);
            assert!(n <= DEFAULT_BUFFER_SIZE);
            echoed.extend_from_slice(&buf[..n]);
        }
        assert_eq!(echoed, message);
    }

    relay.stop().await;
}

#[tokio::test]
async fn test_chained_relays_use_independent_keys() {
    // client -plain-> outer -keyed "hop"-> inner -plain-> backend
    let backend_addr = start_echo_backend().await;
    let inner = start_relay(&backend_addr.to_string(), Some("hop"), None).await;
    let outer = start_relay(&inner.addr.to_string(), None, Some("hop")).await;

    let mut client = TcpStream::connect(outer.addr).await.unwrap();
    client.write_all(b"hello through two hops").await.unwrap();

    let mut buf = [0u8; 22];
    tokio::time::timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .expect("chained echo timed out")
        .unwrap();
    assert_eq!(&buf, b"hello through two hops");

    drop(client);
    outer.stop().await;
    inner.stop().await;
}

#[tokio::test]
async fn test_mismatched_keys_tear_down_pair() {
    let backend_addr = start_echo_backend().await;
    let inner = start_relay(&backend_addr.to_string(), Some("right"), None).await;
    let outer = start_relay(&inner.addr.to_string(), None, Some("wrong")).await;

    let mut client = TcpStream::connect(outer.addr).await.unwrap();
    client.write_all(b"never decrypted").await.unwrap();

    let received = tokio::time::timeout(TEST_TIMEOUT, read_to_close(&mut client))
        .await
        .expect("client was not closed");
    assert!(received.is_empty());

    outer.stop().await;
    inner.stop().await;
}

#[tokio::test]
async fn test_corrupt_frame_closes_both_legs() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let backend_task = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        read_to_close(&mut stream).await
    });

    let relay = start_relay(&backend_addr.to_string(), Some("abc"), None).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    // valid length prefix, garbage sealed body
    client.write_all(&40u32.to_be_bytes()).await.unwrap();
    client.write_all(&[0xAA; 40]).await.unwrap();

    let received = tokio::time::timeout(TEST_TIMEOUT, read_to_close(&mut client))
        .await
        .expect("client was not closed");
    assert!(received.is_empty());

    let forwarded = tokio::time::timeout(TEST_TIMEOUT, backend_task)
        .await
        .expect("backend was not closed")
        .unwrap();
    assert!(forwarded.is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_backend_close_closes_client() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        stream.write_all(b"bye").await.unwrap();
        println!("Backend: closing connection");
    });

    let relay = start_relay(&backend_addr.to_string(), None, None).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    let received = tokio::time::timeout(TEST_TIMEOUT, read_to_close(&mut client))
        .await
        .expect("client was not closed after backend close");
    assert_eq!(received, b"bye");

    relay.stop().await;
}

#[tokio::test]
async fn test_client_close_closes_backend() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let backend_task = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        read_to_close(&mut stream).await
    });

    let relay = start_relay(&backend_addr.to_string(), None, None).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    drop(client);

    let received = tokio::time::timeout(TEST_TIMEOUT, backend_task)
        .await
        .expect("backend was not closed after client close")
        .unwrap();
    assert_eq!(received, b"hi");

    relay.stop().await;
}

#[tokio::test]
async fn test_dial_failure_keeps_listener_alive() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = unused.local_addr().unwrap();
    drop(unused);

    let relay = start_relay(&backend_addr.to_string(), None, None).await;

    for attempt in 0..2 {
        let mut client = TcpStream::connect(relay.addr).await.unwrap();
        let received = tokio::time::timeout(TEST_TIMEOUT, read_to_close(&mut client))
            .await
            .expect("client was not closed after dial failure");
        println!("Client: attempt {} closed", attempt);
        assert!(received.is_empty());
    }

    relay.stop().await;
}

/// Acceptor that fails a fixed number of times before accepting.
struct FlakyAcceptor {
    inner: TcpListener,
    failures: usize,
}

impl Acceptor for FlakyAcceptor {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(io::Error::other("too many open files"));
        }
        self.inner.accept().await
    }
}

#[tokio::test]
async fn test_accept_continues_after_failure() {
    let backend_addr = start_echo_backend().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = FlakyAcceptor {
        inner: listener,
        failures: 2,
    };
    let config = relay_config(&backend_addr.to_string(), None, None);
    let relay = start_relay_with(acceptor, addr, config).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    tokio::time::timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .expect("relay stopped accepting")
        .unwrap();
    assert_eq!(&buf, b"still here");

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    let backend_addr = start_echo_backend().await;
    let relay = start_relay(&backend_addr.to_string(), None, None).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    relay.stop().await;

    let received = tokio::time::timeout(TEST_TIMEOUT, read_to_close(&mut client))
        .await
        .expect("client was not closed on shutdown");
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_read_deadline_closes_idle_pair() {
    let backend_addr = start_echo_backend().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = relay_config(&backend_addr.to_string(), None, None);
    config.deadlines = Deadlines {
        read: Duration::from_millis(200),
        write: Duration::from_secs(1),
    };
    let relay = start_relay_with(listener, addr, config).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    let received = tokio::time::timeout(TEST_TIMEOUT, read_to_close(&mut client))
        .await
        .expect("idle pair was not closed");
    assert!(received.is_empty());

    relay.stop().await;
}

#[test]
fn test_transport_error_timeout_detection() {
    let err = TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"));
    assert!(err.is_timeout());
}
