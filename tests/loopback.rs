use async_io::Async;
use rtftp::tftp::{Direction, Request};
use rtftp::transport::{StreamTransport, Transport};
use rtftp::{
    Client, ClientError, ErrorCode, Framing, Packet, Server, ServerConfig, ServerHandle, TransferConfig,
    TransferError,
};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tempdir::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn transfer_config() -> TransferConfig {
    TransferConfig { timeout: Duration::from_millis(500), max_retries: 3, ..TransferConfig::default() }
}

async fn start(dir: &TempDir, framing: Framing) -> ServerHandle {
    let config = ServerConfig {
        bind: (Ipv4Addr::LOCALHOST, 0).into(),
        base_dir: dir.path().to_path_buf(),
        framing,
        transfer: transfer_config(),
        ..ServerConfig::default()
    };
    Server::bind(config).await.unwrap().spawn().unwrap()
}

fn client(handle: &ServerHandle, framing: Framing) -> Client {
    Client::new(handle.local_addr(), framing, transfer_config())
}

fn udp_socket() -> Async<UdpSocket> {
    Async::<UdpSocket>::bind((Ipv4Addr::LOCALHOST, 0)).unwrap()
}

async fn recv_packet(sock: &Async<UdpSocket>) -> (Packet, SocketAddr) {
    let mut buf = vec![0_u8; 1024];
    let (len, src) = timeout(WAIT, sock.recv_from(&mut buf)).await.unwrap().unwrap();
    (Packet::parse_from_buf(&buf[..len]).unwrap(), src)
}

fn request(direction: Direction, filename: &str) -> Packet {
    Packet::Request(Request::new(direction, filename, "octet").unwrap())
}

#[tokio::test]
async fn test_udp_read_1000_bytes() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    let contents: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    fs::write(server_dir.path().join("thousand.bin"), &contents).unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let local = client_dir.path().join("thousand.bin");
    let summary = client(&handle, Framing::Datagram).get("thousand.bin", &local).await.unwrap();

    assert_eq!(summary.bytes, 1000);
    assert_eq!(summary.blocks, 2);
    assert_eq!(fs::read(&local).unwrap(), contents);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_write_empty_file() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    let local = client_dir.path().join("empty.txt");
    fs::write(&local, b"").unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let summary = client(&handle, Framing::Datagram).put(&local, "empty.txt").await.unwrap();

    assert_eq!(summary.bytes, 0);
    assert_eq!(summary.blocks, 1);
    assert_eq!(fs::read(server_dir.path().join("empty.txt")).unwrap(), b"");
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_data_blocks_arrive_in_order() {
    let server_dir = TempDir::new("server").unwrap();
    fs::write(server_dir.path().join("exact.bin"), vec![5_u8; 1024]).unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let sock = udp_socket();
    sock.send_to(&request(Direction::Read, "exact.bin").to_bytes(), handle.local_addr()).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let (packet, src) = recv_packet(&sock).await;
        assert_ne!(src, handle.local_addr(), "data must come from a session port");
        match packet {
            Packet::Data { block, data } => {
                sock.send_to(&Packet::Ack { block }.to_bytes(), src).await.unwrap();
                seen.push((block, data.len()));
                if data.len() < 512 {
                    break;
                }
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    assert_eq!(seen, vec![(1, 512), (2, 512), (3, 0)]);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_write_existing_file_is_refused() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    fs::write(server_dir.path().join("taken.txt"), b"keep me").unwrap();
    let local = client_dir.path().join("taken.txt");
    fs::write(&local, b"replacement").unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let result = client(&handle, Framing::Datagram).put(&local, "taken.txt").await;

    assert!(matches!(
        result,
        Err(ClientError::Transfer(TransferError::PeerError { code: ErrorCode::FileExists, .. }))
    ));
    assert_eq!(fs::read(server_dir.path().join("taken.txt")).unwrap(), b"keep me");
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_netascii_is_refused() {
    let server_dir = TempDir::new("server").unwrap();
    fs::write(server_dir.path().join("notes.txt"), b"text").unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let sock = udp_socket();
    let rrq = Packet::Request(Request::new(Direction::Read, "notes.txt", "netascii").unwrap());
    sock.send_to(&rrq.to_bytes(), handle.local_addr()).await.unwrap();

    let (packet, src) = recv_packet(&sock).await;
    assert!(matches!(packet, Packet::Error { code: ErrorCode::IllegalOperation, .. }));
    assert_eq!(src, handle.local_addr());
    assert!(handle.active_sessions().is_empty());
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_missing_file_and_escape_attempts() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;
    let client = client(&handle, Framing::Datagram);

    let local = client_dir.path().join("missing.bin");
    let result = client.get("missing.bin", &local).await;
    assert!(matches!(
        result,
        Err(ClientError::Transfer(TransferError::PeerError { code: ErrorCode::FileNotFound, .. }))
    ));
    assert!(!local.exists());

    let result = client.get("../outside.bin", &client_dir.path().join("outside.bin")).await;
    assert!(matches!(
        result,
        Err(ClientError::Transfer(TransferError::PeerError { code: ErrorCode::AccessViolation, .. }))
    ));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_failed_get_keeps_existing_local_file() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    let local = client_dir.path().join("important.txt");
    fs::write(&local, b"precious").unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let result = client(&handle, Framing::Datagram).get("missing.txt", &local).await;

    assert!(matches!(
        result,
        Err(ClientError::Transfer(TransferError::PeerError { code: ErrorCode::FileNotFound, .. }))
    ));
    assert_eq!(fs::read(&local).unwrap(), b"precious");
    assert_eq!(fs::read_dir(client_dir.path()).unwrap().count(), 1);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_repeated_write_request_is_served_once() {
    let server_dir = TempDir::new("server").unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let sock = udp_socket();
    let wrq = request(Direction::Write, "twice.txt").to_bytes();
    sock.send_to(&wrq, handle.local_addr()).await.unwrap();
    sock.send_to(&wrq, handle.local_addr()).await.unwrap();

    let (packet, session) = recv_packet(&sock).await;
    assert_eq!(packet, Packet::Ack { block: 0 });
    sock.send_to(&Packet::Data { block: 1, data: b"hello".to_vec() }.to_bytes(), session).await.unwrap();

    loop {
        let (packet, src) = recv_packet(&sock).await;
        assert_eq!(src, session, "only one session may answer");
        match packet {
            Packet::Ack { block: 0 } => continue,
            Packet::Ack { block: 1 } => break,
            other => panic!("unexpected packet {other:?}"),
        }
    }

    let mut buf = [0_u8; 1024];
    assert!(timeout(Duration::from_millis(300), sock.recv_from(&mut buf)).await.is_err());
    assert_eq!(fs::read(server_dir.path().join("twice.txt")).unwrap(), b"hello");
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_concurrent_sessions() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    fs::write(server_dir.path().join("a.bin"), vec![1_u8; 3000]).unwrap();
    fs::write(server_dir.path().join("b.bin"), vec![2_u8; 5000]).unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;
    let client = client(&handle, Framing::Datagram);

    let local_a = client_dir.path().join("a.bin");
    let local_b = client_dir.path().join("b.bin");
    let (a, b) = tokio::join!(client.get("a.bin", &local_a), client.get("b.bin", &local_b));

    assert_eq!(a.unwrap().bytes, 3000);
    assert_eq!(b.unwrap().bytes, 5000);
    assert_eq!(fs::read(&local_b).unwrap(), vec![2_u8; 5000]);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_stalled_read() {
    let server_dir = TempDir::new("server").unwrap();
    fs::write(server_dir.path().join("big.bin"), vec![0_u8; 4096]).unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let sock = udp_socket();
    sock.send_to(&request(Direction::Read, "big.bin").to_bytes(), handle.local_addr()).await.unwrap();
    let (packet, _) = recv_packet(&sock).await;
    assert!(matches!(packet, Packet::Data { block: 1, .. }));

    let active = handle.active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].filename, "big.bin");
    assert_eq!(active[0].peer, sock.get_ref().local_addr().unwrap());

    timeout(Duration::from_secs(1), handle.stop()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_removes_partial_upload() {
    let server_dir = TempDir::new("server").unwrap();
    let handle = start(&server_dir, Framing::Datagram).await;

    let sock = udp_socket();
    sock.send_to(&request(Direction::Write, "half.bin").to_bytes(), handle.local_addr()).await.unwrap();
    let (packet, session) = recv_packet(&sock).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    sock.send_to(&Packet::Data { block: 1, data: vec![8; 512] }.to_bytes(), session).await.unwrap();
    let (packet, _) = recv_packet(&sock).await;
    assert_eq!(packet, Packet::Ack { block: 1 });
    assert!(server_dir.path().join("half.bin").exists());

    timeout(Duration::from_secs(1), handle.stop()).await.unwrap().unwrap();
    assert!(!server_dir.path().join("half.bin").exists());
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let server_dir = TempDir::new("server").unwrap();
    let client_dir = TempDir::new("client").unwrap();
    let contents: Vec<u8> = (0..1024).map(|i| (i % 7) as u8).collect();
    let local = client_dir.path().join("upload.bin");
    fs::write(&local, &contents).unwrap();
    let handle = start(&server_dir, Framing::Stream).await;
    let client = client(&handle, Framing::Stream);

    let sent = client.put(&local, "stored.bin").await.unwrap();
    assert_eq!(sent.blocks, 3);

    let fetched = client_dir.path().join("fetched.bin");
    let received = client.get("stored.bin", &fetched).await.unwrap();
    assert_eq!(received.bytes, 1024);
    assert_eq!(received.blocks, 3);
    assert_eq!(fs::read(&fetched).unwrap(), contents);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_connection_serves_requests_in_sequence() {
    let server_dir = TempDir::new("server").unwrap();
    fs::write(server_dir.path().join("one.txt"), b"first").unwrap();
    fs::write(server_dir.path().join("two.txt"), b"second").unwrap();
    let handle = start(&server_dir, Framing::Stream).await;

    let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut conn = StreamTransport::new(stream);

    conn.send(&request(Direction::Read, "one.txt")).await.unwrap();
    assert_eq!(conn.recv_with_timeout(WAIT).await.unwrap(), Packet::Data { block: 1, data: b"first".to_vec() });
    conn.send(&Packet::Ack { block: 1 }).await.unwrap();

    conn.send(&request(Direction::Read, "nothing.txt")).await.unwrap();
    assert!(matches!(
        conn.recv_with_timeout(WAIT).await.unwrap(),
        Packet::Error { code: ErrorCode::FileNotFound, .. }
    ));

    conn.send(&request(Direction::Read, "two.txt")).await.unwrap();
    assert_eq!(conn.recv_with_timeout(WAIT).await.unwrap(), Packet::Data { block: 1, data: b"second".to_vec() });
    conn.send(&Packet::Ack { block: 1 }).await.unwrap();

    drop(conn);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_stalled_tcp_read() {
    let server_dir = TempDir::new("server").unwrap();
    fs::write(server_dir.path().join("big.bin"), vec![0_u8; 4096]).unwrap();
    let handle = start(&server_dir, Framing::Stream).await;

    let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut conn = StreamTransport::new(stream);
    conn.send(&request(Direction::Read, "big.bin")).await.unwrap();
    assert!(matches!(conn.recv_with_timeout(WAIT).await.unwrap(), Packet::Data { block: 1, .. }));

    let active = handle.active_sessions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].filename, "big.bin");

    timeout(Duration::from_secs(1), handle.stop()).await.unwrap().unwrap();

    loop {
        match conn.recv_with_timeout(WAIT).await {
            Ok(Packet::Error { .. }) => continue,
            Ok(other) => panic!("unexpected packet {other:?} after stop"),
            Err(e) => {
                assert!(matches!(e, TransferError::Disconnected | TransferError::Io(_)), "unexpected error {e}");
                break;
            }
        }
    }
}
