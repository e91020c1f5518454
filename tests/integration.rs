//! Integration tests for lanbench

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

use lanbench::client::{Client, ClientConfig};
use lanbench::protocol::{Codec, Protocol, ProtocolConfig};
use lanbench::serve::{Server, ServerConfig};
use lanbench::{tcp, udp};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// Use different ports for each test to avoid conflicts
static DISCOVERY_COUNTER: AtomicU16 = AtomicU16::new(45000);
static RANGE_COUNTER: AtomicU16 = AtomicU16::new(46000);

fn get_discovery_port() -> u16 {
    DISCOVERY_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn get_port_range() -> std::ops::RangeInclusive<u16> {
    let start = RANGE_COUNTER.fetch_add(100, Ordering::SeqCst);
    start..=start + 99
}

fn protocol_on(discovery_port: u16) -> ProtocolConfig {
    ProtocolConfig {
        discovery_port,
        ..Default::default()
    }
}

/// Bind a server that announces itself on loopback and run it in the
/// background
async fn start_test_server(discovery_port: u16) -> (u16, u16, tokio::task::JoinHandle<()>) {
    let config = ServerConfig {
        protocol: protocol_on(discovery_port),
        broadcast_addr: LOCALHOST,
        broadcast_interval: Duration::from_millis(100),
        port_range: get_port_range(),
        ..Default::default()
    };

    let server = Server::bind(config).await.unwrap();
    let ports = (server.tcp_port(), server.udp_port());
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });
    (ports.0, ports.1, handle)
}

#[tokio::test]
async fn test_full_round_over_loopback() {
    let discovery_port = get_discovery_port();
    let (tcp_port, udp_port, server) = start_test_server(discovery_port).await;

    let client = Client::new(ClientConfig {
        protocol: protocol_on(discovery_port),
        file_size: 100_000,
        tcp_connections: 3,
        udp_connections: 2,
        udp_idle_timeout: Duration::from_millis(500),
        rounds: Some(1),
    });

    let (tx, mut rx) = mpsc::channel(4);
    let result = timeout(Duration::from_secs(20), client.run(tx)).await;
    assert!(result.is_ok(), "Round should complete");
    assert!(result.unwrap().is_ok());

    let report = rx.recv().await.expect("one round report");
    assert!(rx.recv().await.is_none(), "Only one round was requested");

    assert_eq!(report.round, 1);
    assert_eq!(report.server, LOCALHOST);
    assert_eq!(report.tcp_port, tcp_port);
    assert_eq!(report.udp_port, udp_port);
    assert_eq!(report.transfers.len(), 5);

    let tcp: Vec<_> = report.by_protocol(Protocol::Tcp).collect();
    assert_eq!(tcp.len(), 3);
    for transfer in tcp {
        assert_eq!(transfer.bytes_received, 100_000);
        assert!(transfer.error.is_none());
        assert!(transfer.segments.is_none());
    }

    let udp: Vec<_> = report.by_protocol(Protocol::Udp).collect();
    assert_eq!(udp.len(), 2);
    for transfer in udp {
        let segments = transfer.segments.expect("UDP reports carry segment counts");
        assert_eq!(segments.total, 98);
        assert!(segments.received > 0);
        assert!(segments.received <= segments.total);
        assert!(transfer.bytes_received <= 100_000);
    }

    let mut indices: Vec<_> = report.transfers.iter().map(|t| (t.protocol, t.index)).collect();
    indices.sort_by_key(|(p, i)| (p.to_string(), *i));
    assert_eq!(
        indices,
        vec![
            (Protocol::Tcp, 1),
            (Protocol::Tcp, 2),
            (Protocol::Tcp, 3),
            (Protocol::Udp, 1),
            (Protocol::Udp, 2),
        ]
    );

    server.abort();
}

#[tokio::test]
async fn test_discovery_skips_bad_datagrams() {
    let discovery_port = get_discovery_port();
    let client = Client::new(ClientConfig {
        protocol: protocol_on(discovery_port),
        ..Default::default()
    });
    let discover = tokio::spawn(async move { client.discover().await });

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = SocketAddr::new(LOCALHOST, discovery_port);
    let codec = Codec::default();
    let wrong_type = codec.encode_request(1);
    let wrong_magic = Codec::new(0x0102_0304).encode_offer(7, 7);
    let good = codec.encode_offer(5000, 5001);

    // The listener may not be bound yet, so keep sending until it answers
    let offer = timeout(Duration::from_secs(10), async {
        loop {
            sender.send_to(&wrong_type, target).await.unwrap();
            sender.send_to(&wrong_magic, target).await.unwrap();
            sender.send_to(b"hello", target).await.unwrap();
            sender.send_to(&good, target).await.unwrap();
            if discover.is_finished() {
                return discover.await.unwrap().unwrap();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("discovery should finish");

    assert_eq!(offer.ip, LOCALHOST);
    assert_eq!(offer.udp_port, 5000);
    assert_eq!(offer.tcp_port, 5001);
}

#[tokio::test]
async fn test_parallel_tcp_transfers() {
    let (tcp_port, _, server) = start_test_server(get_discovery_port()).await;
    let addr = SocketAddr::new(LOCALHOST, tcp_port);
    let chunk = ProtocolConfig::default().tcp_chunk_size();

    let sizes = [1u64, 8192, 8193, 1_000_000];
    let handles: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| tokio::spawn(tcp::measure(addr, size, i as u32 + 1, chunk)))
        .collect();

    for (handle, size) in handles.into_iter().zip(sizes) {
        let report = timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.bytes_received, size);
        assert!(report.is_complete());
    }

    server.abort();
}

#[tokio::test]
async fn test_tcp_garbage_size_line_gets_nothing() {
    let (tcp_port, _, server) = start_test_server(get_discovery_port()).await;

    let mut stream = TcpStream::connect(SocketAddr::new(LOCALHOST, tcp_port))
        .await
        .unwrap();
    stream.write_all(b"lots\n").await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(received.is_empty());

    server.abort();
}

#[tokio::test]
async fn test_udp_server_ignores_garbage() {
    let (_, udp_port, server) = start_test_server(get_discovery_port()).await;
    let addr = SocketAddr::new(LOCALHOST, udp_port);

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"junk", addr).await.unwrap();
    sender
        .send_to(&Codec::default().encode_offer(1, 2), addr)
        .await
        .unwrap();

    // Nothing comes back for garbage
    let mut buf = [0u8; 64];
    let reply = timeout(Duration::from_millis(300), sender.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "Server must not answer garbage");

    // And the server is still serving afterwards
    let report = udp::measure(
        addr,
        5000,
        1,
        &ProtocolConfig::default(),
        Duration::from_millis(500),
    )
    .await;
    let segments = report.segments.unwrap();
    assert_eq!(segments.total, 5);
    assert!(segments.received > 0);
    assert!(report.error.is_none());

    server.abort();
}

#[tokio::test]
async fn test_client_stops_when_receiver_dropped() {
    let discovery_port = get_discovery_port();
    let (_, _, server) = start_test_server(discovery_port).await;

    let client = Client::new(ClientConfig {
        protocol: protocol_on(discovery_port),
        file_size: 10_000,
        tcp_connections: 1,
        udp_connections: 0,
        rounds: None,
        ..Default::default()
    });

    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let result = timeout(Duration::from_secs(10), client.run(tx)).await;
    assert!(result.is_ok(), "Client should stop once nobody listens");
    assert!(result.unwrap().is_ok());

    server.abort();
}
