//! End-to-end transfer tests: segmentation, teardown and behaviour over a
//! faulty channel.
//!
//! Faults are injected with [`LossyDatagram`] on the outbound side of one or
//! both endpoints; the fault sequence is seeded so every run is repeatable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use rudp::simulator::FaultCounters;
use rudp::{
    Config, ConnError, Connection, ConnectionState, FaultConfig, LossyDatagram, MessageStatus,
    Socket,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type LossyConnection = Connection<LossyDatagram<UdpSocket>>;

fn config() -> Config {
    Config::default()
        .with_rto(Duration::from_millis(50))
        .with_idle_timeout(Duration::from_secs(5))
        .with_teardown_grace(Duration::from_millis(150))
}

async fn lossy(faults: FaultConfig, config: Config) -> (LossyConnection, Arc<FaultCounters>) {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let channel = LossyDatagram::new(udp, faults);
    let counters = channel.counters();
    let conn = Connection::with_socket(Socket::new(channel).unwrap(), config).unwrap();
    (conn, counters)
}

/// Accept in the background and hand the established connection back.
fn spawn_accept(
    mut server: LossyConnection,
) -> tokio::task::JoinHandle<Result<LossyConnection, ConnError>> {
    tokio::spawn(async move {
        server.accept().await?;
        Ok(server)
    })
}

async fn establish(
    client: &mut LossyConnection,
    server: LossyConnection,
) -> LossyConnection {
    let addr: SocketAddr = server.local_addr();
    let task = spawn_accept(server);
    client.connect(addr).await.expect("connect");
    task.await.expect("accept task").expect("accept")
}

fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A 20000-byte message at the default segment size arrives as three
/// fragments, then both sides tear down to `Closed`.
#[tokio::test]
async fn message_is_segmented_and_connection_closes() {
    let (mut client, _) = lossy(FaultConfig::default(), config()).await;
    let (server, _) = lossy(FaultConfig::default(), config()).await;
    let server = establish(&mut client, server).await;

    let receiver = tokio::spawn(async move {
        let mut server = server;
        let mut buf = vec![0u8; server.config().mss];
        let mut fragments = Vec::new();
        let mut data = Vec::new();
        loop {
            let (n, status) = server.recv(&mut buf).await?;
            fragments.push((n, status));
            data.extend_from_slice(&buf[..n]);
            if status == MessageStatus::PeerDisconnected {
                break;
            }
        }
        assert_eq!(server.state(), ConnectionState::Closing);
        server.disconnect().await?;
        Ok::<_, ConnError>((server, fragments, data))
    });

    let message = pattern(20_000, 7);
    assert_eq!(client.send(&message).await.unwrap(), 20_000);
    // Numbering restarts once the final fragment is acknowledged.
    assert_eq!(client.next_send_seq(), 0);
    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    let (server, fragments, data) = receiver.await.unwrap().unwrap();
    assert_eq!(
        fragments,
        vec![
            (8192, MessageStatus::Continuation),
            (8192, MessageStatus::Continuation),
            (3616, MessageStatus::MessageComplete),
            (0, MessageStatus::PeerDisconnected),
        ]
    );
    assert_eq!(data, message);
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(server.stats().bytes_received, 20_000);
    assert_eq!(server.stats().messages_received, 1);
    assert_eq!(client.stats().messages_sent, 1);

    // A second disconnect has nothing left to do.
    assert!(matches!(
        client.disconnect().await,
        Err(ConnError::AlreadyDisconnected)
    ));
    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn empty_message_completes_immediately() {
    let (mut client, _) = lossy(FaultConfig::default(), config()).await;
    let (server, _) = lossy(FaultConfig::default(), config()).await;
    let mut server = establish(&mut client, server).await;

    let receiver = tokio::spawn(async move {
        let mut buf = vec![0u8; server.config().mss];
        let got = server.recv(&mut buf).await;
        (server, got)
    });
    assert_eq!(client.send(b"").await.unwrap(), 0);

    let (server, got) = receiver.await.unwrap();
    assert_eq!(got.unwrap(), (0, MessageStatus::MessageComplete));
    assert_eq!(server.next_expected_seq(), 0);
}

/// Dropping every third datagram still delivers the whole stream in order.
#[tokio::test]
async fn stream_survives_periodic_loss() {
    let cfg = config().with_mss(1024);
    let (mut client, counters) = lossy(FaultConfig::drop_every(3), cfg.clone()).await;
    let (server, _) = lossy(FaultConfig::default(), cfg).await;
    let mut server = establish(&mut client, server).await;

    let messages: Vec<Vec<u8>> = (0..3).map(|i| pattern(10_000 + i * 333, i as u8)).collect();

    let receiver = tokio::spawn(async move {
        let mut got = Vec::new();
        while let Some(message) = server.recv_message().await? {
            got.push(message);
        }
        server.close().await?;
        Ok::<_, ConnError>(got)
    });

    for message in &messages {
        client.send(message).await.unwrap();
    }
    client.close().await.unwrap();

    let got = receiver.await.unwrap().unwrap();
    assert_eq!(got, messages);
    assert!(counters.dropped() > 0);
}

/// An acceptor that stops answering makes `send` give up after the ceiling.
#[tokio::test]
async fn send_gives_up_after_retry_ceiling() {
    let cfg = config().with_max_retries(3);
    let (mut client, counters) = lossy(FaultConfig::default(), cfg.clone()).await;
    let (server, _) = lossy(FaultConfig::default(), cfg).await;
    // Established, but nobody will ever call recv.
    let _server = establish(&mut client, server).await;
    let before = counters.attempted();
    let retx_before = client.stats().retransmissions;

    let err = client.send(b"into the void").await.unwrap_err();
    assert!(
        matches!(err, ConnError::MaxRetriesExceeded { seq: 0, retries: 3 }),
        "unexpected error: {err}"
    );
    assert_eq!(counters.attempted() - before, 4);
    assert_eq!(client.stats().retransmissions - retx_before, 3);
    assert_eq!(client.next_send_seq(), 0);
}

/// Random loss, duplication and corruption on the initiator plus periodic
/// ACK loss on the acceptor.
#[tokio::test]
async fn seeded_random_faults_preserve_messages() {
    let cfg = config()
        .with_rto(Duration::from_millis(30))
        .with_max_retries(12)
        .with_mss(1000);
    let client_faults = FaultConfig {
        loss_rate: 0.1,
        duplicate_rate: 0.05,
        corrupt_rate: 0.05,
        seed: 0x5eed,
        ..FaultConfig::default()
    };
    // The acceptor's first send is its SYN+ACK, which this schedule never drops.
    let server_faults = FaultConfig {
        drop_every: Some(4),
        duplicate_rate: 0.1,
        seed: 99,
        ..FaultConfig::default()
    };
    let (mut client, _) = lossy(client_faults, cfg.clone()).await;
    let (server, server_counters) = lossy(server_faults, cfg).await;
    let mut server = establish(&mut client, server).await;

    let messages: Vec<Vec<u8>> = (0..5).map(|i| pattern(4000, i)).collect();

    let receiver = tokio::spawn(async move {
        let mut got = Vec::new();
        while let Some(message) = server.recv_message().await? {
            got.push(message);
        }
        server.disconnect().await?;
        Ok::<_, ConnError>((server, got))
    });

    for message in &messages {
        client.send(message).await.unwrap();
    }
    client.disconnect().await.unwrap();

    let (server, got) = receiver.await.unwrap().unwrap();
    assert_eq!(got, messages);
    assert!(server_counters.dropped() > 0);
    assert!(client.stats().retransmissions > 0);
    assert!(server.stats().duplicates > 0);
    assert_eq!(server.state(), ConnectionState::Closed);
}
