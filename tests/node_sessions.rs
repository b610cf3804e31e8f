//! Integration tests for encrypted sessions between real nodes.
//!
//! Two nodes on loopback: handshake to steady state, multiplexed
//! channels, reliable streams over them, and teardown propagation.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::{timeout, Instant};

use veilmesh::{Error, Node, NodeConfig, ReliableStream, DEAD_PEER_TIMEOUT};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

async fn spawn_node() -> Node {
    let config = NodeConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..NodeConfig::default()
    };
    Node::bind(config).await.expect("bind failed")
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_reaches_steady_state_within_timeout() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    timeout(TEST_TIMEOUT, a.connect_to(b.local_addr(), None))
        .await
        .expect("handshake within timeout")
        .expect("connect succeeds");

    // The session is symmetric: b can immediately answer route
    // questions from a over it.
    let hosts = timeout(TEST_TIMEOUT, a.remote_nodes_near(b.local_addr(), a.id(), 20, None))
        .await
        .expect("reply within timeout")
        .expect("route lookup answered");
    assert!(hosts.iter().any(|h| h.id == a.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_data_flows_to_a_registered_service() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let mut incoming = b.start_service(5, "echo").await.expect("service registers");

    a.connect_to(b.local_addr(), None).await.expect("connect");
    let channel = a.open_channel(b.id(), 5).await.expect("open channel");
    channel
        .send(Bytes::from_static(b"over the session"))
        .await
        .expect("send");

    let server_channel = timeout(TEST_TIMEOUT, incoming.recv())
        .await
        .expect("channel materializes")
        .expect("service receiver open");
    assert_eq!(server_channel.peer_id(), a.id());

    let delivered = timeout(TEST_TIMEOUT, server_channel.recv())
        .await
        .expect("delivery")
        .expect("data");
    assert_eq!(delivered, Bytes::from_static(b"over the session"));

    // Replies flow the other way on the same channel.
    server_channel
        .send(Bytes::from_static(b"echoed"))
        .await
        .expect("reply");
    let reply = timeout(TEST_TIMEOUT, channel.recv())
        .await
        .expect("reply delivery")
        .expect("reply data");
    assert_eq!(reply, Bytes::from_static(b"echoed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_service_closes_the_channel() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    a.connect_to(b.local_addr(), None).await.expect("connect");
    let channel = a.open_channel(b.id(), 42).await.expect("open channel");
    channel.send(Bytes::from_static(b"anyone?")).await.expect("send");

    // B has no service 42; it answers with a channel close.
    let result = timeout(TEST_TIMEOUT, channel.recv()).await.expect("close arrives");
    assert!(matches!(result, Err(Error::ChannelClosed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn reliable_stream_carries_bulk_data_between_nodes() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let mut incoming = b.start_service(7, "bulk").await.expect("service registers");

    a.connect_to(b.local_addr(), None).await.expect("connect");
    let channel = a.open_channel(b.id(), 7).await.expect("open channel");
    let writer = ReliableStream::new(channel);

    let payload: Vec<u8> = (0..50_000usize).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();
    let write = tokio::spawn(async move { writer.write(&payload).await });

    let server_channel = timeout(TEST_TIMEOUT, incoming.recv())
        .await
        .expect("channel materializes")
        .expect("service receiver open");
    let reader = ReliableStream::new(server_channel);

    let mut received = Vec::with_capacity(expected.len());
    let mut buf = vec![0u8; 8192];
    let deadline = Instant::now() + TEST_TIMEOUT;
    while received.len() < expected.len() {
        assert!(Instant::now() < deadline, "transfer stalled");
        let n = timeout(TEST_TIMEOUT, reader.read(&mut buf))
            .await
            .expect("read progresses")
            .expect("read succeeds");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, expected);
    assert_eq!(write.await.unwrap().unwrap(), expected.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_shutdown_unblocks_reader_within_dead_peer_window() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let mut incoming = b.start_service(9, "watch").await.expect("service registers");

    a.connect_to(b.local_addr(), None).await.expect("connect");
    let channel = a.open_channel(b.id(), 9).await.expect("open channel");
    let writer = ReliableStream::new(channel);
    writer.write(b"one burst").await.expect("write");

    let server_channel = timeout(TEST_TIMEOUT, incoming.recv())
        .await
        .expect("channel materializes")
        .expect("service receiver open");
    let reader = ReliableStream::new(server_channel);
    let mut buf = vec![0u8; 64];
    let n = timeout(TEST_TIMEOUT, reader.read(&mut buf))
        .await
        .expect("initial read")
        .expect("data");
    assert_eq!(&buf[..n], b"one burst");

    // A goes away; B's next read must fail within the dead-peer window.
    let start = Instant::now();
    a.shutdown().await;
    let result = timeout(DEAD_PEER_TIMEOUT + Duration::from_secs(2), reader.read(&mut buf))
        .await
        .expect("reader unblocks");
    assert!(matches!(result, Err(Error::ChannelClosed)));
    assert!(start.elapsed() <= DEAD_PEER_TIMEOUT + Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn service_registry_rejects_duplicates_and_releases_numbers() {
    let node = spawn_node().await;
    let _rx = node.start_service(3, "first").await.expect("registers");
    assert!(matches!(
        node.start_service(3, "second").await,
        Err(Error::ServiceInUse(3))
    ));
    assert!(node.close_service(3).await.expect("close runs"));
    assert!(!node.close_service(3).await.expect("close runs"));
    let _rx = node.start_service(3, "third").await.expect("number is free again");
}
