//! End-to-end tests driving two full services against each other over
//! loopback. Everything binds port 0, so the tests are safe to run in
//! parallel with the rest of the suite.

use bytes::Bytes;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use xdag_p2p::{MessageHandler, NetConfig, NetworkService, Node, NodeId, SessionHandle};

fn test_config(data_dir: &std::path::Path) -> NetConfig {
    NetConfig {
        port: 0,
        network_id: 3,
        min_connections: 0,
        max_connections: 8,
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    }
}

async fn start_service(config: NetConfig) -> NetworkService {
    let mut service = NetworkService::new(config).expect("config should be valid");
    service.start().await.expect("service should start");
    service
}

async fn peer_count(service: &NetworkService) -> usize {
    service.node_info().await.expect("service is running").peer_count
}

/// Polls the pair's session counts until both match, or panics.
async fn wait_for_peer_counts(
    a: &NetworkService,
    b: &NetworkService,
    expected: (usize, usize),
    timeout: Duration,
    what: &str,
) {
    let deadline = Instant::now() + timeout;
    loop {
        if (peer_count(a).await, peer_count(b).await) == expected {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for<F: FnMut() -> bool>(mut probe: F, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[derive(Default)]
struct RecordingHandler {
    messages: Mutex<Vec<(NodeId, u8, Bytes)>>,
    connects: Mutex<Vec<NodeId>>,
    disconnects: Mutex<Vec<NodeId>>,
}

impl RecordingHandler {
    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn disconnect_count(&self) -> usize {
        self.disconnects.lock().unwrap().len()
    }
}

impl MessageHandler for RecordingHandler {
    fn on_connect(&self, peer: &SessionHandle) {
        self.connects.lock().unwrap().push(peer.node_id());
    }

    fn on_disconnect(
        &self,
        node_id: NodeId,
        _addr: std::net::SocketAddr,
        _reason: xdag_p2p::DisconnectCode,
    ) {
        self.disconnects.lock().unwrap().push(node_id);
    }

    fn on_message(&self, peer: &SessionHandle, code: u8, payload: Bytes) {
        self.messages
            .lock()
            .unwrap()
            .push((peer.node_id(), code, payload));
    }
}

#[tokio::test]
async fn explicit_connect_establishes_one_session_each_side() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut a = start_service(test_config(dir_a.path())).await;
    let mut b = start_service(test_config(dir_b.path())).await;
    let a_node = a.local_node().unwrap();

    b.connect(a_node).await.unwrap();
    wait_for_peer_counts(&a, &b, (1, 1), Duration::from_secs(10), "both sessions").await;

    let b_peers = b.peers().await.unwrap();
    assert_eq!(b_peers[0].node_id(), a.node_id());

    // A second explicit dial to the same peer is refused up front.
    assert!(b.connect(a_node).await.is_err());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn application_messages_reach_the_registered_handler() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let handler = Arc::new(RecordingHandler::default());

    let mut a = start_service(test_config(dir_a.path())).await;
    let mut b = NetworkService::new(test_config(dir_b.path())).unwrap();
    b.register_handler(&[0x42], handler.clone()).unwrap();
    b.start().await.unwrap();

    let a_node = a.local_node().unwrap();
    b.connect(a_node).await.unwrap();
    wait_for_peer_counts(&a, &b, (1, 1), Duration::from_secs(10), "session").await;
    assert_eq!(handler.connects.lock().unwrap().as_slice(), &[a.node_id()]);

    let payload = Bytes::from_static(b"field update");
    a.send_message(b.node_id(), 0x42, payload.clone())
        .await
        .unwrap();

    wait_for(
        || handler.message_count() > 0,
        Duration::from_secs(5),
        "message delivery",
    )
    .await;
    {
        let messages = handler.messages.lock().unwrap();
        assert_eq!(messages[0], (a.node_id(), 0x42, payload));
    }

    a.stop().await;
    wait_for(
        || handler.disconnect_count() > 0,
        Duration::from_secs(5),
        "disconnect notification",
    )
    .await;

    b.stop().await;
}

#[tokio::test]
async fn banned_ips_cannot_connect() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut a = start_service(test_config(dir_a.path())).await;
    let mut b = start_service(test_config(dir_b.path())).await;

    a.ban_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    assert_eq!(a.ban_stats().unwrap().active_bans, 1);

    b.connect(a.local_node().unwrap()).await.unwrap();

    // The TCP connect may succeed, but A drops the stream before the
    // handshake and never registers a session.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(peer_count(&a).await, 0);
    assert_eq!(peer_count(&b).await, 0);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn reputation_survives_a_service_restart() {
    let dir = tempfile::tempdir().unwrap();

    let mut service = start_service(test_config(dir.path())).await;
    let reputation = service.reputation().unwrap();
    let ids: Vec<NodeId> = (0..42).map(|_| NodeId::random()).collect();
    for (i, id) in ids.iter().enumerate() {
        reputation.set(*id, 60 + i as i32);
    }
    service.stop().await;

    let mut restarted = start_service(test_config(dir.path())).await;
    let reputation = restarted.reputation().unwrap();
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(reputation.get(id), 60 + i as i32);
    }
    assert_eq!(restarted.node_info().await.unwrap().reputation_entries, 42);
    restarted.stop().await;
}

#[tokio::test]
async fn seeded_service_discovers_and_connects() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut a = start_service(test_config(dir_a.path())).await;
    let a_node = a.local_node().unwrap();

    let mut config_b = test_config(dir_b.path());
    config_b.seed_nodes = vec![a_node];
    config_b.min_connections = 1;
    let mut b = start_service(config_b).await;

    // B pings its seed, both mark each other alive, B's dialer picks A up
    // from the connectable set and the handshake runs.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let a_sees_b = a
            .get_connectable_nodes()
            .await
            .unwrap()
            .iter()
            .any(|n| n.node_id == b.node_id());
        let b_sees_a = b
            .get_connectable_nodes()
            .await
            .unwrap()
            .iter()
            .any(|n| n.node_id == a.node_id());
        if a_sees_b && b_sees_a {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for discovery to bond both nodes"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    wait_for_peer_counts(
        &a,
        &b,
        (1, 1),
        Duration::from_secs(20),
        "the pool maintainer to establish a session",
    )
    .await;

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn injected_nodes_become_connectable() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = start_service(test_config(dir.path())).await;

    let external = Node::new(
        IpAddr::V4(Ipv4Addr::new(10, 11, 12, 13)),
        9999,
        9999,
        NodeId::random(),
    );
    service.inject_nodes(vec![external]).await.unwrap();

    let connectable = service.get_connectable_nodes().await.unwrap();
    assert!(connectable.iter().any(|n| n.node_id == external.node_id));

    service.stop().await;
}
