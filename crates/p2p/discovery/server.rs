use crate::{
    ban::{BanList, BanReason},
    discovery::{
        lookup::DiscoveryLookupHandler,
        messages::{
            MAX_DISC_PACKET_SIZE, Message, NeighborsMessage, Packet, PacketDecodeErr,
            PingMessage, PongMessage,
        },
    },
    kademlia::{InsertOutcome, KademliaTable, MAX_NODES_PER_BUCKET},
    reputation::{ReputationStore, is_dead_score},
    types::{Node, NodeId, NodeState},
    utils::{get_msg_expiration_from_seconds, is_msg_expired},
};
use secp256k1::SecretKey;
use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, sync::Mutex};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, trace};

/// Cadence of the liveness cycle: stale table entries are re-pinged and
/// unanswered probes are settled.
pub const DISCOVERY_CYCLE_MS: u64 = 15_000;
pub const PING_TIMEOUT_MS: u64 = 5_000;

const MSG_EXPIRATION_SECS: u64 = 20;
/// Reputation delta for an answered / unanswered ping.
const PONG_REPUTATION_REWARD: i32 = 5;
const PING_TIMEOUT_PENALTY: i32 = -5;
/// NEIGHBORS replies are split so each datagram stays under the MTU.
const NEIGHBORS_PER_DATAGRAM: usize = 4;
/// An outstanding FIND_NODE stops accepting replies after this long.
const FIND_NODE_REQUEST_TTL_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket: {0}")]
    BindSocket(std::io::Error),
    #[error("failed to send message: {0}")]
    MessageSendFailure(std::io::Error),
    #[error("only part of the message was sent")]
    PartialMessageSent,
    #[error("message expired")]
    MessageExpired,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// The UDP Kademlia discovery engine: answers the four discovery message
/// kinds, keeps the routing table alive and feeds connectable candidates to
/// the connection manager.
#[derive(Debug, Clone)]
pub struct Discovery {
    local_node: Node,
    signer: SecretKey,
    udp_socket: Arc<UdpSocket>,
    table: Arc<Mutex<KademliaTable>>,
    reputation: ReputationStore,
    bans: BanList,
    /// Candidates pushed in from outside the protocol (e.g. DNS discovery).
    injected: Arc<Mutex<Vec<Node>>>,
    /// Bucket heads pinged because a full bucket has a waiting candidate;
    /// a timeout evicts them, a pong reprieves them.
    pending_evictions: Arc<Mutex<HashSet<NodeId>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    cycle_ms: u64,
    ping_timeout_ms: u64,
}

impl Discovery {
    #[allow(clippy::too_many_arguments)]
    pub async fn try_new(
        mut local_node: Node,
        signer: SecretKey,
        table: Arc<Mutex<KademliaTable>>,
        reputation: ReputationStore,
        bans: BanList,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let bind_addr = SocketAddr::new(
            std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            local_node.udp_port,
        );
        let udp_socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(DiscoveryError::BindSocket)?;
        // Port 0 asks the OS for a free port; advertise what we got.
        if let Ok(actual) = udp_socket.local_addr() {
            local_node.udp_port = actual.port();
        }

        Ok(Self {
            local_node,
            signer,
            udp_socket: Arc::new(udp_socket),
            table,
            reputation,
            bans,
            injected: Arc::new(Mutex::new(Vec::new())),
            pending_evictions: Arc::new(Mutex::new(HashSet::new())),
            tracker,
            cancel,
            cycle_ms: DISCOVERY_CYCLE_MS,
            ping_timeout_ms: PING_TIMEOUT_MS,
        })
    }

    /// Shrinks the liveness cycle; test-only knob.
    #[allow(unused)]
    pub fn with_cycle_of(self, cycle_ms: u64, ping_timeout_ms: u64) -> Self {
        Self {
            cycle_ms,
            ping_timeout_ms,
            ..self
        }
    }

    pub fn local_node(&self) -> Node {
        self.local_node
    }

    pub async fn start(&self, bootnodes: Vec<Node>) {
        self.tracker.spawn({
            let server = self.clone();
            async move { server.receive().await }
        });
        self.tracker.spawn({
            let server = self.clone();
            async move { server.run_liveness_cycle().await }
        });

        self.load_bootnodes(bootnodes).await;

        let lookup_handler = DiscoveryLookupHandler::new(
            self.local_node,
            self.signer,
            self.udp_socket.clone(),
            self.table.clone(),
            self.cancel.clone(),
        );
        self.tracker.spawn(async move {
            lookup_handler.run_periodic_lookups().await;
        });
    }

    async fn load_bootnodes(&self, bootnodes: Vec<Node>) {
        for bootnode in bootnodes {
            if bootnode.node_id == self.local_node.node_id {
                continue;
            }
            let outcome = self.table.lock().await.insert_node(bootnode);
            if matches!(outcome, InsertOutcome::Inserted | InsertOutcome::Refreshed) {
                if let Err(e) = self.ping(&bootnode).await {
                    debug!(node = %bootnode, err = %e, "Failed to ping bootnode");
                }
            }
        }
    }

    async fn receive(&self) {
        let mut buf = vec![0; MAX_DISC_PACKET_SIZE];

        loop {
            let (read, from) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.udp_socket.recv_from(&mut buf) => match result {
                    Ok(read_and_from) => read_and_from,
                    Err(e) => {
                        error!(err = %e, "Error receiving from discovery socket, stopping");
                        return;
                    }
                },
            };

            if self.bans.is_banned(&from.ip()) {
                trace!(%from, "Dropping datagram from banned ip");
                continue;
            }

            let packet = match Packet::decode(&buf[..read]) {
                Ok(packet) => packet,
                Err(PacketDecodeErr::InvalidSignature) => {
                    debug!(%from, "Datagram failed signature check");
                    self.bans.ban(from.ip(), BanReason::MaliciousBehavior, None);
                    continue;
                }
                Err(e) => {
                    debug!(%from, err = %e, "Could not decode datagram");
                    continue;
                }
            };

            if packet.get_node_id() == self.local_node.node_id {
                // Our own traffic reflected back.
                continue;
            }

            let msg_kind = packet.get_message().to_string();
            if let Err(e) = self.handle_message(packet, from).await {
                debug!(%from, msg = %msg_kind, err = %e, "Error processing message");
            }
        }
    }

    async fn handle_message(&self, packet: Packet, from: SocketAddr) -> Result<(), DiscoveryError> {
        let message = packet.get_message().clone();
        trace!(received = %message, from = %packet.get_node_id());

        if is_msg_expired(message.expiration()) {
            return Err(DiscoveryError::MessageExpired);
        }

        match message {
            Message::Ping(msg) => {
                // Trust the claimed ports but the observed source address.
                let node = Node::new(
                    from.ip(),
                    from.port(),
                    msg.from.tcp_port,
                    packet.get_node_id(),
                );
                self.pong(&node).await?;
                self.observe(node).await
            }
            Message::Pong(_) => self.handle_pong(packet.get_node_id()).await,
            Message::FindNode(msg) => {
                self.handle_find_node(packet.get_node_id(), msg.target, from).await
            }
            Message::Neighbors(msg) => {
                self.handle_neighbors(packet.get_node_id(), msg.nodes).await
            }
        }
    }

    /// Runs an observed node through the K-bucket rules, pinging where the
    /// rules ask for a liveness proof.
    async fn observe(&self, node: Node) -> Result<(), DiscoveryError> {
        let outcome = self.table.lock().await.insert_node(node);
        match outcome {
            InsertOutcome::Inserted => {
                // Newly discovered: ping to move it toward ALIVE.
                self.ping(&node).await
            }
            InsertOutcome::BucketFull { head } => {
                let mut pending = self.pending_evictions.lock().await;
                if pending.insert(head.node_id) {
                    drop(pending);
                    debug!(head = %head, candidate = %node, "Bucket full, probing head");
                    self.ping(&head).await?;
                }
                Ok(())
            }
            InsertOutcome::Refreshed | InsertOutcome::SelfNode => Ok(()),
        }
    }

    async fn handle_pong(&self, node_id: NodeId) -> Result<(), DiscoveryError> {
        let had_pending_ping = {
            let table = self.table.lock().await;
            table
                .get_by_node_id(node_id)
                .map(|peer| peer.last_ping_sent.is_some())
                .unwrap_or(false)
        };
        if !had_pending_ping {
            return Err(DiscoveryError::InvalidMessage(
                "pong without a matching ping".into(),
            ));
        }

        self.table.lock().await.pong_received(node_id);
        self.pending_evictions.lock().await.remove(&node_id);
        self.reputation.adjust(node_id, PONG_REPUTATION_REWARD);
        Ok(())
    }

    async fn handle_find_node(
        &self,
        node_id: NodeId,
        target: NodeId,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let (peer_node, is_alive) = {
            let table = self.table.lock().await;
            match table.get_by_node_id(node_id) {
                Some(peer) => (peer.node, peer.state == NodeState::Alive),
                None => {
                    return Err(DiscoveryError::InvalidMessage("unknown sender".into()));
                }
            }
        };
        if !is_alive {
            return Err(DiscoveryError::InvalidMessage(
                "sender has not proven liveness".into(),
            ));
        }
        // Replying to a spoofed source would let the (much larger) NEIGHBORS
        // response amplify traffic toward a victim.
        if from.ip() != peer_node.ip {
            return Err(DiscoveryError::InvalidMessage(
                "source address does not match the stored endpoint".into(),
            ));
        }

        let closest = self
            .table
            .lock()
            .await
            .find_closest(target, MAX_NODES_PER_BUCKET);
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECS);

        for chunk in closest.chunks(NEIGHBORS_PER_DATAGRAM) {
            let neighbors = Message::Neighbors(NeighborsMessage::new(
                self.local_node,
                chunk.to_vec(),
                expiration,
            ));
            self.send(&neighbors, peer_node.udp_addr()).await?;
        }
        Ok(())
    }

    async fn handle_neighbors(
        &self,
        node_id: NodeId,
        nodes: Vec<Node>,
    ) -> Result<(), DiscoveryError> {
        let accepted = {
            let mut table = self.table.lock().await;
            let Some(peer) = table.get_by_node_id_mut(node_id) else {
                return Err(DiscoveryError::InvalidMessage("unknown sender".into()));
            };
            let Some(request) = &mut peer.find_node_request else {
                return Err(DiscoveryError::InvalidMessage(
                    "neighbors without an outstanding find_node".into(),
                ));
            };
            if request.sent_at.elapsed() >= Duration::from_secs(FIND_NODE_REQUEST_TTL_SECS) {
                peer.find_node_request = None;
                return Err(DiscoveryError::InvalidMessage(
                    "find_node request expired".into(),
                ));
            }

            let total = request.nodes_sent + nodes.len();
            if total > MAX_NODES_PER_BUCKET {
                debug!(
                    from = %node_id,
                    "Ignoring neighbors beyond the allowed bucket size"
                );
                None
            } else {
                request.nodes_sent = total;
                if let Some(tx) = &request.tx {
                    let _ = tx.send(nodes.clone());
                }
                if total == MAX_NODES_PER_BUCKET {
                    peer.find_node_request = None;
                }
                Some(nodes)
            }
        };

        if let Some(nodes) = accepted {
            for node in nodes {
                if node.node_id == self.local_node.node_id {
                    continue;
                }
                let _ = self.observe(node).await;
            }
        }
        Ok(())
    }

    /// Sends a liveness probe and records it against the routing-table entry
    /// so the cycle task can settle it.
    pub(crate) async fn ping(&self, node: &Node) -> Result<(), DiscoveryError> {
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECS);
        let ping = Message::Ping(PingMessage::new(
            self.local_node,
            node.endpoint(),
            expiration,
        ));
        self.send(&ping, node.udp_addr()).await?;
        self.table.lock().await.record_sent_ping(node.node_id);
        Ok(())
    }

    async fn pong(&self, node: &Node) -> Result<(), DiscoveryError> {
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECS);
        let pong = Message::Pong(PongMessage::new(self.local_node, expiration));
        self.send(&pong, node.udp_addr()).await
    }

    async fn send(&self, message: &Message, to: SocketAddr) -> Result<(), DiscoveryError> {
        let mut buf = Vec::new();
        message.encode_with_signature(&mut buf, &self.signer);
        let bytes_sent = self
            .udp_socket
            .send_to(&buf, to)
            .await
            .map_err(DiscoveryError::MessageSendFailure)?;
        if bytes_sent != buf.len() {
            return Err(DiscoveryError::PartialMessageSent);
        }
        trace!(sent = %message, %to);
        Ok(())
    }

    /// Settles unanswered pings and re-pings stale entries, keeping the
    /// table's liveness picture current.
    async fn run_liveness_cycle(&self) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.cycle_ms));
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            debug!("Running discovery liveness cycle");

            let expired = self
                .table
                .lock()
                .await
                .take_expired_pings(Duration::from_millis(self.ping_timeout_ms));

            for node_id in expired {
                let score = self.reputation.adjust(node_id, PING_TIMEOUT_PENALTY);

                let was_pending_eviction =
                    self.pending_evictions.lock().await.remove(&node_id);
                if was_pending_eviction {
                    // The head lost its race against the waiting candidate.
                    let promoted = self.table.lock().await.replace_peer(node_id);
                    if let Some(promoted) = promoted {
                        debug!(evicted = %node_id, promoted = %promoted, "Replaced silent bucket head");
                        let _ = self.ping(&promoted).await;
                    }
                } else if is_dead_score(score) {
                    debug!(node = %node_id, score, "Node reputation collapsed, marking dead");
                    self.table.lock().await.mark_dead(node_id);
                }
            }

            let stale = self
                .table
                .lock()
                .await
                .stale_nodes(Duration::from_millis(self.cycle_ms));
            for node in stale {
                if let Err(e) = self.ping(&node).await {
                    debug!(node = %node, err = %e, "Failed to ping stale node");
                }
            }
        }
    }

    /// The union of live routing-table nodes and externally injected
    /// candidates, minus banned IPs and ourselves.
    pub async fn get_connectable_nodes(&self) -> Vec<Node> {
        let mut nodes = self.table.lock().await.alive_nodes();
        nodes.extend(self.injected.lock().await.iter().copied());

        let mut seen = HashSet::new();
        nodes.retain(|node| {
            node.node_id != self.local_node.node_id
                && seen.insert(node.node_id)
                && !self.bans.is_banned(&node.ip)
        });
        nodes
    }

    /// Feeds candidate nodes from an external source (e.g. the DNS
    /// discovery collaborator).
    pub async fn inject_nodes(&self, nodes: Vec<Node>) {
        let mut injected = self.injected.lock().await;
        for node in nodes {
            if node.node_id != self.local_node.node_id
                && !injected.iter().any(|n| n.node_id == node.node_id)
            {
                injected.push(node);
            }
        }
    }
}
