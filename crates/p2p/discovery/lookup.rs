//! Iterative FIND_NODE lookups.
//!
//! A lookup keeps a candidate set ordered by XOR distance to the target,
//! queries the α closest not-yet-asked nodes each round, merges whatever
//! they return and stops once the closest known candidates have all been
//! asked or the round budget runs out.

use crate::{
    discovery::messages::{FindNodeMessage, Message},
    kademlia::{FindNodeRequest, KademliaTable, MAX_NODES_PER_BUCKET},
    types::{Node, NodeId},
    utils::{distance, get_msg_expiration_from_seconds},
};
use secp256k1::SecretKey;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    net::UdpSocket,
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Concurrent queries per lookup round.
const LOOKUP_ALPHA: usize = 3;
/// A lookup gives up after this many rounds even if it keeps finding
/// closer candidates.
const MAX_LOOKUP_ROUNDS: usize = 8;
/// How long one queried node gets to answer with NEIGHBORS.
const NEIGHBORS_WAIT_SECS: u64 = 5;
/// Pause between periodic table-refresh lookups.
const LOOKUP_INTERVAL_SECS: u64 = 60;
/// Delay before the bootstrap lookup, giving the seed pings time to bond.
const INITIAL_LOOKUP_DELAY_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct DiscoveryLookupHandler {
    local_node: Node,
    signer: SecretKey,
    udp_socket: Arc<UdpSocket>,
    table: Arc<Mutex<KademliaTable>>,
    cancel: CancellationToken,
}

impl DiscoveryLookupHandler {
    pub fn new(
        local_node: Node,
        signer: SecretKey,
        udp_socket: Arc<UdpSocket>,
        table: Arc<Mutex<KademliaTable>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local_node,
            signer,
            udp_socket,
            table,
            cancel,
        }
    }

    /// First a self-lookup to populate our own neighborhood, then periodic
    /// lookups of random targets to keep the farther buckets fresh.
    pub async fn run_periodic_lookups(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(INITIAL_LOOKUP_DELAY_SECS)) => {}
        }
        self.lookup(self.local_node.node_id).await;

        let mut interval = tokio::time::interval(Duration::from_secs(LOOKUP_INTERVAL_SECS));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            self.lookup(NodeId::random()).await;
        }
    }

    pub async fn lookup(&self, target: NodeId) {
        let mut asked: HashSet<NodeId> = HashSet::new();
        let mut candidates = self
            .table
            .lock()
            .await
            .find_closest(target, MAX_NODES_PER_BUCKET);

        for round in 0..MAX_LOOKUP_ROUNDS {
            let to_ask: Vec<Node> = candidates
                .iter()
                .filter(|node| !asked.contains(&node.node_id))
                .take(LOOKUP_ALPHA)
                .copied()
                .collect();
            if to_ask.is_empty() {
                break;
            }

            trace!(round, target = %target, queries = to_ask.len(), "Lookup round");

            let queries = to_ask.iter().map(|node| {
                asked.insert(node.node_id);
                self.find_node(*node, target)
            });
            let results = futures::future::join_all(queries).await;

            let mut found_new = false;
            for node in results.into_iter().flatten() {
                if node.node_id == self.local_node.node_id {
                    continue;
                }
                if !candidates.iter().any(|c| c.node_id == node.node_id) {
                    candidates.push(node);
                    found_new = true;
                }
            }
            if found_new {
                candidates.sort_by_key(|node| distance(&node.node_id, &target));
                candidates.truncate(MAX_NODES_PER_BUCKET);
            }
        }

        debug!(target = %target, candidates = candidates.len(), "Lookup finished");
    }

    /// Sends one FIND_NODE and collects its (possibly split) NEIGHBORS
    /// replies until a bucket's worth arrived or the wait expires.
    async fn find_node(&self, node: Node, target: NodeId) -> Vec<Node> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut table = self.table.lock().await;
            match table.get_by_node_id_mut(node.node_id) {
                Some(peer) => peer.find_node_request = Some(FindNodeRequest::new(Some(tx))),
                None => return Vec::new(),
            }
        }

        let expiration = get_msg_expiration_from_seconds(20);
        let message = Message::FindNode(FindNodeMessage::new(self.local_node, target, expiration));
        let mut buf = Vec::new();
        message.encode_with_signature(&mut buf, &self.signer);
        if self.udp_socket.send_to(&buf, node.udp_addr()).await.is_err() {
            return Vec::new();
        }

        let mut nodes = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(NEIGHBORS_WAIT_SECS);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(mut batch)) => {
                    nodes.append(&mut batch);
                    if nodes.len() >= MAX_NODES_PER_BUCKET {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        // Clear the request so late replies are not mistaken for solicited
        // ones.
        if let Some(peer) = self.table.lock().await.get_by_node_id_mut(node.node_id) {
            peer.find_node_request = None;
        }

        nodes
    }
}
