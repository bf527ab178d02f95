//! Kademlia routing table: 160 K-buckets keyed on the XOR distance to our
//! own node id, least-recently-seen first, each with a small replacement
//! cache. The table itself never does I/O; the discovery server drives ping
//! probes and feeds the results back in.

use crate::{
    types::{Node, NodeId, NodeState},
    utils::{bucket_index, distance},
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const MAX_NODES_PER_BUCKET: usize = 16;
const NUMBER_OF_BUCKETS: usize = 160;
const MAX_NUMBER_OF_REPLACEMENTS: usize = 10;

/// An outstanding FIND_NODE we sent to this peer. NEIGHBORS replies are only
/// accepted while one of these is pending, and only up to a bucket's worth
/// of nodes.
#[derive(Debug)]
pub struct FindNodeRequest {
    pub sent_at: Instant,
    pub nodes_sent: usize,
    /// Where to deliver the replies; `None` for fire-and-forget requests.
    pub tx: Option<mpsc::UnboundedSender<Vec<Node>>>,
}

impl FindNodeRequest {
    pub fn new(tx: Option<mpsc::UnboundedSender<Vec<Node>>>) -> Self {
        Self {
            sent_at: Instant::now(),
            nodes_sent: 0,
            tx,
        }
    }
}

#[derive(Debug)]
pub struct PeerData {
    pub node: Node,
    pub state: NodeState,
    pub last_seen: Instant,
    /// Set while a ping is in flight; cleared by the answering pong or by
    /// the timeout sweep.
    pub last_ping_sent: Option<Instant>,
    pub find_node_request: Option<FindNodeRequest>,
}

impl PeerData {
    fn new(node: Node) -> Self {
        Self {
            node,
            state: NodeState::Discovered,
            last_seen: Instant::now(),
            last_ping_sent: None,
            find_node_request: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Bucket {
    pub peers: Vec<PeerData>,
    pub replacements: Vec<PeerData>,
}

/// What happened to an observed node.
#[derive(Debug)]
pub enum InsertOutcome {
    /// Our own id; never inserted.
    SelfNode,
    /// Already known; refreshed and moved to the tail.
    Refreshed,
    Inserted,
    /// The bucket is full. The candidate went to the replacement cache and
    /// the caller should ping `head` to decide the eviction.
    BucketFull { head: Node },
}

#[derive(Debug)]
pub struct KademliaTable {
    local_node_id: NodeId,
    buckets: Vec<Bucket>,
}

impl KademliaTable {
    pub fn new(local_node_id: NodeId) -> Self {
        let buckets = (0..NUMBER_OF_BUCKETS).map(|_| Bucket::default()).collect();
        Self {
            local_node_id,
            buckets,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    #[allow(unused)]
    pub fn buckets(&self) -> &Vec<Bucket> {
        &self.buckets
    }

    fn bucket_of(&self, node_id: &NodeId) -> Option<usize> {
        bucket_index(node_id, &self.local_node_id)
    }

    /// Looks the node up in its bucket's live entries and, failing that, in
    /// the replacement cache; cached candidates still answer pings and
    /// FIND_NODE bookkeeping.
    pub fn get_by_node_id(&self, node_id: NodeId) -> Option<&PeerData> {
        let bucket = &self.buckets[self.bucket_of(&node_id)?];
        bucket
            .peers
            .iter()
            .chain(bucket.replacements.iter())
            .find(|entry| entry.node.node_id == node_id)
    }

    pub fn get_by_node_id_mut(&mut self, node_id: NodeId) -> Option<&mut PeerData> {
        let bucket_idx = self.bucket_of(&node_id)?;
        let bucket = &mut self.buckets[bucket_idx];
        bucket
            .peers
            .iter_mut()
            .chain(bucket.replacements.iter_mut())
            .find(|entry| entry.node.node_id == node_id)
    }

    /// Records an observation of `node`, following the K-bucket rules: move
    /// to tail when known, append while there is room, otherwise hand the
    /// eviction decision back to the caller.
    pub fn insert_node(&mut self, node: Node) -> InsertOutcome {
        let Some(bucket_idx) = self.bucket_of(&node.node_id) else {
            return InsertOutcome::SelfNode;
        };
        self.insert_node_inner(node, bucket_idx)
    }

    #[cfg(test)]
    pub fn insert_node_on_custom_bucket(&mut self, node: Node, bucket_idx: usize) -> InsertOutcome {
        self.insert_node_inner(node, bucket_idx)
    }

    fn insert_node_inner(&mut self, node: Node, bucket_idx: usize) -> InsertOutcome {
        let bucket = &mut self.buckets[bucket_idx];

        if let Some(pos) = bucket
            .peers
            .iter()
            .position(|p| p.node.node_id == node.node_id)
        {
            let mut peer = bucket.peers.remove(pos);
            peer.node = node;
            peer.last_seen = Instant::now();
            bucket.peers.push(peer);
            return InsertOutcome::Refreshed;
        }

        if let Some(existing) = bucket
            .replacements
            .iter_mut()
            .find(|p| p.node.node_id == node.node_id)
        {
            existing.node = node;
            existing.last_seen = Instant::now();
            return InsertOutcome::Refreshed;
        }

        if bucket.peers.len() < MAX_NODES_PER_BUCKET {
            bucket.peers.push(PeerData::new(node));
            return InsertOutcome::Inserted;
        }

        // Full: stash the candidate and let the caller probe the
        // least-recently-seen entry.
        if bucket.replacements.len() >= MAX_NUMBER_OF_REPLACEMENTS {
            bucket.replacements.remove(0);
        }
        bucket.replacements.push(PeerData::new(node));
        let head = bucket.peers[0].node;
        InsertOutcome::BucketFull { head }
    }

    /// Marks a pong from `node_id`: the node is alive, its pending ping is
    /// settled and it becomes the most-recently-seen entry of its bucket.
    /// Cached replacements are settled in place. Returns false for unknown
    /// nodes.
    pub fn pong_received(&mut self, node_id: NodeId) -> bool {
        let Some(bucket_idx) = self.bucket_of(&node_id) else {
            return false;
        };
        let bucket = &mut self.buckets[bucket_idx];
        if let Some(pos) = bucket
            .peers
            .iter()
            .position(|p| p.node.node_id == node_id)
        {
            let mut peer = bucket.peers.remove(pos);
            peer.state = NodeState::Alive;
            peer.last_seen = Instant::now();
            peer.last_ping_sent = None;
            bucket.peers.push(peer);
            return true;
        }
        if let Some(peer) = bucket
            .replacements
            .iter_mut()
            .find(|p| p.node.node_id == node_id)
        {
            peer.state = NodeState::Alive;
            peer.last_seen = Instant::now();
            peer.last_ping_sent = None;
            return true;
        }
        false
    }

    /// Refreshes `last_seen` without changing liveness.
    pub fn note_seen(&mut self, node_id: NodeId) {
        if let Some(peer) = self.get_by_node_id_mut(node_id) {
            peer.last_seen = Instant::now();
        }
    }

    pub fn record_sent_ping(&mut self, node_id: NodeId) {
        if let Some(peer) = self.get_by_node_id_mut(node_id) {
            peer.last_ping_sent = Some(Instant::now());
        }
    }

    pub fn mark_dead(&mut self, node_id: NodeId) {
        if let Some(peer) = self.get_by_node_id_mut(node_id) {
            peer.state = NodeState::Dead;
        }
    }

    /// Collects the nodes whose ping has been unanswered for longer than
    /// `timeout`, clearing their pending markers. Covers the replacement
    /// caches too, since cached candidates can be probed.
    pub fn take_expired_pings(&mut self, timeout: Duration) -> Vec<NodeId> {
        let mut expired = Vec::new();
        for bucket in &mut self.buckets {
            for peer in bucket.peers.iter_mut().chain(bucket.replacements.iter_mut()) {
                if let Some(sent_at) = peer.last_ping_sent {
                    if sent_at.elapsed() >= timeout {
                        peer.last_ping_sent = None;
                        expired.push(peer.node.node_id);
                    }
                }
            }
        }
        expired
    }

    /// Live-table entries that have not been seen for `older_than` and have
    /// no probe in flight; the liveness cycle pings these.
    pub fn stale_nodes(&self, older_than: Duration) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| &bucket.peers)
            .filter(|peer| {
                peer.state != NodeState::Dead
                    && peer.last_ping_sent.is_none()
                    && peer.last_seen.elapsed() >= older_than
            })
            .map(|peer| peer.node)
            .collect()
    }

    /// Evicts `node_id` and promotes the freshest replacement into its
    /// place. Returns the promoted peer, if any.
    pub fn replace_peer(&mut self, node_id: NodeId) -> Option<Node> {
        let bucket_idx = self.bucket_of(&node_id)?;
        let bucket = &mut self.buckets[bucket_idx];
        let pos = bucket
            .peers
            .iter()
            .position(|p| p.node.node_id == node_id)?;
        bucket.peers.remove(pos);

        let replacement = bucket.replacements.pop()?;
        let node = replacement.node;
        bucket.peers.push(replacement);
        Some(node)
    }

    /// Up to `k` live nodes closest to `target` by XOR distance.
    pub fn find_closest(&self, target: NodeId, k: usize) -> Vec<Node> {
        // The table caps out at 2560 entries, so scanning everything and
        // sorting is cheaper than it looks.
        let mut nodes: Vec<Node> = self
            .buckets
            .iter()
            .flat_map(|bucket| &bucket.peers)
            .filter(|peer| peer.state == NodeState::Alive)
            .map(|peer| peer.node)
            .collect();
        nodes.sort_by_key(|node| distance(&node.node_id, &target));
        nodes.truncate(k);
        nodes
    }

    pub fn alive_nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| &bucket.peers)
            .filter(|peer| peer.state == NodeState::Alive)
            .map(|peer| peer.node)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.peers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn random_node() -> Node {
        Node::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            0,
            0,
            NodeId::random(),
        )
    }

    fn node_in_bucket(local: &NodeId, bucket_idx: usize) -> Node {
        loop {
            let node = random_node();
            if bucket_index(&node.node_id, local) == Some(bucket_idx) {
                return node;
            }
        }
    }

    #[test]
    fn peers_land_in_the_bucket_matching_their_distance() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);
        for _ in 0..200 {
            table.insert_node(random_node());
        }
        for (idx, bucket) in table.buckets().iter().enumerate() {
            for peer in &bucket.peers {
                assert_eq!(bucket_index(&peer.node.node_id, &local), Some(idx));
            }
        }
    }

    #[test]
    fn self_is_never_inserted() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);
        let node = Node::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 0, local);
        assert!(matches!(table.insert_node(node), InsertOutcome::SelfNode));
        assert_eq!(table.peer_count(), 0);
    }

    #[test]
    fn buckets_never_exceed_k() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);
        // Bucket 0 catches roughly half of random ids, so it will overflow.
        for _ in 0..200 {
            table.insert_node(random_node());
        }
        for bucket in table.buckets() {
            assert!(bucket.peers.len() <= MAX_NODES_PER_BUCKET);
            assert!(bucket.replacements.len() <= MAX_NUMBER_OF_REPLACEMENTS);
        }
    }

    #[test]
    fn full_bucket_reports_its_head() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);

        let first = node_in_bucket(&local, 0);
        table.insert_node(first);
        for _ in 1..MAX_NODES_PER_BUCKET {
            table.insert_node(node_in_bucket(&local, 0));
        }

        let candidate = node_in_bucket(&local, 0);
        match table.insert_node(candidate) {
            InsertOutcome::BucketFull { head } => assert_eq!(head.node_id, first.node_id),
            other => panic!("expected BucketFull, got {other:?}"),
        }
        let bucket = &table.buckets()[0];
        assert_eq!(bucket.peers.len(), MAX_NODES_PER_BUCKET);
        assert_eq!(bucket.replacements.len(), 1);
        assert_eq!(bucket.replacements[0].node.node_id, candidate.node_id);
    }

    #[test]
    fn responsive_head_moves_to_tail_and_candidate_stays_cached() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);

        let head = node_in_bucket(&local, 0);
        table.insert_node(head);
        for _ in 1..MAX_NODES_PER_BUCKET {
            table.insert_node(node_in_bucket(&local, 0));
        }
        let candidate = node_in_bucket(&local, 0);
        assert!(matches!(
            table.insert_node(candidate),
            InsertOutcome::BucketFull { .. }
        ));

        table.record_sent_ping(head.node_id);
        assert!(table.pong_received(head.node_id));

        let bucket = &table.buckets()[0];
        assert_eq!(bucket.peers.len(), MAX_NODES_PER_BUCKET);
        assert_eq!(
            bucket.peers.last().unwrap().node.node_id,
            head.node_id,
            "answered head becomes most-recently-seen"
        );
        assert_eq!(bucket.replacements[0].node.node_id, candidate.node_id);
    }

    #[test]
    fn unresponsive_head_is_replaced_by_the_candidate() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);

        let head = node_in_bucket(&local, 0);
        table.insert_node(head);
        for _ in 1..MAX_NODES_PER_BUCKET {
            table.insert_node(node_in_bucket(&local, 0));
        }
        let candidate = node_in_bucket(&local, 0);
        table.insert_node(candidate);

        table.record_sent_ping(head.node_id);
        let expired = table.take_expired_pings(Duration::ZERO);
        assert_eq!(expired, vec![head.node_id]);

        let promoted = table.replace_peer(head.node_id).unwrap();
        assert_eq!(promoted.node_id, candidate.node_id);

        let bucket = &table.buckets()[0];
        assert_eq!(bucket.peers.len(), MAX_NODES_PER_BUCKET);
        assert!(table.get_by_node_id(head.node_id).is_none());
        assert!(table.get_by_node_id(candidate.node_id).is_some());
    }

    #[test]
    fn find_closest_returns_only_live_nodes_in_distance_order() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);
        let target = NodeId::random();

        let mut inserted = Vec::new();
        for _ in 0..64 {
            let node = random_node();
            table.insert_node(node);
            inserted.push(node);
        }
        // Only half of them answer.
        for node in inserted.iter().step_by(2) {
            table.pong_received(node.node_id);
        }

        let closest = table.find_closest(target, 8);
        assert!(closest.len() <= 8);
        for pair in closest.windows(2) {
            assert!(
                distance(&pair[0].node_id, &target) <= distance(&pair[1].node_id, &target)
            );
        }
        for node in &closest {
            assert_eq!(
                table.get_by_node_id(node.node_id).unwrap().state,
                NodeState::Alive
            );
        }
    }

    #[test]
    fn cached_replacements_are_visible_by_node_id() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);

        for _ in 0..MAX_NODES_PER_BUCKET {
            table.insert_node(node_in_bucket(&local, 0));
        }
        let candidate = node_in_bucket(&local, 0);
        assert!(matches!(
            table.insert_node(candidate),
            InsertOutcome::BucketFull { .. }
        ));

        // A lookup can still register its FIND_NODE against the cached
        // candidate and settle pings on it.
        let peer = table.get_by_node_id_mut(candidate.node_id).unwrap();
        peer.find_node_request = Some(FindNodeRequest::new(None));
        assert!(table.get_by_node_id(candidate.node_id).is_some());

        table.record_sent_ping(candidate.node_id);
        assert!(table.pong_received(candidate.node_id));
        let peer = table.get_by_node_id(candidate.node_id).unwrap();
        assert_eq!(peer.state, NodeState::Alive);
        assert!(peer.last_ping_sent.is_none());

        table.record_sent_ping(candidate.node_id);
        assert_eq!(
            table.take_expired_pings(Duration::ZERO),
            vec![candidate.node_id]
        );
    }

    #[test]
    fn refreshed_nodes_move_to_the_tail() {
        let local = NodeId::random();
        let mut table = KademliaTable::new(local);
        let a = node_in_bucket(&local, 1);
        let b = node_in_bucket(&local, 1);
        table.insert_node(a);
        table.insert_node(b);

        assert!(matches!(table.insert_node(a), InsertOutcome::Refreshed));
        let bucket = &table.buckets()[1];
        assert_eq!(bucket.peers.last().unwrap().node.node_id, a.node_id);
    }
}
