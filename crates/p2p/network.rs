//! Service façade: wires discovery, the connection manager, the reputation
//! store and the ban table together, and dispatches network events to the
//! registered application handlers.

use crate::{
    ban::{BanList, BanRecord, BanStatsSnapshot},
    config::{ConfigError, NetConfig},
    discovery::{Discovery, DiscoveryError},
    error::NetError,
    handshake::LocalIdentity,
    kademlia::KademliaTable,
    manager::ConnectionManager,
    message::{ApplicationMessage, DisconnectCode, Message, is_application_code},
    reputation::{DEFAULT_SAVE_INTERVAL_MS, ReputationStore},
    session::SessionHandle,
    types::{Node, NodeId},
    utils::node_id_from_signing_key,
};
use bytes::Bytes;
use secp256k1::SecretKey;
use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, trace, warn};

/// How long `stop()` waits for tasks to drain before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start discovery: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("failed to bind tcp listener on {addr}: {err}")]
    BindTcp { addr: SocketAddr, err: io::Error },
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("service is already running")]
    AlreadyStarted,
    #[error("service is not running")]
    NotStarted,
}

/// Application-side callbacks. Implementations must not block: they run on
/// the session's reader task.
pub trait MessageHandler: Send + Sync {
    fn on_connect(&self, peer: &SessionHandle) {
        let _ = peer;
    }

    fn on_disconnect(&self, node_id: NodeId, addr: SocketAddr, reason: DisconnectCode) {
        let _ = (node_id, addr, reason);
    }

    /// Called with the reassembled, decompressed payload of every message
    /// whose opcode this handler registered for.
    fn on_message(&self, peer: &SessionHandle, code: u8, payload: Bytes);
}

/// Opcode → handler table, frozen at `start()`.
#[derive(Default)]
pub struct HandlerRegistry {
    by_code: HashMap<u8, usize>,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Claims `codes` for `handler`. Framework opcodes (`0x00..=0x1f`) and
    /// opcodes that already have a handler are rejected.
    pub fn register(
        &mut self,
        codes: &[u8],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), NetError> {
        for &code in codes {
            if !is_application_code(code) || self.by_code.contains_key(&code) {
                return Err(NetError::TypeAlreadyRegistered(code));
            }
        }
        let index = self.handlers.len();
        self.handlers.push(handler);
        for &code in codes {
            self.by_code.insert(code, index);
        }
        Ok(())
    }

    pub(crate) fn dispatch_message(&self, peer: &SessionHandle, code: u8, payload: Bytes) {
        match self.by_code.get(&code) {
            Some(&index) => self.handlers[index].on_message(peer, code, payload),
            None => trace!(code, "No handler for opcode, dropping"),
        }
    }

    pub(crate) fn notify_connect(&self, peer: &SessionHandle) {
        for handler in &self.handlers {
            handler.on_connect(peer);
        }
    }

    pub(crate) fn notify_disconnect(
        &self,
        node_id: NodeId,
        addr: SocketAddr,
        reason: DisconnectCode,
    ) {
        for handler in &self.handlers {
            handler.on_disconnect(node_id, addr, reason);
        }
    }
}

/// Operator-facing snapshot of the whole service.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub local_node: Node,
    pub peer_count: usize,
    pub connectable_count: usize,
    pub ban_stats: BanStatsSnapshot,
    pub reputation_entries: usize,
}

struct Running {
    local_node: Node,
    discovery: Discovery,
    manager: ConnectionManager,
    reputation: ReputationStore,
    bans: BanList,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// The p2p service. Register handlers, `start()`, talk to peers, `stop()`.
pub struct NetworkService {
    config: NetConfig,
    signer: SecretKey,
    registry: Option<HandlerRegistry>,
    latest_block: Arc<AtomicU64>,
    running: Option<Running>,
}

impl NetworkService {
    pub fn new(config: NetConfig) -> Result<Self, NetworkError> {
        config.validate()?;
        let signer = config.signing_key()?;
        Ok(Self {
            config,
            signer,
            registry: Some(HandlerRegistry::default()),
            latest_block: Arc::new(AtomicU64::new(0)),
            running: None,
        })
    }

    pub fn node_id(&self) -> NodeId {
        node_id_from_signing_key(&self.signer)
    }

    /// Registers `handler` for a set of application opcodes. Must be called
    /// before `start()`; claiming a framework or taken opcode fails with
    /// `TypeAlreadyRegistered` and the service refuses to start that way.
    pub fn register_handler(
        &mut self,
        codes: &[u8],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), NetworkError> {
        match &mut self.registry {
            Some(registry) => Ok(registry.register(codes, handler)?),
            None => Err(NetworkError::AlreadyStarted),
        }
    }

    /// Advertised in subsequent handshakes.
    pub fn set_latest_block(&self, block_number: u64) {
        self.latest_block.store(block_number, Ordering::Relaxed);
    }

    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running.is_some() {
            return Err(NetworkError::AlreadyStarted);
        }

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let node_id = self.node_id();

        let reputation = ReputationStore::load(&self.config.reputation_dir());
        reputation.spawn_saver(&tracker, cancel.clone(), DEFAULT_SAVE_INTERVAL_MS);

        let bans = BanList::new(self.config.trust_nodes.iter().copied());
        let table = Arc::new(Mutex::new(KademliaTable::new(node_id)));

        let advertised_ip = self
            .config
            .public_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        // Bind TCP first so the discovery messages advertise the real port
        // even when the configured port is 0.
        let tcp_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.port,
        );
        let listener = listener(tcp_addr)
            .map_err(|err| NetworkError::BindTcp { addr: tcp_addr, err })?;
        let tcp_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);

        let local_node = Node::new(advertised_ip, self.config.port, tcp_port, node_id);
        let discovery = Discovery::try_new(
            local_node,
            self.signer,
            table,
            reputation.clone(),
            bans.clone(),
            tracker.clone(),
            cancel.clone(),
        )
        .await?;
        let local_node = discovery.local_node();

        info!(node = %local_node, "Starting p2p service");
        discovery.start(self.config.seed_nodes.clone()).await;

        let local_identity = LocalIdentity {
            signer: self.signer,
            network_id: self.config.network_id,
            network_version: self.config.network_version,
            listen_port: tcp_port,
            client_id: self.config.client_id.clone(),
            capabilities: self.config.capabilities.clone(),
            latest_block: self.latest_block.clone(),
            tag: self.config.tag.clone(),
        };

        let registry = self.registry.take().unwrap_or_default();
        let manager = ConnectionManager::new(
            &self.config,
            local_identity,
            bans.clone(),
            discovery.clone(),
            Arc::new(registry),
            tracker.clone(),
            cancel.clone(),
        );
        manager.start(listener);

        self.running = Some(Running {
            local_node,
            discovery,
            manager,
            reputation,
            bans,
            tracker,
            cancel,
        });
        Ok(())
    }

    /// Stops every task, closes all sessions without banning and flushes
    /// the reputation store.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!("Stopping p2p service");

        running.manager.shutdown().await;
        running.cancel.cancel();
        running.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, running.tracker.wait())
            .await
            .is_err()
        {
            warn!("Some network tasks did not stop within the grace window");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_node(&self) -> Option<Node> {
        self.running.as_ref().map(|running| running.local_node)
    }

    fn running(&self) -> Result<&Running, NetworkError> {
        self.running.as_ref().ok_or(NetworkError::NotStarted)
    }

    /// Explicitly dials `node`, bypassing the connectable-nodes filter.
    pub async fn connect(&self, node: Node) -> Result<(), NetworkError> {
        Ok(self.running()?.manager.connect(node).await?)
    }

    /// Live routing-table nodes plus externally injected candidates.
    pub async fn get_connectable_nodes(&self) -> Result<Vec<Node>, NetworkError> {
        Ok(self.running()?.discovery.get_connectable_nodes().await)
    }

    /// Feeds candidates from an external discovery source (e.g. DNS).
    pub async fn inject_nodes(&self, nodes: Vec<Node>) -> Result<(), NetworkError> {
        self.running()?.discovery.inject_nodes(nodes).await;
        Ok(())
    }

    /// Queues an application message for `node_id`.
    pub async fn send_message(
        &self,
        node_id: NodeId,
        code: u8,
        payload: Bytes,
    ) -> Result<(), NetworkError> {
        let session = self
            .running()?
            .manager
            .session(node_id)
            .await
            .ok_or(NetError::SessionClosed)?;
        session.send(Message::Application(ApplicationMessage::new(code, payload)))?;
        Ok(())
    }

    pub async fn peers(&self) -> Result<Vec<SessionHandle>, NetworkError> {
        Ok(self.running()?.manager.sessions().await)
    }

    /// Handle to the reputation store, e.g. for application-level scoring.
    pub fn reputation(&self) -> Result<ReputationStore, NetworkError> {
        Ok(self.running()?.reputation.clone())
    }

    pub fn ban_ip(&self, ip: IpAddr) -> Result<Option<BanRecord>, NetworkError> {
        Ok(self
            .running()?
            .bans
            .ban(ip, crate::ban::BanReason::ManualBan, None))
    }

    pub fn unban_ip(&self, ip: &IpAddr) -> Result<bool, NetworkError> {
        Ok(self.running()?.bans.unban(ip))
    }

    pub fn get_all_banned_nodes(&self) -> Result<Vec<BanRecord>, NetworkError> {
        Ok(self.running()?.bans.get_all_banned_nodes())
    }

    pub fn ban_stats(&self) -> Result<BanStatsSnapshot, NetworkError> {
        Ok(self.running()?.bans.stats())
    }

    pub async fn node_info(&self) -> Result<NodeInfo, NetworkError> {
        let running = self.running()?;
        Ok(NodeInfo {
            local_node: running.local_node,
            peer_count: running.manager.peer_count().await,
            connectable_count: running.discovery.get_connectable_nodes().await.len(),
            ban_stats: running.bans.stats(),
            reputation_entries: running.reputation.size(),
        })
    }
}

fn listener(tcp_addr: SocketAddr) -> Result<TcpListener, io::Error> {
    let tcp_socket = match tcp_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;
    tcp_socket.set_reuseaddr(true).ok();
    tcp_socket.bind(tcp_addr)?;
    tcp_socket.listen(50)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    impl MessageHandler for NoopHandler {
        fn on_message(&self, _peer: &SessionHandle, _code: u8, _payload: Bytes) {}
    }

    #[test]
    fn framework_opcodes_cannot_be_registered() {
        let mut registry = HandlerRegistry::default();
        let err = registry
            .register(&[0x10], Arc::new(NoopHandler))
            .unwrap_err();
        assert!(matches!(err, NetError::TypeAlreadyRegistered(0x10)));
    }

    #[test]
    fn opcodes_cannot_be_claimed_twice() {
        let mut registry = HandlerRegistry::default();
        registry.register(&[0x20, 0x21], Arc::new(NoopHandler)).unwrap();
        let err = registry
            .register(&[0x21], Arc::new(NoopHandler))
            .unwrap_err();
        assert!(matches!(err, NetError::TypeAlreadyRegistered(0x21)));
    }

    #[test]
    fn registration_is_rejected_when_any_code_is_bad() {
        let mut registry = HandlerRegistry::default();
        assert!(registry.register(&[0x30, 0x1f], Arc::new(NoopHandler)).is_err());
        // The valid code from the failed batch stays free.
        assert!(registry.register(&[0x30], Arc::new(NoopHandler)).is_ok());
    }
}
