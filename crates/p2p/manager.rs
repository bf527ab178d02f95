//! Connection manager: owns every peer session and keeps the pool between
//! its configured bounds.
//!
//! Sessions never touch the manager's tables; they report lifecycle events
//! over a channel and the single event loop here is the only writer. The
//! dialer tops the pool up every few seconds, the sweeper trims it back
//! down, and the accept loop feeds inbound connections through the same
//! handshake path as outbound ones.

use crate::{
    ban::{BanList, BanReason},
    config::NetConfig,
    discovery::Discovery,
    error::NetError,
    handshake::{HandshakeRole, LocalIdentity},
    message::DisconnectCode,
    network::HandlerRegistry,
    session::{SessionContext, SessionEvent, SessionHandle, run_session},
    types::{Node, NodeId},
};
use rand::seq::SliceRandom;
use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

const DIAL_INTERVAL_SECS: u64 = 5;
const SWEEP_INTERVAL_SECS: u64 = 30;
/// Skip nodes we already dialed within this window.
const DIAL_DEBOUNCE_SECS: u64 = 30;
const DIAL_TIMEOUT_SECS: u64 = 5;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct SessionTables {
    by_addr: HashMap<SocketAddr, SessionHandle>,
    by_node: HashMap<NodeId, SessionHandle>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    local: LocalIdentity,
    min_connections: usize,
    max_connections: usize,
    handshake_expiry: Duration,
    max_frame_body_size: usize,
    max_packet_size: usize,
    compress: bool,
    trust_nodes: HashSet<IpAddr>,
    bans: BanList,
    discovery: Discovery,
    handlers: Arc<HandlerRegistry>,
    sessions: Mutex<SessionTables>,
    recent_dials: Mutex<HashMap<NodeId, Instant>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: &NetConfig,
        local: LocalIdentity,
        bans: BanList,
        discovery: Discovery,
        handlers: Arc<HandlerRegistry>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                local,
                min_connections: config.min_connections,
                max_connections: config.max_connections,
                handshake_expiry: Duration::from_millis(config.net_handshake_expiry),
                max_frame_body_size: config.net_max_frame_body_size,
                max_packet_size: config.net_max_packet_size,
                compress: config.enable_frame_compression,
                trust_nodes: config.trust_nodes.iter().copied().collect(),
                bans,
                discovery,
                handlers,
                sessions: Mutex::new(SessionTables::default()),
                recent_dials: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
                tracker,
                cancel,
            }),
        }
    }

    /// Spawns the event loop, the accept loop, the dialer and the
    /// over-capacity sweeper.
    pub fn start(&self, listener: TcpListener) {
        let events_rx = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(events_rx) = events_rx {
            self.inner.tracker.spawn({
                let manager = self.clone();
                async move { manager.run_events(events_rx).await }
            });
        }
        self.inner.tracker.spawn({
            let manager = self.clone();
            async move { manager.run_acceptor(listener).await }
        });
        self.inner.tracker.spawn({
            let manager = self.clone();
            async move { manager.run_dialer().await }
        });
        self.inner.tracker.spawn({
            let manager = self.clone();
            async move { manager.run_sweeper().await }
        });
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            local: self.inner.local.clone(),
            max_frame_body_size: self.inner.max_frame_body_size,
            max_packet_size: self.inner.max_packet_size,
            compress: self.inner.compress,
            handshake_expiry: self.inner.handshake_expiry,
            handlers: self.inner.handlers.clone(),
            events: self.inner.events_tx.clone(),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.sessions.lock().await.by_node.len()
    }

    pub async fn session(&self, node_id: NodeId) -> Option<SessionHandle> {
        self.inner.sessions.lock().await.by_node.get(&node_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.inner
            .sessions
            .lock()
            .await
            .by_node
            .values()
            .cloned()
            .collect()
    }

    /// Explicit dial requested through the façade. Skips the
    /// connectable-nodes filter and the de-bounce cache, but never dials a
    /// banned address.
    pub async fn connect(&self, node: Node) -> Result<(), NetError> {
        if self.inner.bans.is_banned(&node.ip) {
            return Err(NetError::Banned);
        }
        if self.inner.sessions.lock().await.by_node.contains_key(&node.node_id) {
            return Err(NetError::DuplicatePeer);
        }
        self.spawn_dial(node);
        Ok(())
    }

    /// Closes every session without banning and lets their tasks drain.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let sessions = self.inner.sessions.lock().await;
            sessions.by_addr.values().cloned().collect()
        };
        for handle in handles {
            handle.close_without_ban(DisconnectCode::ClientQuitting);
        }
    }

    async fn run_events(&self, mut events_rx: mpsc::Receiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }

        // Drain whatever the closing sessions still report, so their ban
        // verdicts are not lost during shutdown.
        while let Ok(event) = events_rx.try_recv() {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Established { handle, accepted } => {
                let verdict = self.try_register(&handle).await;
                let _ = accepted.send(verdict);
                if verdict {
                    info!(peer = %handle.node_id(), addr = %handle.addr(), role = %handle.role(), "Peer connected");
                    self.inner.handlers.notify_connect(&handle);
                }
            }
            SessionEvent::Closed {
                addr,
                node_id,
                code,
                ban,
            } => {
                let was_registered = {
                    let mut sessions = self.inner.sessions.lock().await;
                    let removed = sessions.by_addr.remove(&addr).is_some();
                    if let Some(node_id) = node_id {
                        // The id may already belong to a replacement session
                        // from another address; only remove our own entry.
                        if sessions
                            .by_node
                            .get(&node_id)
                            .is_some_and(|h| h.addr() == addr)
                        {
                            sessions.by_node.remove(&node_id);
                        }
                    }
                    removed
                };

                // Dial failures (never registered, network-level reason)
                // are surfaced to the handlers too, so applications see
                // their connect attempts fail.
                let report = was_registered
                    || (!was_registered && code == DisconnectCode::NetworkError);
                if report {
                    debug!(peer = ?node_id, %addr, reason = %code, "Peer disconnected");
                    if let Some(node_id) = node_id {
                        self.inner.handlers.notify_disconnect(node_id, addr, code);
                    }
                }

                if let Some(reason) = ban {
                    self.ban_and_drop_sessions(addr.ip(), reason).await;
                }
            }
        }
    }

    async fn try_register(&self, handle: &SessionHandle) -> bool {
        if self.inner.bans.is_banned(&handle.addr().ip()) {
            return false;
        }
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.by_node.contains_key(&handle.node_id()) {
            // Simultaneous-connect race: the session that registered first
            // wins, the newer one is told to fold.
            debug!(peer = %handle.node_id(), "Suppressing duplicate session");
            return false;
        }
        sessions.by_addr.insert(handle.addr(), handle.clone());
        sessions.by_node.insert(handle.node_id(), handle.clone());
        true
    }

    /// Applies a ban and closes any other sessions from that IP. Those
    /// closes use the no-ban path, so a single offense yields exactly one
    /// ban record.
    async fn ban_and_drop_sessions(&self, ip: IpAddr, reason: BanReason) {
        if self.inner.bans.ban(ip, reason, None).is_none() {
            return;
        }
        let victims: Vec<SessionHandle> = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .by_addr
                .values()
                .filter(|handle| handle.addr().ip() == ip)
                .cloned()
                .collect()
        };
        for handle in victims {
            handle.close_without_ban(DisconnectCode::DisconnectRequested);
        }
    }

    async fn run_acceptor(&self, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(err = %e, "Error accepting connection, stopping listener");
                        return;
                    }
                },
            };

            if self.inner.bans.is_banned(&peer_addr.ip()) {
                // Close without sending a byte.
                debug!(%peer_addr, "Rejected connection from banned ip");
                drop(stream);
                continue;
            }

            if self.peer_count().await >= self.inner.max_connections {
                // Hard-full: shed the connection and ask the peer to back
                // off for a couple of minutes.
                debug!(%peer_addr, "Connection pool is full, shedding inbound connection");
                self.inner
                    .bans
                    .ban(peer_addr.ip(), BanReason::TooManyConnections, None);
                drop(stream);
                continue;
            }

            let ctx = self.session_context();
            self.inner.tracker.spawn(run_session(
                stream,
                peer_addr,
                HandshakeRole::Listener,
                ctx,
            ));
        }
    }

    async fn run_dialer(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(DIAL_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let active = self.peer_count().await;
            let desired = self.inner.min_connections.saturating_sub(active);
            if desired == 0 {
                continue;
            }

            let mut candidates = self.inner.discovery.get_connectable_nodes().await;
            candidates.shuffle(&mut rand::thread_rng());

            let connected: HashSet<NodeId> = {
                let sessions = self.inner.sessions.lock().await;
                sessions.by_node.keys().copied().collect()
            };
            let mut recent = self.inner.recent_dials.lock().await;
            recent.retain(|_, dialed_at| {
                dialed_at.elapsed() < Duration::from_secs(DIAL_DEBOUNCE_SECS)
            });

            let mut dialed = 0;
            for node in candidates {
                if dialed >= desired {
                    break;
                }
                if self.inner.bans.is_banned(&node.ip)
                    || connected.contains(&node.node_id)
                    || recent.contains_key(&node.node_id)
                {
                    continue;
                }
                recent.insert(node.node_id, Instant::now());
                dialed += 1;
                self.spawn_dial(node);
            }
            if dialed > 0 {
                debug!(dialed, active, "Dialer topped up the connection pool");
            }
        }
    }

    fn spawn_dial(&self, node: Node) {
        let ctx = self.session_context();
        let events = self.inner.events_tx.clone();
        self.inner.tracker.spawn(async move {
            let addr = node.tcp_addr();
            let stream = tokio::time::timeout(
                Duration::from_secs(DIAL_TIMEOUT_SECS),
                TcpStream::connect(addr),
            )
            .await;
            match stream {
                Ok(Ok(stream)) => run_session(stream, addr, HandshakeRole::Dialer, ctx).await,
                Ok(Err(e)) => {
                    debug!(node = %node, err = %e, "Dial failed");
                    let _ = events
                        .send(SessionEvent::Closed {
                            addr,
                            node_id: Some(node.node_id),
                            code: DisconnectCode::NetworkError,
                            ban: None,
                        })
                        .await;
                }
                Err(_) => {
                    debug!(node = %node, "Dial timed out");
                    let _ = events
                        .send(SessionEvent::Closed {
                            addr,
                            node_id: Some(node.node_id),
                            code: DisconnectCode::NetworkError,
                            ban: None,
                        })
                        .await;
                }
            }
        });
    }

    /// Trims the pool when it sits at or above the ceiling, evicting one
    /// random non-trust peer per pass, without banning it.
    async fn run_sweeper(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let victim = {
                let sessions = self.inner.sessions.lock().await;
                if sessions.by_node.len() < self.inner.max_connections {
                    continue;
                }
                let evictable: Vec<SessionHandle> = sessions
                    .by_node
                    .values()
                    .filter(|handle| !self.inner.trust_nodes.contains(&handle.addr().ip()))
                    .cloned()
                    .collect();
                evictable.choose(&mut rand::thread_rng()).cloned()
            };

            if let Some(victim) = victim {
                info!(peer = %victim.node_id(), "Evicting random peer to relieve the pool");
                victim.close_without_ban(DisconnectCode::TooManyPeers);
            }
        }
    }
}
