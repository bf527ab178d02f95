//! A peer session: one TCP connection from handshake to teardown.
//!
//! Each session runs as a single task owning the framed stream. Outbound
//! messages arrive through a bounded queue on the [`SessionHandle`]; the
//! task multiplexes them with inbound frames, keep-alive probes and the
//! read-timeout watchdog. Nothing outside the task ever touches the socket,
//! so closing a session never disturbs its neighbors.

use crate::{
    ban::BanReason,
    error::NetError,
    frame::FrameCodec,
    handshake::{Handshake, HandshakeRole, HandshakeStep, PeerInfo, RemotePeer},
    message::{DisconnectCode, DisconnectMessage, Message, PingMessage, PongMessage},
    network::HandlerRegistry,
    types::NodeId,
    utils::current_unix_millis,
};
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace};

pub const KEEPALIVE_INTERVAL_MS: u64 = 10_000;
pub const READ_TIMEOUT_MS: u64 = 60_000;
const SEND_QUEUE_CAPACITY: usize = 256;
/// Granularity of the keep-alive / read-timeout watchdog.
const WATCHDOG_TICK_MS: u64 = 1_000;

/// Layered per-session counters: raw frames at the network layer,
/// reassembled messages (per opcode) at the application layer.
#[derive(Debug, Default)]
pub struct TrafficStats {
    net_frames_in: AtomicU64,
    net_frames_out: AtomicU64,
    net_bytes_in: AtomicU64,
    net_bytes_out: AtomicU64,
    app_messages_in: AtomicU64,
    app_messages_out: AtomicU64,
    app_bytes_in: AtomicU64,
    app_bytes_out: AtomicU64,
    per_opcode_in: Mutex<HashMap<u8, u64>>,
}

impl TrafficStats {
    pub fn record_frame_in(&self, bytes: usize) {
        self.net_frames_in.fetch_add(1, Ordering::Relaxed);
        self.net_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_out(&self, bytes: usize) {
        self.net_frames_out.fetch_add(1, Ordering::Relaxed);
        self.net_bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_app_in(&self, code: u8, bytes: usize) {
        self.app_messages_in.fetch_add(1, Ordering::Relaxed);
        self.app_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        let mut per_opcode = match self.per_opcode_in.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *per_opcode.entry(code).or_insert(0) += 1;
    }

    fn record_app_out(&self, bytes: usize) {
        self.app_messages_out.fetch_add(1, Ordering::Relaxed);
        self.app_bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let per_opcode_in = match self.per_opcode_in.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        TrafficSnapshot {
            net_frames_in: self.net_frames_in.load(Ordering::Relaxed),
            net_frames_out: self.net_frames_out.load(Ordering::Relaxed),
            net_bytes_in: self.net_bytes_in.load(Ordering::Relaxed),
            net_bytes_out: self.net_bytes_out.load(Ordering::Relaxed),
            app_messages_in: self.app_messages_in.load(Ordering::Relaxed),
            app_messages_out: self.app_messages_out.load(Ordering::Relaxed),
            app_bytes_in: self.app_bytes_in.load(Ordering::Relaxed),
            app_bytes_out: self.app_bytes_out.load(Ordering::Relaxed),
            per_opcode_in,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub net_frames_in: u64,
    pub net_frames_out: u64,
    pub net_bytes_in: u64,
    pub net_bytes_out: u64,
    pub app_messages_in: u64,
    pub app_messages_out: u64,
    pub app_bytes_in: u64,
    pub app_bytes_out: u64,
    pub per_opcode_in: HashMap<u8, u64>,
}

/// Rolling round-trip average fed by keep-alive pongs.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    total_ms: AtomicU64,
    samples: AtomicU64,
}

impl LatencyTracker {
    fn record(&self, sample_ms: u64) {
        self.total_ms.fetch_add(sample_ms, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn average(&self) -> Option<Duration> {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return None;
        }
        Some(Duration::from_millis(
            self.total_ms.load(Ordering::Relaxed) / samples,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
struct CloseIntent {
    code: DisconnectCode,
    ban: Option<BanReason>,
}

/// Cloneable reference to a live session. Owned by the connection manager;
/// handlers receive a borrow to reply with.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    addr: SocketAddr,
    node_id: NodeId,
    info: Arc<PeerInfo>,
    role: HandshakeRole,
    sender: mpsc::Sender<Message>,
    cancel: CancellationToken,
    stats: Arc<TrafficStats>,
    latency: Arc<LatencyTracker>,
    close_intent: Arc<Mutex<Option<CloseIntent>>>,
}

impl SessionHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        self.latency.average()
    }

    /// Queues a message without blocking. Fails fast when the queue is full
    /// rather than buffering unboundedly for a slow peer.
    pub fn send(&self, msg: Message) -> Result<(), NetError> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(NetError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetError::SessionClosed),
        }
    }

    /// Closes with the default reason and its default ban duration.
    pub fn close(&self) {
        self.close_with(DisconnectCode::ProtocolViolation, Some(BanReason::ProtocolViolation));
    }

    pub fn close_with(&self, code: DisconnectCode, ban: Option<BanReason>) {
        let mut intent = match self.close_intent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if intent.is_none() {
            *intent = Some(CloseIntent { code, ban });
        }
        drop(intent);
        self.cancel.cancel();
    }

    /// Used for shutdown and duplicate suppression.
    pub fn close_without_ban(&self, code: DisconnectCode) {
        self.close_with(code, None);
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Lifecycle notifications from session tasks to the connection manager.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake done; the manager answers `accepted = false` to suppress a
    /// duplicate.
    Established {
        handle: SessionHandle,
        accepted: oneshot::Sender<bool>,
    },
    Closed {
        addr: SocketAddr,
        node_id: Option<NodeId>,
        code: DisconnectCode,
        ban: Option<BanReason>,
    },
}

/// Everything a session task needs from its manager, passed by value at
/// spawn time.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub local: crate::handshake::LocalIdentity,
    pub max_frame_body_size: usize,
    pub max_packet_size: usize,
    pub compress: bool,
    pub handshake_expiry: Duration,
    pub handlers: Arc<HandlerRegistry>,
    pub events: mpsc::Sender<SessionEvent>,
}

pub(crate) async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    role: HandshakeRole,
    ctx: SessionContext,
) {
    let stats = Arc::new(TrafficStats::default());
    let codec = FrameCodec::new(ctx.max_frame_body_size, ctx.max_packet_size, ctx.compress)
        .with_stats(stats.clone());
    let mut framed = Framed::new(stream, codec);

    let peer = match tokio::time::timeout(
        ctx.handshake_expiry,
        perform_handshake(&mut framed, addr, role, &ctx),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err((code, ban))) => {
            let _ = framed.send(Message::Disconnect(DisconnectMessage::new(code))).await;
            let _ = ctx
                .events
                .send(SessionEvent::Closed {
                    addr,
                    node_id: None,
                    code,
                    ban,
                })
                .await;
            return;
        }
        Err(_) => {
            debug!(%addr, %role, "Handshake expired");
            let _ = framed
                .send(Message::Disconnect(DisconnectMessage::new(
                    DisconnectCode::HandshakeExpired,
                )))
                .await;
            let _ = ctx
                .events
                .send(SessionEvent::Closed {
                    addr,
                    node_id: None,
                    code: DisconnectCode::HandshakeExpired,
                    ban: None,
                })
                .await;
            return;
        }
    };

    let (sender, mut queue) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let cancel = CancellationToken::new();
    let latency = Arc::new(LatencyTracker::default());
    let handle = SessionHandle {
        addr,
        node_id: peer.node_id,
        info: Arc::new(peer.info),
        role,
        sender,
        cancel: cancel.clone(),
        stats: stats.clone(),
        latency: latency.clone(),
        close_intent: Arc::new(Mutex::new(None)),
    };

    let (accepted_tx, accepted_rx) = oneshot::channel();
    if ctx
        .events
        .send(SessionEvent::Established {
            handle: handle.clone(),
            accepted: accepted_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    if !accepted_rx.await.unwrap_or(false) {
        // Duplicate (or late ban): the newer session folds, no ban.
        let _ = framed
            .send(Message::Disconnect(DisconnectMessage::new(
                DisconnectCode::DuplicatePeer,
            )))
            .await;
        let _ = ctx
            .events
            .send(SessionEvent::Closed {
                addr,
                node_id: Some(handle.node_id),
                code: DisconnectCode::DuplicatePeer,
                ban: None,
            })
            .await;
        return;
    }

    debug!(peer = %handle.node_id, %addr, %role, "Session established");

    let close = established_loop(&mut framed, &handle, &mut queue, &latency, &stats, &ctx).await;

    let _ = tokio::time::timeout(
        Duration::from_secs(1),
        framed.send(Message::Disconnect(DisconnectMessage::new(close.code))),
    )
    .await;

    let _ = ctx
        .events
        .send(SessionEvent::Closed {
            addr,
            node_id: Some(handle.node_id),
            code: close.code,
            ban: close.ban,
        })
        .await;
}

async fn perform_handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    addr: SocketAddr,
    role: HandshakeRole,
    ctx: &SessionContext,
) -> Result<RemotePeer, (DisconnectCode, Option<BanReason>)> {
    let mut handshake = match role {
        HandshakeRole::Dialer => {
            let (handshake, init) = Handshake::new_dialer(ctx.local.clone());
            framed
                .send(init)
                .await
                .map_err(|_| (DisconnectCode::NetworkError, None))?;
            handshake
        }
        HandshakeRole::Listener => Handshake::new_listener(ctx.local.clone()),
    };

    loop {
        let msg = match framed.next().await {
            None => return Err((DisconnectCode::NetworkError, None)),
            Some(Err(e)) => {
                debug!(%addr, err = %e, "Stream error during handshake");
                return Err(match e {
                    // Garbage during the handshake is not worth a resync.
                    NetError::MalformedMessage(_) | NetError::MalformedFraming(_) => {
                        (DisconnectCode::BadHandshake, Some(BanReason::BadHandshake))
                    }
                    _ => (DisconnectCode::NetworkError, None),
                });
            }
            Some(Ok(msg)) => msg,
        };

        match handshake.on_message(msg) {
            Ok(HandshakeStep::Reply(reply)) => {
                framed
                    .send(reply)
                    .await
                    .map_err(|_| (DisconnectCode::NetworkError, None))?;
            }
            Ok(HandshakeStep::Complete { reply, peer }) => {
                if let Some(reply) = reply {
                    framed
                        .send(reply)
                        .await
                        .map_err(|_| (DisconnectCode::NetworkError, None))?;
                }
                if peer.node_id == ctx.local.node_id() {
                    return Err((DisconnectCode::DuplicatePeer, None));
                }
                return Ok(peer);
            }
            Err(failure) => {
                debug!(%addr, err = %failure.error, "Handshake validation failed");
                let code = match failure.error {
                    NetError::SignatureInvalid => DisconnectCode::BadHandshake,
                    NetError::ProtocolViolation(_) => match failure.ban {
                        Some(BanReason::ProtocolViolation) => DisconnectCode::ProtocolViolation,
                        _ => DisconnectCode::BadHandshake,
                    },
                    _ => DisconnectCode::BadHandshake,
                };
                return Err((code, failure.ban));
            }
        }
    }
}

async fn established_loop(
    framed: &mut Framed<TcpStream, FrameCodec>,
    handle: &SessionHandle,
    queue: &mut mpsc::Receiver<Message>,
    latency: &LatencyTracker,
    stats: &TrafficStats,
    ctx: &SessionContext,
) -> CloseIntent {
    let mut last_send = Instant::now();
    let mut last_recv = Instant::now();
    let mut watchdog = tokio::time::interval(Duration::from_millis(WATCHDOG_TICK_MS));
    watchdog.tick().await;

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                let intent = match handle.close_intent.lock() {
                    Ok(guard) => *guard,
                    Err(poisoned) => *poisoned.into_inner(),
                };
                return intent.unwrap_or(CloseIntent {
                    code: DisconnectCode::ClientQuitting,
                    ban: None,
                });
            }

            incoming = framed.next() => match incoming {
                None => {
                    return CloseIntent { code: DisconnectCode::NetworkError, ban: None };
                }
                Some(Err(e)) => {
                    debug!(peer = %handle.node_id, err = %e, "Stream error");
                    return classify_stream_error(e);
                }
                Some(Ok(msg)) => {
                    last_recv = Instant::now();
                    match msg {
                        Message::Ping(ping) => {
                            let pong = Message::Pong(PongMessage::new(ping.timestamp));
                            if framed.send(pong).await.is_err() {
                                return CloseIntent { code: DisconnectCode::NetworkError, ban: None };
                            }
                            last_send = Instant::now();
                        }
                        Message::Pong(pong) => {
                            let now = current_unix_millis();
                            latency.record(now.saturating_sub(pong.timestamp));
                        }
                        Message::Disconnect(disconnect) => {
                            trace!(peer = %handle.node_id, reason = %disconnect.code, "Peer disconnected");
                            return CloseIntent { code: DisconnectCode::DisconnectRequested, ban: None };
                        }
                        Message::Application(app) => {
                            stats.record_app_in(app.code, app.payload.len());
                            ctx.handlers.dispatch_message(handle, app.code, app.payload);
                        }
                        Message::Init(_) | Message::Hello(_) | Message::World(_) => {
                            // Handshake traffic after DONE is a protocol breach.
                            return CloseIntent {
                                code: DisconnectCode::ProtocolViolation,
                                ban: Some(BanReason::ProtocolViolation),
                            };
                        }
                    }
                }
            },

            outgoing = queue.recv() => match outgoing {
                Some(msg) => {
                    if let Message::Application(app) = &msg {
                        stats.record_app_out(app.payload.len());
                    }
                    if framed.send(msg).await.is_err() {
                        return CloseIntent { code: DisconnectCode::NetworkError, ban: None };
                    }
                    last_send = Instant::now();
                }
                // Every handle is gone; nothing can use this session again.
                None => {
                    return CloseIntent { code: DisconnectCode::ClientQuitting, ban: None };
                }
            },

            _ = watchdog.tick() => {
                if last_recv.elapsed() >= Duration::from_millis(READ_TIMEOUT_MS) {
                    debug!(peer = %handle.node_id, "Read timeout");
                    return CloseIntent { code: DisconnectCode::ReadTimeout, ban: None };
                }
                if last_send.elapsed() >= Duration::from_millis(KEEPALIVE_INTERVAL_MS) {
                    let ping = Message::Ping(PingMessage::new(current_unix_millis()));
                    if framed.send(ping).await.is_err() {
                        return CloseIntent { code: DisconnectCode::NetworkError, ban: None };
                    }
                    last_send = Instant::now();
                }
            }
        }
    }
}

fn classify_stream_error(e: NetError) -> CloseIntent {
    match e {
        // Wrong message for the current state, or a reserved opcode.
        NetError::ProtocolViolation(_) => CloseIntent {
            code: DisconnectCode::ProtocolViolation,
            ban: Some(BanReason::ProtocolViolation),
        },
        NetError::MalformedMessage(_) | NetError::MalformedFraming(_) => CloseIntent {
            code: DisconnectCode::ProtocolViolation,
            ban: None,
        },
        NetError::PayloadTooLarge { .. } => CloseIntent {
            code: DisconnectCode::ProtocolViolation,
            ban: None,
        },
        _ => CloseIntent {
            code: DisconnectCode::NetworkError,
            ban: None,
        },
    }
}
