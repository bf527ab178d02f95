use crate::wire::WireError;
use thiserror::Error;

/// Errors surfaced by the TCP side of the stack: frame codec, handshake,
/// sessions and the connection manager. Per-session errors never cross the
/// manager boundary; they are converted into a close (and possibly a ban)
/// for the session that produced them.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] WireError),
    #[error("malformed framing: {0}")]
    MalformedFraming(String),
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("payload of {size} bytes exceeds the limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("could not encode frame payload: {0}")]
    EncodeFailed(String),
    #[error("handshake expired")]
    HandshakeTimeout,
    #[error("peer went silent past the read timeout")]
    ReadTimeout,
    #[error("another session for the same peer is already active")]
    DuplicatePeer,
    #[error("peer is banned")]
    Banned,
    #[error("session send queue is full")]
    QueueFull,
    #[error("session is closed")]
    SessionClosed,
    #[error("message type {0:#04x} already registered")]
    TypeAlreadyRegistered(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
