//! Three-message authenticated handshake: INIT → HELLO → WORLD.
//!
//! The dialer opens with a fresh 32-byte secret. Both directions then prove
//! possession of their long-term key by signing a peer descriptor together
//! with the echoed secret, which binds the signature to this TCP connection.
//! The machine is pure state: the session task feeds it decoded messages and
//! writes whatever replies it produces, so every transition is testable
//! without a socket.

use crate::{
    ban::BanReason,
    error::NetError,
    message::{CodedMessage, Message},
    types::NodeId,
    utils::{current_unix_millis, node_id_from_public_key, node_id_from_signing_key},
    wire::{Decoder, Encoder, WireError},
};
use bytes::BufMut;
use ethereum_types::H256;
use secp256k1::{
    Message as SecpMessage, PublicKey, SECP256K1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Opens the handshake; `secret` must come back byte-exact in the peer's
/// HELLO (and our WORLD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitMessage {
    pub secret: H256,
    pub timestamp: u64,
}

impl CodedMessage for InitMessage {
    const CODE: u8 = 0x10;

    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.secret)
            .encode_field(&self.timestamp)
            .finish();
    }

    fn decode(msg_data: &[u8]) -> Result<Self, WireError> {
        let decoder = Decoder::new(msg_data);
        let (secret, decoder) = decoder.decode_field("secret")?;
        let (timestamp, decoder) = decoder.decode_field("timestamp")?;
        decoder.finish()?;
        Ok(Self { secret, timestamp })
    }
}

/// The descriptor both sides exchange and sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub network_id: u8,
    pub network_version: u16,
    /// Hex-encoded claimed node id; must match the id derived from the
    /// recovered signing key.
    pub peer_id: String,
    pub listen_port: u16,
    pub client_id: String,
    pub capabilities: Vec<String>,
    pub latest_block: u64,
    pub tag: String,
}

impl PeerInfo {
    fn encode_fields<'a>(&self, encoder: Encoder<'a>) -> Encoder<'a> {
        encoder
            .encode_field(&self.network_id)
            .encode_field(&self.network_version)
            .encode_field(&self.peer_id)
            .encode_field(&self.listen_port)
            .encode_field(&self.client_id)
            .encode_field(&self.capabilities)
            .encode_field(&self.latest_block)
            .encode_field(&self.tag)
    }

    fn decode_fields(decoder: Decoder<'_>) -> Result<(Self, Decoder<'_>), WireError> {
        let (network_id, decoder) = decoder.decode_field("network_id")?;
        let (network_version, decoder) = decoder.decode_field("network_version")?;
        let (peer_id, decoder) = decoder.decode_field("peer_id")?;
        let (listen_port, decoder) = decoder.decode_field("listen_port")?;
        let (client_id, decoder) = decoder.decode_field("client_id")?;
        let (capabilities, decoder) = decoder.decode_field("capabilities")?;
        let (latest_block, decoder) = decoder.decode_field("latest_block")?;
        let (tag, decoder) = decoder.decode_field("tag")?;
        Ok((
            Self {
                network_id,
                network_version,
                peer_id,
                listen_port,
                client_id,
                capabilities,
                latest_block,
                tag,
            },
            decoder,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub info: PeerInfo,
    pub secret: H256,
    pub timestamp: u64,
    pub signature: [u8; 65],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldMessage {
    pub info: PeerInfo,
    pub secret: H256,
    pub timestamp: u64,
    pub signature: [u8; 65],
}

fn encode_signed_descriptor(
    info: &PeerInfo,
    secret: &H256,
    timestamp: u64,
    signature: &[u8; 65],
    buf: &mut dyn BufMut,
) {
    info.encode_fields(Encoder::new(buf))
        .encode_field(secret)
        .encode_field(&timestamp)
        .encode_field(signature)
        .finish();
}

fn decode_signed_descriptor(
    msg_data: &[u8],
) -> Result<(PeerInfo, H256, u64, [u8; 65]), WireError> {
    let decoder = Decoder::new(msg_data);
    let (info, decoder) = PeerInfo::decode_fields(decoder)?;
    let (secret, decoder) = decoder.decode_field("secret")?;
    let (timestamp, decoder) = decoder.decode_field("timestamp")?;
    let (signature, decoder) = decoder.decode_field("signature")?;
    decoder.finish()?;
    Ok((info, secret, timestamp, signature))
}

impl CodedMessage for HelloMessage {
    const CODE: u8 = 0x11;

    fn encode(&self, buf: &mut dyn BufMut) {
        encode_signed_descriptor(&self.info, &self.secret, self.timestamp, &self.signature, buf);
    }

    fn decode(msg_data: &[u8]) -> Result<Self, WireError> {
        let (info, secret, timestamp, signature) = decode_signed_descriptor(msg_data)?;
        Ok(Self {
            info,
            secret,
            timestamp,
            signature,
        })
    }
}

impl CodedMessage for WorldMessage {
    const CODE: u8 = 0x12;

    fn encode(&self, buf: &mut dyn BufMut) {
        encode_signed_descriptor(&self.info, &self.secret, self.timestamp, &self.signature, buf);
    }

    fn decode(msg_data: &[u8]) -> Result<Self, WireError> {
        let (info, secret, timestamp, signature) = decode_signed_descriptor(msg_data)?;
        Ok(Self {
            info,
            secret,
            timestamp,
            signature,
        })
    }
}

/// Digest covered by the HELLO/WORLD signature: the descriptor, the echoed
/// secret and the timestamp, without the signature itself.
fn signing_digest(info: &PeerInfo, secret: &H256, timestamp: u64) -> [u8; 32] {
    let mut unsigned = Vec::new();
    info.encode_fields(Encoder::new(&mut unsigned))
        .encode_field(secret)
        .encode_field(&timestamp)
        .finish();
    Keccak256::digest(&unsigned).into()
}

fn sign_descriptor(info: &PeerInfo, secret: &H256, timestamp: u64, signer: &SecretKey) -> [u8; 65] {
    let digest = signing_digest(info, secret, timestamp);
    let signature =
        SECP256K1.sign_ecdsa_recoverable(&SecpMessage::from_digest(digest), signer);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}

fn recover_signer(
    info: &PeerInfo,
    secret: &H256,
    timestamp: u64,
    signature: &[u8; 65],
) -> Result<PublicKey, NetError> {
    let digest = signing_digest(info, secret, timestamp);
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| NetError::SignatureInvalid)?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| NetError::SignatureInvalid)?;
    SECP256K1
        .recover_ecdsa(&SecpMessage::from_digest(digest), &signature)
        .map_err(|_| NetError::SignatureInvalid)
}

/// Everything this node advertises about itself during the handshake.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub signer: SecretKey,
    pub network_id: u8,
    pub network_version: u16,
    pub listen_port: u16,
    pub client_id: String,
    pub capabilities: Vec<String>,
    /// Read at HELLO/WORLD build time so a long-lived service advertises
    /// its current head, not the one it started with.
    pub latest_block: Arc<AtomicU64>,
    pub tag: String,
}

impl LocalIdentity {
    pub fn node_id(&self) -> NodeId {
        node_id_from_signing_key(&self.signer)
    }

    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            network_id: self.network_id,
            network_version: self.network_version,
            peer_id: hex::encode(self.node_id()),
            listen_port: self.listen_port,
            client_id: self.client_id.clone(),
            capabilities: self.capabilities.clone(),
            latest_block: self.latest_block.load(Ordering::Relaxed),
            tag: self.tag.clone(),
        }
    }

    fn signed_descriptor(&self, secret: H256) -> (PeerInfo, H256, u64, [u8; 65]) {
        let info = self.peer_info();
        let timestamp = current_unix_millis();
        let signature = sign_descriptor(&info, &secret, timestamp, &self.signer);
        (info, secret, timestamp, signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Dialer,
    Listener,
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeRole::Dialer => write!(f, "dialer"),
            HandshakeRole::Listener => write!(f, "listener"),
        }
    }
}

enum HandshakeState {
    AwaitingInit,
    AwaitingHello { secret: H256 },
    AwaitingWorld { secret: H256 },
    Done,
}

/// The validated remote side of a completed handshake.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub node_id: NodeId,
    pub info: PeerInfo,
}

#[derive(Debug)]
pub enum HandshakeStep {
    /// Send this and keep waiting.
    Reply(Message),
    /// Handshake complete; send the reply first if there is one.
    Complete {
        reply: Option<Message>,
        peer: RemotePeer,
    },
}

/// A handshake validation failure: the error to report and the ban to apply
/// to the remote IP, if any.
#[derive(Debug)]
pub struct HandshakeFailure {
    pub error: NetError,
    pub ban: Option<BanReason>,
}

pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    local: LocalIdentity,
}

impl Handshake {
    /// Creates the dialer side together with the INIT message to send.
    pub fn new_dialer(local: LocalIdentity) -> (Self, Message) {
        let secret = H256::random();
        let init = Message::Init(InitMessage {
            secret,
            timestamp: current_unix_millis(),
        });
        (
            Self {
                role: HandshakeRole::Dialer,
                state: HandshakeState::AwaitingHello { secret },
                local,
            },
            init,
        )
    }

    pub fn new_listener(local: LocalIdentity) -> Self {
        Self {
            role: HandshakeRole::Listener,
            state: HandshakeState::AwaitingInit,
            local,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, HandshakeState::Done)
    }

    pub fn on_message(&mut self, msg: Message) -> Result<HandshakeStep, HandshakeFailure> {
        match (&self.state, msg) {
            (HandshakeState::AwaitingInit, Message::Init(init)) => {
                let secret = init.secret;
                let (info, secret, timestamp, signature) = self.local.signed_descriptor(secret);
                self.state = HandshakeState::AwaitingWorld { secret };
                Ok(HandshakeStep::Reply(Message::Hello(HelloMessage {
                    info,
                    secret,
                    timestamp,
                    signature,
                })))
            }
            (HandshakeState::AwaitingHello { secret }, Message::Hello(hello)) => {
                let expected = *secret;
                let peer = validate_descriptor(
                    &hello.info,
                    &hello.secret,
                    hello.timestamp,
                    &hello.signature,
                    &expected,
                    &self.local,
                )?;
                let (info, secret, timestamp, signature) =
                    self.local.signed_descriptor(expected);
                self.state = HandshakeState::Done;
                Ok(HandshakeStep::Complete {
                    reply: Some(Message::World(WorldMessage {
                        info,
                        secret,
                        timestamp,
                        signature,
                    })),
                    peer,
                })
            }
            (HandshakeState::AwaitingWorld { secret }, Message::World(world)) => {
                let expected = *secret;
                let peer = validate_descriptor(
                    &world.info,
                    &world.secret,
                    world.timestamp,
                    &world.signature,
                    &expected,
                    &self.local,
                )?;
                self.state = HandshakeState::Done;
                Ok(HandshakeStep::Complete { reply: None, peer })
            }
            (_, _) => Err(HandshakeFailure {
                error: NetError::ProtocolViolation("unexpected message during handshake"),
                ban: Some(BanReason::ProtocolViolation),
            }),
        }
    }
}

/// The four checks each side runs on the signed descriptor it receives:
/// signature, secret echo, network identity, claimed-vs-derived node id.
fn validate_descriptor(
    info: &PeerInfo,
    echoed_secret: &H256,
    timestamp: u64,
    signature: &[u8; 65],
    expected_secret: &H256,
    local: &LocalIdentity,
) -> Result<RemotePeer, HandshakeFailure> {
    let public_key =
        recover_signer(info, echoed_secret, timestamp, signature).map_err(|error| {
            HandshakeFailure {
                error,
                ban: Some(BanReason::MaliciousBehavior),
            }
        })?;

    if echoed_secret != expected_secret {
        return Err(HandshakeFailure {
            error: NetError::ProtocolViolation("handshake secret mismatch"),
            ban: Some(BanReason::BadHandshake),
        });
    }

    if info.network_id != local.network_id || info.network_version != local.network_version {
        return Err(HandshakeFailure {
            error: NetError::ProtocolViolation("peer is on a different network"),
            ban: Some(BanReason::BadHandshake),
        });
    }

    let claimed_id = NodeId::from_str(&info.peer_id).map_err(|_| HandshakeFailure {
        error: NetError::ProtocolViolation("unparseable peer id"),
        ban: Some(BanReason::BadHandshake),
    })?;
    let derived_id = node_id_from_public_key(&public_key);
    if claimed_id != derived_id {
        return Err(HandshakeFailure {
            error: NetError::ProtocolViolation("peer id does not match its signing key"),
            ban: Some(BanReason::BadHandshake),
        });
    }

    Ok(RemotePeer {
        node_id: derived_id,
        info: info.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn identity(network_id: u8) -> LocalIdentity {
        LocalIdentity {
            signer: SecretKey::new(&mut OsRng),
            network_id,
            network_version: 1,
            listen_port: 8001,
            client_id: "xdag-p2p/test".into(),
            capabilities: vec!["xdag".into()],
            latest_block: Arc::new(AtomicU64::new(42)),
            tag: String::new(),
        }
    }

    fn run_to_hello(dialer_local: &LocalIdentity, listener_local: &LocalIdentity) -> (Handshake, Handshake, Message) {
        let (dialer, init) = Handshake::new_dialer(dialer_local.clone());
        let mut listener = Handshake::new_listener(listener_local.clone());
        let hello = match listener.on_message(init).unwrap() {
            HandshakeStep::Reply(msg) => msg,
            _ => panic!("listener should reply with HELLO"),
        };
        (dialer, listener, hello)
    }

    #[test]
    fn full_exchange_completes_both_sides() {
        let a = identity(7);
        let b = identity(7);
        let (mut dialer, mut listener, hello) = run_to_hello(&a, &b);

        let (world, remote_b) = match dialer.on_message(hello).unwrap() {
            HandshakeStep::Complete { reply: Some(world), peer } => (world, peer),
            _ => panic!("dialer should complete and reply with WORLD"),
        };
        assert_eq!(remote_b.node_id, b.node_id());

        let remote_a = match listener.on_message(world).unwrap() {
            HandshakeStep::Complete { reply: None, peer } => peer,
            _ => panic!("listener should complete without a reply"),
        };
        assert_eq!(remote_a.node_id, a.node_id());
        assert!(dialer.is_done() && listener.is_done());
    }

    #[test]
    fn secret_mismatch_is_a_bad_handshake() {
        let a = identity(7);
        let b = identity(7);
        let (mut dialer, _listener, hello) = run_to_hello(&a, &b);

        // Re-sign the descriptor over a different secret, simulating an
        // acceptor that echoes a foreign nonce.
        let Message::Hello(hello) = hello else {
            panic!("expected hello")
        };
        let wrong_secret = H256::random();
        let timestamp = hello.timestamp;
        let signature = sign_descriptor(&hello.info, &wrong_secret, timestamp, &b.signer);
        let forged = Message::Hello(HelloMessage {
            info: hello.info,
            secret: wrong_secret,
            timestamp,
            signature,
        });

        let failure = dialer.on_message(forged).unwrap_err();
        assert_eq!(failure.ban, Some(BanReason::BadHandshake));
    }

    #[test]
    fn tampered_signature_is_malicious() {
        let a = identity(7);
        let b = identity(7);
        let (mut dialer, _listener, hello) = run_to_hello(&a, &b);

        let Message::Hello(mut hello) = hello else {
            panic!("expected hello")
        };
        // Corrupting the descriptor after signing invalidates the signature
        // (or recovers a key that does not match the claimed id).
        hello.info.latest_block += 1;

        let failure = dialer.on_message(Message::Hello(hello)).unwrap_err();
        assert!(matches!(
            failure.ban,
            Some(BanReason::MaliciousBehavior) | Some(BanReason::BadHandshake)
        ));
    }

    #[test]
    fn network_mismatch_is_rejected() {
        let a = identity(7);
        let b = identity(8);
        let (mut dialer, _listener, hello) = run_to_hello(&a, &b);

        let failure = dialer.on_message(hello).unwrap_err();
        assert_eq!(failure.ban, Some(BanReason::BadHandshake));
    }

    #[test]
    fn out_of_order_message_is_a_protocol_violation() {
        let a = identity(7);
        let (mut dialer, _init) = Handshake::new_dialer(a);
        let failure = dialer
            .on_message(Message::Ping(crate::message::PingMessage::new(0)))
            .unwrap_err();
        assert_eq!(failure.ban, Some(BanReason::ProtocolViolation));
        assert!(matches!(failure.error, NetError::ProtocolViolation(_)));
    }

    #[test]
    fn hello_codec_round_trip() {
        let b = identity(7);
        let secret = H256::random();
        let (info, secret, timestamp, signature) = b.signed_descriptor(secret);
        let hello = HelloMessage {
            info,
            secret,
            timestamp,
            signature,
        };

        let mut buf = Vec::new();
        hello.encode(&mut buf);
        assert_eq!(HelloMessage::decode(&buf).unwrap(), hello);
    }

    #[test]
    fn init_codec_round_trip() {
        let init = InitMessage {
            secret: H256::random(),
            timestamp: current_unix_millis(),
        };
        let mut buf = Vec::new();
        init.encode(&mut buf);
        assert_eq!(InitMessage::decode(&buf).unwrap(), init);
    }
}
