//! Signed UDP discovery packets.
//!
//! A datagram is `message_code (1 byte) | body | signature (65 bytes)`.
//! The recoverable ECDSA signature covers the code and the body, so
//! [`Packet::decode`] both authenticates the datagram and recovers the
//! sender's public key (and thus its node id) without any prior state.

use crate::{
    types::{Endpoint, Node, NodeId},
    utils::node_id_from_public_key,
    wire::{Decoder, Encoder, WireError},
};
use bytes::BufMut;
use secp256k1::{
    Message as SecpMessage, PublicKey, SECP256K1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};
use sha3::{Digest, Keccak256};
use std::fmt::Display;
use thiserror::Error;

/// Discovery datagrams stay well under the common 1500-byte MTU.
pub const MAX_DISC_PACKET_SIZE: usize = 1280;

const SIGNATURE_SIZE: usize = 65;

const PING_CODE: u8 = 0x01;
const PONG_CODE: u8 = 0x02;
const FIND_NODE_CODE: u8 = 0x03;
const NEIGHBORS_CODE: u8 = 0x04;

#[derive(Debug, Error)]
pub enum PacketDecodeErr {
    #[error("packet is too short to carry a signature")]
    InvalidSize,
    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),
    #[error("invalid packet signature")]
    InvalidSignature,
    #[error("unknown message code {0:#04x}")]
    UnknownCode(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMessage {
    pub from: Node,
    pub to: Endpoint,
    pub expiration: u64,
}

impl PingMessage {
    pub fn new(from: Node, to: Endpoint, expiration: u64) -> Self {
        Self {
            from,
            to,
            expiration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongMessage {
    pub from: Node,
    pub expiration: u64,
}

impl PongMessage {
    pub fn new(from: Node, expiration: u64) -> Self {
        Self { from, expiration }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeMessage {
    pub from: Node,
    pub target: NodeId,
    pub expiration: u64,
}

impl FindNodeMessage {
    pub fn new(from: Node, target: NodeId, expiration: u64) -> Self {
        Self {
            from,
            target,
            expiration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborsMessage {
    pub from: Node,
    pub nodes: Vec<Node>,
    pub expiration: u64,
}

impl NeighborsMessage {
    pub fn new(from: Node, nodes: Vec<Node>, expiration: u64) -> Self {
        Self {
            from,
            nodes,
            expiration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNode(FindNodeMessage),
    Neighbors(NeighborsMessage),
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Ping(_) => PING_CODE,
            Message::Pong(_) => PONG_CODE,
            Message::FindNode(_) => FIND_NODE_CODE,
            Message::Neighbors(_) => NEIGHBORS_CODE,
        }
    }

    /// The sender's self-description every message kind carries.
    pub fn from(&self) -> &Node {
        match self {
            Message::Ping(msg) => &msg.from,
            Message::Pong(msg) => &msg.from,
            Message::FindNode(msg) => &msg.from,
            Message::Neighbors(msg) => &msg.from,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Message::Ping(msg) => msg.expiration,
            Message::Pong(msg) => msg.expiration,
            Message::FindNode(msg) => msg.expiration,
            Message::Neighbors(msg) => msg.expiration,
        }
    }

    fn encode_body(&self, buf: &mut dyn BufMut) {
        match self {
            Message::Ping(msg) => Encoder::new(buf)
                .encode_field(&msg.from)
                .encode_field(&msg.to)
                .encode_field(&msg.expiration)
                .finish(),
            Message::Pong(msg) => Encoder::new(buf)
                .encode_field(&msg.from)
                .encode_field(&msg.expiration)
                .finish(),
            Message::FindNode(msg) => Encoder::new(buf)
                .encode_field(&msg.from)
                .encode_field(&msg.target)
                .encode_field(&msg.expiration)
                .finish(),
            Message::Neighbors(msg) => Encoder::new(buf)
                .encode_field(&msg.from)
                .encode_field(&msg.nodes)
                .encode_field(&msg.expiration)
                .finish(),
        }
    }

    fn decode_body(code: u8, body: &[u8]) -> Result<Message, PacketDecodeErr> {
        let decoder = Decoder::new(body);
        let message = match code {
            PING_CODE => {
                let (from, decoder) = decoder.decode_field("from")?;
                let (to, decoder) = decoder.decode_field("to")?;
                let (expiration, decoder) = decoder.decode_field("expiration")?;
                decoder.finish()?;
                Message::Ping(PingMessage::new(from, to, expiration))
            }
            PONG_CODE => {
                let (from, decoder) = decoder.decode_field("from")?;
                let (expiration, decoder) = decoder.decode_field("expiration")?;
                decoder.finish()?;
                Message::Pong(PongMessage::new(from, expiration))
            }
            FIND_NODE_CODE => {
                let (from, decoder) = decoder.decode_field("from")?;
                let (target, decoder) = decoder.decode_field("target")?;
                let (expiration, decoder) = decoder.decode_field("expiration")?;
                decoder.finish()?;
                Message::FindNode(FindNodeMessage::new(from, target, expiration))
            }
            NEIGHBORS_CODE => {
                let (from, decoder) = decoder.decode_field("from")?;
                let (nodes, decoder) = decoder.decode_field("nodes")?;
                let (expiration, decoder) = decoder.decode_field("expiration")?;
                decoder.finish()?;
                Message::Neighbors(NeighborsMessage::new(from, nodes, expiration))
            }
            other => return Err(PacketDecodeErr::UnknownCode(other)),
        };
        Ok(message)
    }

    /// Serializes `code | body | signature`, signing over the code and body.
    pub fn encode_with_signature(&self, buf: &mut Vec<u8>, signer: &SecretKey) {
        buf.push(self.code());
        self.encode_body(buf);

        let digest: [u8; 32] = Keccak256::digest(&buf[..]).into();
        let signature =
            SECP256K1.sign_ecdsa_recoverable(&SecpMessage::from_digest(digest), signer);
        let (recovery_id, compact) = signature.serialize_compact();
        buf.extend_from_slice(&compact);
        buf.push(recovery_id.to_i32() as u8);
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Ping(_) => write!(f, "Ping"),
            Message::Pong(_) => write!(f, "Pong"),
            Message::FindNode(_) => write!(f, "FindNode"),
            Message::Neighbors(_) => write!(f, "Neighbors"),
        }
    }
}

/// A decoded and authenticated datagram.
#[derive(Debug, Clone)]
pub struct Packet {
    message: Message,
    public_key: PublicKey,
    node_id: NodeId,
}

impl Packet {
    pub fn decode(data: &[u8]) -> Result<Packet, PacketDecodeErr> {
        if data.len() < 1 + SIGNATURE_SIZE {
            return Err(PacketDecodeErr::InvalidSize);
        }

        let (signed, signature) = data.split_at(data.len() - SIGNATURE_SIZE);
        let digest: [u8; 32] = Keccak256::digest(signed).into();

        let recovery_id = RecoveryId::from_i32(signature[SIGNATURE_SIZE - 1] as i32)
            .map_err(|_| PacketDecodeErr::InvalidSignature)?;
        let recoverable =
            RecoverableSignature::from_compact(&signature[..SIGNATURE_SIZE - 1], recovery_id)
                .map_err(|_| PacketDecodeErr::InvalidSignature)?;
        let public_key = SECP256K1
            .recover_ecdsa(&SecpMessage::from_digest(digest), &recoverable)
            .map_err(|_| PacketDecodeErr::InvalidSignature)?;

        let message = Message::decode_body(signed[0], &signed[1..])?;
        let node_id = node_id_from_public_key(&public_key);

        // The sender's claimed identity must be the one that signed the
        // datagram, otherwise the packet is a forgery.
        if message.from().node_id != node_id {
            return Err(PacketDecodeErr::InvalidSignature);
        }

        Ok(Packet {
            message,
            public_key,
            node_id,
        })
    }

    pub fn get_message(&self) -> &Message {
        &self.message
    }

    pub fn get_node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn get_public_key(&self) -> PublicKey {
        self.public_key
    }
}
