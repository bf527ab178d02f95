use crate::{
    error::NetError,
    handshake::{HelloMessage, InitMessage, WorldMessage},
    wire::{Decoder, Encoder, WireError},
};
use bytes::{BufMut, Bytes};
use std::fmt::Display;

/// Opcodes `0x00..=0x1f` are reserved for the framework; everything above is
/// available to application handlers.
pub const FRAMEWORK_CODE_MAX: u8 = 0x1f;

pub fn is_application_code(code: u8) -> bool {
    code > FRAMEWORK_CODE_MAX
}

/// A message carried inside a TCP frame. The frame header's `packet_type`
/// is the opcode; the frame body is the payload encoded by [`CodedMessage`].
pub trait CodedMessage: Sized {
    const CODE: u8;

    fn encode(&self, buf: &mut dyn BufMut);

    fn decode(msg_data: &[u8]) -> Result<Self, WireError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Init(InitMessage),
    Hello(HelloMessage),
    World(WorldMessage),
    Disconnect(DisconnectMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    Application(ApplicationMessage),
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Init(_) => InitMessage::CODE,
            Message::Hello(_) => HelloMessage::CODE,
            Message::World(_) => WorldMessage::CODE,
            Message::Disconnect(_) => DisconnectMessage::CODE,
            Message::Ping(_) => PingMessage::CODE,
            Message::Pong(_) => PongMessage::CODE,
            Message::Application(msg) => msg.code,
        }
    }

    pub fn encode_payload(&self, buf: &mut dyn BufMut) {
        match self {
            Message::Init(msg) => msg.encode(buf),
            Message::Hello(msg) => msg.encode(buf),
            Message::World(msg) => msg.encode(buf),
            Message::Disconnect(msg) => msg.encode(buf),
            Message::Ping(msg) => msg.encode(buf),
            Message::Pong(msg) => msg.encode(buf),
            Message::Application(msg) => buf.put_slice(&msg.payload),
        }
    }

    pub fn decode(code: u8, msg_data: &[u8]) -> Result<Message, NetError> {
        match code {
            InitMessage::CODE => Ok(Message::Init(InitMessage::decode(msg_data)?)),
            HelloMessage::CODE => Ok(Message::Hello(HelloMessage::decode(msg_data)?)),
            WorldMessage::CODE => Ok(Message::World(WorldMessage::decode(msg_data)?)),
            DisconnectMessage::CODE => {
                Ok(Message::Disconnect(DisconnectMessage::decode(msg_data)?))
            }
            PingMessage::CODE => Ok(Message::Ping(PingMessage::decode(msg_data)?)),
            PongMessage::CODE => Ok(Message::Pong(PongMessage::decode(msg_data)?)),
            code if is_application_code(code) => Ok(Message::Application(ApplicationMessage {
                code,
                payload: Bytes::copy_from_slice(msg_data),
            })),
            _ => Err(NetError::ProtocolViolation(
                "unassigned framework message code",
            )),
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::Init(_) | Message::Hello(_) | Message::World(_)
        )
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Init(_) => write!(f, "Init"),
            Message::Hello(_) => write!(f, "Hello"),
            Message::World(_) => write!(f, "World"),
            Message::Disconnect(msg) => write!(f, "Disconnect({})", msg.code),
            Message::Ping(_) => write!(f, "Ping"),
            Message::Pong(_) => write!(f, "Pong"),
            Message::Application(msg) => write!(f, "Application({:#04x})", msg.code),
        }
    }
}

/// Reason byte carried by a disconnect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCode {
    DisconnectRequested = 0x00,
    NetworkError = 0x01,
    ProtocolViolation = 0x02,
    BadHandshake = 0x03,
    DuplicatePeer = 0x04,
    TooManyPeers = 0x05,
    HandshakeExpired = 0x06,
    ReadTimeout = 0x07,
    ClientQuitting = 0x08,
    InvalidCode = 0xff,
}

impl Display for DisconnectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectCode::DisconnectRequested => write!(f, "Disconnect Requested"),
            DisconnectCode::NetworkError => write!(f, "TCP Subsystem Error"),
            DisconnectCode::ProtocolViolation => write!(f, "Breach of Protocol"),
            DisconnectCode::BadHandshake => write!(f, "Handshake Validation Failed"),
            DisconnectCode::DuplicatePeer => write!(f, "Already Connected"),
            DisconnectCode::TooManyPeers => write!(f, "Too Many Peers"),
            DisconnectCode::HandshakeExpired => write!(f, "Handshake Expired"),
            DisconnectCode::ReadTimeout => write!(f, "Read Timeout"),
            DisconnectCode::ClientQuitting => write!(f, "Client Quitting"),
            DisconnectCode::InvalidCode => write!(f, "Invalid Disconnect Code"),
        }
    }
}

impl From<u8> for DisconnectCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DisconnectCode::DisconnectRequested,
            0x01 => DisconnectCode::NetworkError,
            0x02 => DisconnectCode::ProtocolViolation,
            0x03 => DisconnectCode::BadHandshake,
            0x04 => DisconnectCode::DuplicatePeer,
            0x05 => DisconnectCode::TooManyPeers,
            0x06 => DisconnectCode::HandshakeExpired,
            0x07 => DisconnectCode::ReadTimeout,
            0x08 => DisconnectCode::ClientQuitting,
            _ => DisconnectCode::InvalidCode,
        }
    }
}

impl From<DisconnectCode> for u8 {
    fn from(value: DisconnectCode) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectMessage {
    pub code: DisconnectCode,
}

impl DisconnectMessage {
    pub fn new(code: DisconnectCode) -> Self {
        Self { code }
    }
}

impl CodedMessage for DisconnectMessage {
    const CODE: u8 = 0x13;

    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(self.code.into());
    }

    fn decode(msg_data: &[u8]) -> Result<Self, WireError> {
        let decoder = Decoder::new(msg_data);
        let (raw, decoder): (u8, _) = decoder.decode_field("code")?;
        decoder.finish()?;
        Ok(Self { code: raw.into() })
    }
}

/// Keep-alive request; carries the sender's clock so the answering PONG can
/// be folded into a round-trip estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    pub timestamp: u64,
}

impl PingMessage {
    pub fn new(timestamp: u64) -> Self {
        Self { timestamp }
    }
}

impl CodedMessage for PingMessage {
    const CODE: u8 = 0x14;

    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf).encode_field(&self.timestamp).finish();
    }

    fn decode(msg_data: &[u8]) -> Result<Self, WireError> {
        let decoder = Decoder::new(msg_data);
        let (timestamp, decoder) = decoder.decode_field("timestamp")?;
        decoder.finish()?;
        Ok(Self { timestamp })
    }
}

/// Keep-alive reply, echoing the PING timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongMessage {
    pub timestamp: u64,
}

impl PongMessage {
    pub fn new(timestamp: u64) -> Self {
        Self { timestamp }
    }
}

impl CodedMessage for PongMessage {
    const CODE: u8 = 0x15;

    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf).encode_field(&self.timestamp).finish();
    }

    fn decode(msg_data: &[u8]) -> Result<Self, WireError> {
        let decoder = Decoder::new(msg_data);
        let (timestamp, decoder) = decoder.decode_field("timestamp")?;
        decoder.finish()?;
        Ok(Self { timestamp })
    }
}

/// An opaque application payload. The opcode selects the registered handler;
/// the payload is delivered after decompression and reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub code: u8,
    pub payload: Bytes,
}

impl ApplicationMessage {
    pub fn new(code: u8, payload: Bytes) -> Self {
        Self { code, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_round_trip() {
        let msg = DisconnectMessage::new(DisconnectCode::DuplicatePeer);
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(DisconnectMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn unknown_disconnect_code_maps_to_invalid() {
        assert_eq!(DisconnectCode::from(0x77), DisconnectCode::InvalidCode);
    }

    #[test]
    fn keepalive_round_trip() {
        let ping = PingMessage::new(1_720_000_000_123);
        let mut buf = Vec::new();
        ping.encode(&mut buf);
        match Message::decode(PingMessage::CODE, &buf).unwrap() {
            Message::Ping(decoded) => assert_eq!(decoded, ping),
            other => panic!("expected ping, got {other}"),
        }
    }

    #[test]
    fn application_codes_pass_through() {
        let payload = Bytes::from_static(b"block body");
        match Message::decode(0x42, &payload).unwrap() {
            Message::Application(msg) => {
                assert_eq!(msg.code, 0x42);
                assert_eq!(msg.payload, payload);
            }
            other => panic!("expected application message, got {other}"),
        }
    }

    #[test]
    fn unassigned_framework_codes_are_rejected() {
        assert!(Message::decode(0x00, &[]).is_err());
        assert!(Message::decode(0x1f, &[]).is_err());
        assert!(Message::decode(0x20, &[]).is_ok());
    }
}
