use crate::wire::{Decoder, Encoder, WireDecode, WireEncode, WireError};
use bytes::BufMut;
use ethereum_types::H160;
use serde::{Deserialize, Serialize, ser::Serializer};
use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};
use thiserror::Error;

/// 160-bit node identity, derived from the node's long-term signing key.
/// See [`crate::utils::node_id_from_public_key`].
pub type NodeId = H160;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Lifecycle state of a routing-table entry.
///
/// A node is created as `Discovered`, becomes `Alive` on its first PONG and
/// `Dead` once its reputation falls below the dead threshold or it stops
/// answering pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Discovered,
    Alive,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.tcp_port)
    }

    /// The transport is IPv4-only; v6-mapped addresses are unmapped and
    /// anything else encodes as the unspecified address.
    fn ipv4(&self) -> Ipv4Addr {
        match self.ip.to_canonical() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl WireEncode for Endpoint {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.ipv4())
            .encode_field(&self.udp_port)
            .encode_field(&self.tcp_port)
            .finish();
    }
}

impl WireDecode for Endpoint {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let decoder = Decoder::new(input);
        let (ip, decoder): (Ipv4Addr, _) = decoder.decode_field("ip")?;
        let (udp_port, decoder) = decoder.decode_field("udp_port")?;
        let (tcp_port, decoder) = decoder.decode_field("tcp_port")?;
        let endpoint = Endpoint {
            ip: IpAddr::V4(ip),
            udp_port,
            tcp_port,
        };
        Ok((endpoint, decoder.finish_unchecked()))
    }
}

/// A remote node as carried in discovery messages and seed configuration:
/// its identity plus the endpoint it was last seen at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub node_id: NodeId,
}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, node_id: NodeId) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            node_id,
        }
    }

    pub fn from_endpoint(endpoint: Endpoint, node_id: NodeId) -> Self {
        Self {
            ip: endpoint.ip,
            udp_port: endpoint.udp_port,
            tcp_port: endpoint.tcp_port,
            node_id,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            ip: self.ip,
            udp_port: self.udp_port,
            tcp_port: self.tcp_port,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.tcp_port)
    }

    /// Parses the textual form used for seed-node configuration:
    /// `xdnode://<node-id-hex>@<ip>:<port>[?discport=<port>]`.
    pub fn from_node_url(url: &str) -> Result<Self, NodeError> {
        let Some(rest) = url.strip_prefix("xdnode://") else {
            return Err(NodeError::InvalidFormat(
                "node url must start with xdnode://".into(),
            ));
        };
        let (id_part, address_part) = rest.split_once('@').ok_or_else(|| {
            NodeError::InvalidFormat("node url is missing the @<ip>:<port> part".into())
        })?;

        let node_id = NodeId::from_str(id_part)
            .map_err(|_| NodeError::ParseError("Could not parse node id".into()))?;

        // Strip `?discport=` if present
        let (address_part, discport) = match address_part.split_once('?') {
            Some((address, query)) => {
                let discport = query
                    .strip_prefix("discport=")
                    .ok_or_else(|| {
                        NodeError::InvalidFormat("unknown node url query parameter".into())
                    })?
                    .parse()
                    .map_err(|_| NodeError::ParseError("Could not parse discport".into()))?;
                (address, Some(discport))
            }
            None => (address_part, None),
        };

        let socket_address: SocketAddr = address_part
            .parse()
            .map_err(|_| NodeError::ParseError("Could not parse socket address".into()))?;

        Ok(Self::new(
            socket_address.ip(),
            discport.unwrap_or_else(|| socket_address.port()),
            socket_address.port(),
            node_id,
        ))
    }

    pub fn node_url(&self) -> String {
        let node_id = hex::encode(self.node_id);
        if self.udp_port != self.tcp_port {
            format!(
                "xdnode://{node_id}@{}:{}?discport={}",
                self.ip, self.tcp_port, self.udp_port
            )
        } else {
            format!("xdnode://{node_id}@{}:{}", self.ip, self.tcp_port)
        }
    }
}

impl FromStr for Node {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_node_url(s)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#x}({}:{})",
            self.node_id, self.ip, self.tcp_port
        )
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Node::from_str(&<String>::deserialize(deserializer)?)
            .map_err(|e| serde::de::Error::custom(format!("{e}")))
    }
}

impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.node_url())
    }
}

impl WireEncode for Node {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.node_id)
            .encode_field(&self.endpoint())
            .finish();
    }
}

impl WireDecode for Node {
    fn decode_unfinished(input: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let decoder = Decoder::new(input);
        let (node_id, decoder) = decoder.decode_field("node_id")?;
        let (endpoint, decoder): (Endpoint, _) = decoder.decode_field("endpoint")?;
        Ok((
            Node::from_endpoint(endpoint, node_id),
            decoder.finish_unchecked(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> NodeId {
        NodeId::from_slice(&[0xab; 20])
    }

    #[test]
    fn node_url_round_trip() {
        let node = Node::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 8001, 8001, test_id());
        let url = node.node_url();
        assert_eq!(Node::from_node_url(&url).unwrap(), node);
    }

    #[test]
    fn node_url_with_discport() {
        let node = Node::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 8002, 8001, test_id());
        let url = node.node_url();
        assert!(url.ends_with("?discport=8002"));
        assert_eq!(Node::from_node_url(&url).unwrap(), node);
    }

    #[test]
    fn node_url_rejects_other_schemes() {
        assert!(Node::from_node_url("enode://aa@127.0.0.1:30303").is_err());
        assert!(Node::from_node_url("xdnode://nothex@127.0.0.1:8001").is_err());
    }

    #[test]
    fn node_wire_round_trip() {
        let node = Node::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 3)), 9, 10, test_id());
        let encoded = node.encode_to_vec();
        assert_eq!(Node::decode(&encoded).unwrap(), node);
    }
}
