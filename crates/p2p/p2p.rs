//! # xdag-p2p
//!
//! Peer-to-peer networking stack for an XDAG node.
//!
//! ## Overview
//!
//! This crate implements the networking core:
//! - **Discovery**: Kademlia node discovery over signed UDP datagrams
//! - **Transport**: authenticated TCP sessions behind a chunking,
//!   compressing, self-resynchronizing frame codec
//! - **Pool**: a connection manager that keeps the peer set between its
//!   configured bounds under hostile network conditions
//! - **Accounting**: persisted per-node reputation and a graduated IP ban
//!   table
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       NetworkService                         │
//! │  ┌─────────────┐  ┌───────────────────┐  ┌───────────────┐   │
//! │  │  Discovery  │  │ ConnectionManager │  │  Application  │   │
//! │  │  (UDP/Kad)  │→ │  (TCP sessions)   │→ │   handlers    │   │
//! │  └─────────────┘  └───────────────────┘  └───────────────┘   │
//! │        │                   │                                 │
//! │  ┌───────────┐     ┌───────────────┐                         │
//! │  │ Kademlia  │     │ BanList       │                         │
//! │  │ + scores  │     │ + sessions    │                         │
//! │  └───────────┘     └───────────────┘                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use xdag_p2p::{NetConfig, NetworkService};
//!
//! let mut service = NetworkService::new(NetConfig::default())?;
//! service.register_handler(&[0x20], my_handler)?;
//! service.start().await?;
//! ```

pub mod ban;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod kademlia;
pub mod manager;
pub mod message;
pub mod network;
pub mod reputation;
pub mod session;
pub mod types;
pub mod utils;
pub mod wire;

pub use ban::{BanList, BanReason, BanRecord};
pub use config::NetConfig;
pub use error::NetError;
pub use message::DisconnectCode;
pub use network::{MessageHandler, NetworkError, NetworkService, NodeInfo};
pub use session::SessionHandle;
pub use types::{Endpoint, Node, NodeId, NodeState};
