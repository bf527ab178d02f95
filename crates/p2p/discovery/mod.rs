pub mod lookup;
pub mod messages;
pub mod server;

pub use server::{DISCOVERY_CYCLE_MS, Discovery, DiscoveryError, PING_TIMEOUT_MS};
