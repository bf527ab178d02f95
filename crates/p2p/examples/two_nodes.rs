//! Runs two nodes in one process, connects them and exchanges a message.
//!
//! ```sh
//! cargo run --example two_nodes
//! ```

use bytes::Bytes;
use std::sync::Arc;
use xdag_p2p::{MessageHandler, NetConfig, NetworkService, SessionHandle};

const BLOCK_OPCODE: u8 = 0x20;

struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn on_connect(&self, peer: &SessionHandle) {
        println!("connected to {:#x} ({})", peer.node_id(), peer.info().client_id);
    }

    fn on_message(&self, peer: &SessionHandle, code: u8, payload: Bytes) {
        println!(
            "received opcode {code:#04x} from {:#x}: {:?}",
            peer.node_id(),
            payload
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;

    let mut alpha = NetworkService::new(NetConfig {
        port: 0,
        min_connections: 0,
        data_dir: dir_a.path().to_path_buf(),
        ..Default::default()
    })?;
    alpha.start().await?;

    let mut beta = NetworkService::new(NetConfig {
        port: 0,
        min_connections: 0,
        data_dir: dir_b.path().to_path_buf(),
        ..Default::default()
    })?;
    beta.register_handler(&[BLOCK_OPCODE], Arc::new(EchoHandler))?;
    beta.start().await?;

    let alpha_node = alpha.local_node().expect("alpha is running");
    println!("alpha listening as {}", alpha_node.node_url());

    beta.connect(alpha_node).await?;

    // Give the handshake a moment, then push one payload beta-ward.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    alpha
        .send_message(beta.node_id(), BLOCK_OPCODE, Bytes::from_static(b"hello"))
        .await?;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    beta.stop().await;
    alpha.stop().await;
    Ok(())
}
