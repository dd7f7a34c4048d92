//! Hexchain node binary
//!
//! Runs a mesh node over an in-memory ledger seeded with the genesis block.

use std::sync::Arc;

use hexchain_core::{Ed25519Blake3, HexBlock, MemoryChain, ValidatorId, WorldState};
use hexchain_node::{Node, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hexnode=info,hexchain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Hexchain node");

    let config = NodeConfig::from_env()?;

    let genesis = HexBlock::genesis(config.genesis_time, ValidatorId::default());
    let chain = Arc::new(MemoryChain::new(
        config.chain.clone(),
        genesis,
        WorldState::new(),
    ));

    let node = Node::new(config, chain.clone(), chain, Arc::new(Ed25519Blake3));
    node.run().await?;

    Ok(())
}
