//! Node wiring.
//!
//! Architecture:
//! - One [`MeshProtocol`] owning all peer connections
//! - One validation dispatcher draining the protocol's inbound queues
//! - Ledger access only through the `ChainReader` and `ChainWriter`
//!   capabilities handed in by the caller

use std::future::Future;
use std::sync::Arc;

use hexchain_consensus::{build_engine, BlockValidator};
use hexchain_core::{ChainReader, ChainWriter, CryptoProvider};
use hexchain_protocols::{InboundQueues, MeshProtocol};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;

/// A Hexchain mesh node.
pub struct Node {
    config: NodeConfig,
    protocol: Arc<MeshProtocol>,
    dispatcher: Dispatcher,
    queues: InboundQueues,
}

impl Node {
    /// Build the consensus engine, block validator and protocol over the
    /// given ledger.
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainReader>,
        writer: Arc<dyn ChainWriter>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        let engine = build_engine(config.consensus, Arc::clone(&chain), crypto);
        let validator = Arc::new(BlockValidator::new(Arc::clone(&chain), engine));
        let (protocol, queues) =
            MeshProtocol::new(config.protocol.clone(), Arc::clone(&chain), config.position);
        let dispatcher = Dispatcher::new(
            chain,
            writer,
            validator,
            Arc::clone(&protocol),
            config.workers,
        );

        Self {
            config,
            protocol,
            dispatcher,
            queues,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The node's protocol handle, for broadcasting locally produced items
    /// and inspecting peers.
    pub fn protocol(&self) -> Arc<MeshProtocol> {
        Arc::clone(&self.protocol)
    }

    /// Bind the configured P2P address and run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.p2p_addr).await?;
        self.run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
    }

    /// Serve `listener`, dial bootstrap peers and dispatch validation until
    /// `stop` completes, then shut everything down.
    pub async fn run_until<F>(self, listener: TcpListener, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Node {
            config,
            protocol,
            dispatcher,
            queues,
        } = self;

        info!("Hexchain node starting");
        info!("  P2P: {}", listener.local_addr()?);
        info!("  Position: {}", config.position);
        info!("  Network: {}", config.protocol.network_id);
        info!("  Consensus: {}", config.consensus);
        info!("  Genesis: {}", protocol.genesis());

        let (stop_tx, stop_rx) = watch::channel(false);
        let cancel = dispatcher.cancel_signal();
        let dispatch = tokio::spawn(dispatcher.run(queues, stop_rx));
        let server = tokio::spawn(Arc::clone(&protocol).serve(listener));
        let background = protocol.start();

        for addr in &config.bootstrap_peers {
            match protocol.dial(addr.as_str()).await {
                Ok(peer) => info!("Connected to bootstrap peer {} as {}", addr, peer),
                Err(e) => warn!("Bootstrap peer {} unavailable: {}", addr, e),
            }
        }

        stop.await;
        info!("Hexchain node shutting down");

        cancel.cancel();
        let _ = stop_tx.send(true);
        protocol.shutdown().await;

        if let Err(e) = dispatch.await {
            error!("Dispatcher task failed: {}", e);
        }
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("P2P server failed: {}", e),
            Err(e) => error!("P2P server task failed: {}", e),
        }
        for task in background {
            let _ = task.await;
        }
        info!("Hexchain node stopped");
        Ok(())
    }
}
