//! Nodes talking over real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use hexchain_consensus::fixtures::MeshFixture;
use hexchain_core::{ChainConfig, ChainReader, HexCoordinate};
use hexchain_node::{Node, NodeConfig};
use hexchain_protocols::{MeshProtocol, NetworkError, ProtocolConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

fn relaxed() -> ChainConfig {
    ChainConfig {
        min_neighbors: 1,
        ..ChainConfig::default()
    }
}

fn node_config(position: HexCoordinate, bootstrap: Vec<String>) -> NodeConfig {
    NodeConfig {
        position,
        bootstrap_peers: bootstrap,
        workers: 2,
        ..NodeConfig::default()
    }
}

struct Running {
    addr: String,
    protocol: Arc<MeshProtocol>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<hexchain_node::Result<()>>,
}

async fn spawn_node(fx: &MeshFixture, config: NodeConfig) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let node = Node::new(config, fx.chain.clone(), fx.chain.clone(), fx.crypto.clone());
    let protocol = node.protocol();
    let (stop, stopped) = oneshot::channel();
    let task = tokio::spawn(node.run_until(listener, async {
        let _ = stopped.await;
    }));
    Running {
        addr,
        protocol,
        stop,
        task,
    }
}

impl Running {
    async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_node_catches_up_from_its_bootstrap_peer() {
    let source = MeshFixture::with_config(relaxed());
    let mut tip = source.genesis;
    let mut line = Vec::new();
    for q in 1..=4 {
        tip = source.extend(HexCoordinate::new(q, 0), &[tip]);
        line.push(tip);
    }

    let fresh = MeshFixture::with_config(relaxed());
    assert_eq!(fresh.genesis, source.genesis);

    let a = spawn_node(&source, node_config(HexCoordinate::ORIGIN, Vec::new())).await;
    let b = spawn_node(&fresh, node_config(HexCoordinate::new(1, 0), vec![a.addr.clone()])).await;

    tokio::time::timeout(WAIT, async {
        while !line.iter().all(|h| fresh.chain.has_block(h)) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("fresh node never caught up");

    assert_eq!(fresh.chain.current_header().hash(), tip);
    for (i, hash) in line.iter().enumerate() {
        assert!(fresh.chain.has_block_and_state(hash, i as u64 + 1));
    }
    assert_eq!(a.protocol.peer_count().await, 1);
    assert_eq!(b.protocol.neighbors().await.len(), 1);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn mismatched_network_is_refused() {
    let fx = MeshFixture::new();
    let a = spawn_node(&fx, node_config(HexCoordinate::ORIGIN, Vec::new())).await;

    let stranger = MeshFixture::new();
    let (protocol, _queues) = MeshProtocol::new(
        ProtocolConfig::default().with_network_id(9),
        stranger.reader(),
        HexCoordinate::new(0, 1),
    );
    let err = protocol.dial(a.addr.as_str()).await.unwrap_err();
    assert!(matches!(err, NetworkError::NetworkMismatch { ours: 9, theirs: 1337 }));
    assert_eq!(a.protocol.peer_count().await, 0);
    assert_eq!(protocol.stats().handshake_failures, 1);

    a.stop().await;
}

#[tokio::test]
async fn shutdown_disconnects_peers() {
    let fx = MeshFixture::new();
    let a = spawn_node(&fx, node_config(HexCoordinate::ORIGIN, Vec::new())).await;
    let b = spawn_node(&MeshFixture::new(), node_config(HexCoordinate::new(0, 1), vec![a.addr.clone()])).await;

    tokio::time::timeout(WAIT, async {
        while a.protocol.peer_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let b_protocol = Arc::clone(&b.protocol);
    b.stop().await;
    assert_eq!(b_protocol.peer_count().await, 0);
    tokio::time::timeout(WAIT, async {
        while a.protocol.peer_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("remote side never noticed the disconnect");

    a.stop().await;
}
