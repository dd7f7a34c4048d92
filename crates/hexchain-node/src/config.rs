//! Node configuration.
//!
//! Read from `HEXNODE_*` environment variables; anything unset takes its
//! default, anything set but unparsable is an error.
//!
//! | variable | default |
//! |---|---|
//! | `HEXNODE_P2P_ADDR` | `0.0.0.0:30303` |
//! | `HEXNODE_BOOTSTRAP_PEERS` | none (comma separated `host:port`) |
//! | `HEXNODE_NETWORK_ID` | `1337` |
//! | `HEXNODE_POSITION` | `0,0` (axial `q,r`) |
//! | `HEXNODE_CHAIN_CONFIG` | built-in [`ChainConfig`] (JSON file path) |
//! | `HEXNODE_CONSENSUS` | `hexaproof` |
//! | `HEXNODE_WORKERS` | available parallelism |
//! | `HEXNODE_GENESIS_TIME` | `1700000000` |

use std::net::SocketAddr;
use std::str::FromStr;

use hexchain_consensus::ConsensusKind;
use hexchain_core::{ChainConfig, HexCoordinate};
use hexchain_protocols::ProtocolConfig;

use crate::error::{Error, Result};

pub const DEFAULT_GENESIS_TIME: u64 = 1_700_000_000;

/// Configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// P2P listen address
    pub p2p_addr: SocketAddr,

    /// Peers dialed at startup
    pub bootstrap_peers: Vec<String>,

    /// This node's cell on the grid
    pub position: HexCoordinate,

    pub chain: ChainConfig,
    pub consensus: ConsensusKind,
    pub protocol: ProtocolConfig,

    /// Threads used for batch header verification
    pub workers: usize,

    /// Timestamp of the locally built genesis block
    pub genesis_time: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            p2p_addr: SocketAddr::from(([0, 0, 0, 0], 30303)),
            bootstrap_peers: Vec::new(),
            position: HexCoordinate::ORIGIN,
            chain: ChainConfig::default(),
            consensus: ConsensusKind::default(),
            protocol: ProtocolConfig::default(),
            workers: default_workers(),
            genesis_time: DEFAULT_GENESIS_TIME,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl NodeConfig {
    /// Create config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HEXNODE_P2P_ADDR") {
            config.p2p_addr = parse("HEXNODE_P2P_ADDR", &addr)?;
        }

        config.bootstrap_peers = lookup("HEXNODE_BOOTSTRAP_PEERS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(id) = lookup("HEXNODE_NETWORK_ID") {
            config.protocol.network_id = parse("HEXNODE_NETWORK_ID", &id)?;
        }

        if let Some(pos) = lookup("HEXNODE_POSITION") {
            config.position = parse_position(&pos)?;
        }

        if let Some(path) = lookup("HEXNODE_CHAIN_CONFIG") {
            config.chain = ChainConfig::from_file(&path)?;
        }

        if let Some(kind) = lookup("HEXNODE_CONSENSUS") {
            config.consensus = kind.parse().map_err(|reason| Error::InvalidEnv {
                var: "HEXNODE_CONSENSUS",
                value: kind.clone(),
                reason,
            })?;
        }

        if let Some(workers) = lookup("HEXNODE_WORKERS") {
            config.workers = parse("HEXNODE_WORKERS", &workers)?;
            if config.workers == 0 {
                return Err(Error::InvalidEnv {
                    var: "HEXNODE_WORKERS",
                    value: workers,
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        if let Some(time) = lookup("HEXNODE_GENESIS_TIME") {
            config.genesis_time = parse("HEXNODE_GENESIS_TIME", &time)?;
        }

        Ok(config)
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::InvalidEnv {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `q,r` axial coordinates.
fn parse_position(value: &str) -> Result<HexCoordinate> {
    let invalid = |reason: &str| Error::InvalidEnv {
        var: "HEXNODE_POSITION",
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let (q, r) = value.split_once(',').ok_or_else(|| invalid("expected q,r"))?;
    let q: i64 = q.trim().parse().map_err(|_| invalid("q is not an integer"))?;
    let r: i64 = r.trim().parse().map_err(|_| invalid("r is not an integer"))?;
    Ok(HexCoordinate::new(q, r))
}
