//! Hexchain Node
//!
//! Wires the mesh protocol to the HexaProof validator over a caller-supplied
//! ledger. Configuration comes from `HEXNODE_*` environment variables (see
//! [`NodeConfig`]).

mod config;
mod dispatch;
mod error;
mod node;

pub use config::{NodeConfig, DEFAULT_GENESIS_TIME};
pub use dispatch::DispatchReport;
pub use error::{Error, Result};
pub use node::Node;
