//! Hexchain Core Data Model
//!
//! Headers, proofs and blocks of a ledger whose blocks form a
//! bounded-degree mesh instead of a linear chain.
//!
//! # Multi-Parent Headers
//!
//! A [`HexHeader`] sits on a cell of the hexagonal grid and references up
//! to six parents, one per adjacent cell. The header's identity is a
//! blake3 hash over a canonical encoding of all its fields.
//!
//! # Proofs
//!
//! Each header carries a [`HexaProof`]: one signature slot per parent,
//! filled by that parent's validator over the header's seal hash.
//!
//! # Capabilities
//!
//! Validation consumes two capabilities without owning them: a
//! [`ChainReader`] for ledger lookups and a [`CryptoProvider`] for hashing
//! and signature checks. [`MemoryChain`] and [`Ed25519Blake3`] are the
//! in-process implementations.

mod block;
mod chain;
mod config;
mod crypto;
mod error;
mod hash;
mod header;
mod proof;
mod state;

pub use block::{transactions_root, withdrawals_root, HexBlock, Transaction, Withdrawal};
pub use chain::{ChainReader, ChainWriter, MemoryChain};
pub use config::{ChainConfig, ConflictPolicy};
pub use crypto::{CryptoProvider, Ed25519Blake3, LocalSigner};
pub use error::{Error, Result};
pub use hash::{ordered_root, CanonicalHasher, Hash, SignatureBytes, ValidatorId};
pub use header::{HexHeader, GENESIS_GAS_LIMIT};
pub use proof::{HexaProof, NeighborSignature};
pub use state::{StateDelta, WorldState};

pub use hexchain_topology::{Direction, HexCoordinate, NEIGHBOR_SLOTS};
