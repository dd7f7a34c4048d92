//! Hexchain Consensus
//!
//! Validation of multi-parent mesh headers and reconciliation of their
//! parents' states.
//!
//! # Header Validation
//!
//! [`HexaProofEngine`] runs the staged pipeline described in [`engine`]:
//! structure, parents, topology, neighbor policy, timestamps and finally
//! the neighbor signatures of the [`hexchain_core::HexaProof`]. Batches of
//! headers are verified on a rayon worker pool with cooperative
//! cancellation ([`CancelSignal`]).
//!
//! # State Reconciliation
//!
//! [`StateResolver`] merges the post-states of a block's parents in a
//! deterministic order and settles write conflicts per the chain's
//! [`hexchain_core::ConflictPolicy`].
//!
//! # Blocks
//!
//! [`BlockValidator`] ties both together and adds body commitment checks.

mod batch;
pub mod engine;
mod error;
mod resolver;
mod topology;
mod validator;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub use batch::{verify_batch, BatchVerdict, CancelSignal};
pub use engine::{build_engine, ConsensusEngine, ConsensusKind, HexaProofEngine};
pub use error::{
    BodyError, ErrorCategory, NeighborPolicyError, ParentError, ProofError, StateError,
    StructuralError, TimestampError, TopologyError, ValidationError,
};
pub use resolver::{ConflictLog, ConflictRecord, MergeOutcome, StateResolver};
pub use topology::TopologyValidator;
pub use validator::{validate_body, BlockValidator};
