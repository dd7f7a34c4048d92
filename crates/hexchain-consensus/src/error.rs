//! Validation error taxonomy.
//!
//! Each pipeline stage has its own error enum; [`ValidationError`] wraps
//! them so callers can match on the stage or just ask for the
//! [`ErrorCategory`].

use hexchain_core::{Hash, HexCoordinate, ValidatorId};
use thiserror::Error;

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Structural,
    UnknownParent,
    ParentOrdering,
    Topology,
    NeighborPolicy,
    Timestamp,
    Proof,
    Body,
    StateConflict,
    StateUnavailable,
    KnownBlock,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Structural => "structural",
            ErrorCategory::UnknownParent => "unknown-parent",
            ErrorCategory::ParentOrdering => "parent-ordering",
            ErrorCategory::Topology => "topology",
            ErrorCategory::NeighborPolicy => "neighbor-policy",
            ErrorCategory::Timestamp => "timestamp",
            ErrorCategory::Proof => "proof",
            ErrorCategory::Body => "body",
            ErrorCategory::StateConflict => "state-conflict",
            ErrorCategory::StateUnavailable => "state-unavailable",
            ErrorCategory::KnownBlock => "known-block",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("neighbor count {0} exceeds 6")]
    CountOutOfRange(u8),

    #[error("neighbor count mismatch: declared {declared}, filled slots {actual}")]
    CountMismatch { declared: u8, actual: usize },

    #[error("genesis must have zero neighbors, declares {0}")]
    GenesisWithParents(u8),

    #[error("genesis must sit at the origin, found {0}")]
    GenesisOffOrigin(HexCoordinate),

    #[error("non-genesis block has no parents")]
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParentError {
    #[error("unknown parent {hash} in slot {slot}")]
    Unknown { slot: usize, hash: Hash },

    #[error("parent in slot {slot} has number {parent_number}, not below {number}")]
    NotOlder {
        slot: usize,
        parent_number: u64,
        number: u64,
    },

    #[error("parent in slot {slot} is {gap} blocks deep, max {max}")]
    TooDeep { slot: usize, gap: u64, max: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("block references itself in slot {slot}")]
    SelfReference { slot: usize },

    #[error("parent {hash} referenced more than once")]
    DuplicateParent { hash: Hash },

    #[error("parent {parent} references the candidate")]
    Cycle { parent: Hash },

    #[error("parent in slot {slot} at {parent} is not adjacent to {candidate}")]
    NonAdjacentParent {
        slot: usize,
        parent: HexCoordinate,
        candidate: HexCoordinate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NeighborPolicyError {
    #[error("too many neighbors: {count} > max {max}")]
    TooMany { count: u8, max: u8 },

    #[error("insufficient neighbors for finality: {count} < {required}")]
    BelowFinality { count: u8, required: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("timestamp {time} not after parent timestamp {parent_time}")]
    NotAfterParent { time: u64, parent_time: u64 },

    #[error("timestamp {time} too far in future, limit {limit}")]
    TooFarInFuture { time: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("missing proof timestamp")]
    MissingTimestamp,

    #[error("proof timestamp {proof} before block timestamp {header}")]
    BeforeHeader { proof: u64, header: u64 },

    #[error("proof references unknown parent {hash}")]
    UnknownParent { hash: Hash },

    #[error("insufficient signatures: got {got}, need {need}")]
    InsufficientSignatures { got: usize, need: usize },

    #[error("no signature for declared neighbor in slot {slot}")]
    MissingSignature { slot: usize },

    #[error("signer {signer} in slot {slot} is not in the validator set")]
    UnknownSigner { slot: usize, signer: ValidatorId },

    #[error("slot {slot} signed by {signer}, but the parent was authored by {author}")]
    NotParentAuthor {
        slot: usize,
        signer: ValidatorId,
        author: ValidatorId,
    },

    #[error("invalid signature from {signer} in slot {slot}")]
    InvalidSignature { slot: usize, signer: ValidatorId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    #[error("transaction root mismatch: got {got}, want {want}")]
    TxRootMismatch { got: Hash, want: Hash },

    #[error("missing withdrawals in block body")]
    MissingWithdrawals,

    #[error("withdrawals root mismatch: got {got}, want {want}")]
    WithdrawalsRootMismatch { got: Hash, want: Hash },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("no header for parent {hash}")]
    MissingParent { hash: Hash },

    #[error("no state for block {hash}")]
    MissingState { hash: Hash },

    #[error("parents share no ancestor within {searched} headers")]
    NoCommonAncestor { searched: usize },

    #[error("merged state root {computed} does not match declared {declared}")]
    RootMismatch { computed: Hash, declared: Hash },
}

/// Why a header or block was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("structural: {0}")]
    Structural(#[from] StructuralError),

    #[error("parent: {0}")]
    Parent(#[from] ParentError),

    #[error("topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("neighbor policy: {0}")]
    NeighborPolicy(#[from] NeighborPolicyError),

    #[error("timestamp: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("proof: {0}")]
    Proof(#[from] ProofError),

    #[error("body: {0}")]
    Body(#[from] BodyError),

    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("block {0} already known")]
    KnownBlock(Hash),
}

impl ValidationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ValidationError::Structural(_) => ErrorCategory::Structural,
            ValidationError::Parent(ParentError::Unknown { .. }) => ErrorCategory::UnknownParent,
            ValidationError::Parent(_) => ErrorCategory::ParentOrdering,
            ValidationError::Topology(_) => ErrorCategory::Topology,
            ValidationError::NeighborPolicy(_) => ErrorCategory::NeighborPolicy,
            ValidationError::Timestamp(_) => ErrorCategory::Timestamp,
            ValidationError::Proof(_) => ErrorCategory::Proof,
            ValidationError::Body(_) => ErrorCategory::Body,
            ValidationError::State(StateError::RootMismatch { .. }) => ErrorCategory::StateConflict,
            ValidationError::State(_) => ErrorCategory::StateUnavailable,
            ValidationError::KnownBlock(_) => ErrorCategory::KnownBlock,
        }
    }

    /// True when the same candidate may pass after the node learns more,
    /// i.e. once a missing parent has been fetched.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::UnknownParent | ErrorCategory::StateUnavailable
        )
    }

    /// True when the sender supplied provably bad consensus data.
    pub fn implicates_sender(&self) -> bool {
        matches!(self.category(), ErrorCategory::Proof)
    }

    /// Hash of the missing parent, if this is an unknown-parent rejection.
    pub fn missing_parent(&self) -> Option<Hash> {
        match self {
            ValidationError::Parent(ParentError::Unknown { hash, .. }) => Some(*hash),
            _ => None,
        }
    }

    /// The block whose arrival may let a retryable rejection pass: a
    /// missing parent header, or a parent whose state is not yet stored.
    pub fn waiting_on(&self) -> Option<Hash> {
        match self {
            ValidationError::Parent(ParentError::Unknown { hash, .. })
            | ValidationError::State(StateError::MissingParent { hash })
            | ValidationError::State(StateError::MissingState { hash }) => Some(*hash),
            _ => None,
        }
    }
}
