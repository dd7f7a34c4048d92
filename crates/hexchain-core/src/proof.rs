//! The HexaProof attached to every header.
//!
//! A proof carries one signature slot per potential parent. Slot `i`
//! belongs to the parent referenced in `parent_hashes[i]` and holds that
//! neighbor's signature over the candidate's seal hash.
//!
//! The proof hash is computed lazily and cached. The value is only built
//! through constructors that return a fresh proof, so the cache can never
//! describe stale contents; [`HexaProof::reset_hash_cache`] drops it
//! explicitly when a caller needs the recomputation to happen again.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::hash::{CanonicalHasher, Hash, SignatureBytes, ValidatorId};
use hexchain_topology::NEIGHBOR_SLOTS;

/// A neighbor's endorsement of a candidate header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborSignature {
    /// Claimed signer; must belong to the proof's validator set.
    pub signer: ValidatorId,
    pub signature: SignatureBytes,
}

/// Consensus proof carried by a [`HexHeader`](crate::HexHeader).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HexaProof {
    neighbor_signatures: [Option<NeighborSignature>; NEIGHBOR_SLOTS],
    #[serde(with = "serde_bytes")]
    state_proof: Vec<u8>,
    #[serde(with = "serde_bytes")]
    mesh_proof: Vec<u8>,
    timestamp: u64,
    validator_set: Vec<ValidatorId>,
    #[serde(skip)]
    hash: OnceLock<Hash>,
}

impl HexaProof {
    /// Build a proof with no signatures yet.
    pub fn new(
        state_proof: Vec<u8>,
        mesh_proof: Vec<u8>,
        timestamp: u64,
        validator_set: Vec<ValidatorId>,
    ) -> Self {
        Self {
            neighbor_signatures: Default::default(),
            state_proof,
            mesh_proof,
            timestamp,
            validator_set,
            hash: OnceLock::new(),
        }
    }

    /// Return a copy of this proof with `slot` filled. Out-of-range slots
    /// are ignored.
    pub fn with_signature(mut self, slot: usize, signature: NeighborSignature) -> Self {
        if let Some(entry) = self.neighbor_signatures.get_mut(slot) {
            *entry = Some(signature);
        }
        self.hash = OnceLock::new();
        self
    }

    /// Return a copy of this proof with a different consensus timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self.hash = OnceLock::new();
        self
    }

    pub fn signature(&self, slot: usize) -> Option<&NeighborSignature> {
        self.neighbor_signatures.get(slot).and_then(Option::as_ref)
    }

    pub fn signatures(&self) -> &[Option<NeighborSignature>; NEIGHBOR_SLOTS] {
        &self.neighbor_signatures
    }

    /// Number of filled signature slots.
    pub fn signature_count(&self) -> usize {
        self.neighbor_signatures.iter().flatten().count()
    }

    pub fn state_proof(&self) -> &[u8] {
        &self.state_proof
    }

    pub fn mesh_proof(&self) -> &[u8] {
        &self.mesh_proof
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn validator_set(&self) -> &[ValidatorId] {
        &self.validator_set
    }

    pub fn is_validator(&self, id: &ValidatorId) -> bool {
        self.validator_set.contains(id)
    }

    /// Identity hash over every field. Computed once, then cached.
    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| self.compute_hash())
    }

    /// Drop the cached hash so the next [`hash`](Self::hash) recomputes it.
    pub fn reset_hash_cache(&mut self) {
        self.hash = OnceLock::new();
    }

    fn compute_hash(&self) -> Hash {
        let mut h = CanonicalHasher::new("hexchain.hexaproof");
        for slot in &self.neighbor_signatures {
            match slot {
                Some(sig) => {
                    h.u8(1).validator(&sig.signer).bytes(sig.signature.as_slice());
                }
                None => {
                    h.u8(0);
                }
            }
        }
        h.bytes(&self.state_proof)
            .bytes(&self.mesh_proof)
            .u64(self.timestamp)
            .u64(self.validator_set.len() as u64);
        for v in &self.validator_set {
            h.validator(v);
        }
        h.finalize()
    }
}

// The hash cache is derived data and takes no part in equality.
impl PartialEq for HexaProof {
    fn eq(&self, other: &Self) -> bool {
        self.neighbor_signatures == other.neighbor_signatures
            && self.state_proof == other.state_proof
            && self.mesh_proof == other.mesh_proof
            && self.timestamp == other.timestamp
            && self.validator_set == other.validator_set
    }
}

impl Eq for HexaProof {}
