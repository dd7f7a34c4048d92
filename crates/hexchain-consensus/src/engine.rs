//! The HexaProof header validation pipeline.
//!
//! Stages run strictly in order and the first failure is returned:
//!
//! 1. structure of the parent slots
//! 2. parent existence, ordering and depth
//! 3. mesh topology ([`TopologyValidator`])
//! 4. neighbor-count policy
//! 5. timestamps
//! 6. the HexaProof itself: timestamp, signature coverage and validity

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hexchain_core::{
    CanonicalHasher, ChainReader, CryptoProvider, Hash, HexCoordinate, HexHeader,
    NeighborSignature, NEIGHBOR_SLOTS,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::batch::{verify_batch, BatchVerdict, CancelSignal};
use crate::error::{
    NeighborPolicyError, ParentError, ProofError, StructuralError, TimestampError,
    ValidationError,
};
use crate::topology::TopologyValidator;

/// Verified signatures remembered across headers.
const SIGNATURE_CACHE_CAPACITY: usize = 4096;

/// Consensus strategies a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    #[default]
    HexaProof,
}

impl std::fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusKind::HexaProof => f.write_str("hexaproof"),
        }
    }
}

impl std::str::FromStr for ConsensusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hexaproof" => Ok(ConsensusKind::HexaProof),
            other => Err(format!("unknown consensus engine: {other}")),
        }
    }
}

/// A header validation strategy.
pub trait ConsensusEngine: Send + Sync {
    fn kind(&self) -> ConsensusKind;

    /// Validate one header against the current chain and wall clock.
    fn verify_header(&self, header: &HexHeader) -> Result<(), ValidationError>;

    /// Validate many headers in parallel; verdicts keep input order.
    fn verify_headers(
        &self,
        headers: &[HexHeader],
        workers: usize,
        cancel: &CancelSignal,
    ) -> Vec<BatchVerdict> {
        verify_batch(headers, workers, cancel, |h| self.verify_header(h))
    }
}

/// Build the engine selected by `kind`.
pub fn build_engine(
    kind: ConsensusKind,
    chain: Arc<dyn ChainReader>,
    crypto: Arc<dyn CryptoProvider>,
) -> Arc<dyn ConsensusEngine> {
    match kind {
        ConsensusKind::HexaProof => Arc::new(HexaProofEngine::new(chain, crypto)),
    }
}

/// Bounded set of `(seal, signer, signature)` triples already verified.
struct SignatureCache {
    seen: HashSet<Hash>,
    order: VecDeque<Hash>,
}

impl SignatureCache {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn key(seal: &Hash, sig: &NeighborSignature) -> Hash {
        let mut h = CanonicalHasher::new("hexchain.sigcache");
        h.hash(seal).validator(&sig.signer).bytes(sig.signature.as_slice());
        h.finalize()
    }

    fn contains(&self, key: &Hash) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: Hash) {
        if !self.seen.insert(key) {
            return;
        }
        self.order.push_back(key);
        if self.order.len() > SIGNATURE_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

/// Stateless header validator backed by a ledger reader and crypto provider.
pub struct HexaProofEngine {
    chain: Arc<dyn ChainReader>,
    crypto: Arc<dyn CryptoProvider>,
    sig_cache: Mutex<SignatureCache>,
}

impl HexaProofEngine {
    pub fn new(chain: Arc<dyn ChainReader>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            chain,
            crypto,
            sig_cache: Mutex::new(SignatureCache::new()),
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainReader> {
        &self.chain
    }

    /// Validate `header` as if the local clock read `now` (unix seconds).
    pub fn verify_header_at(&self, header: &HexHeader, now: u64) -> Result<(), ValidationError> {
        let hash = header.hash();

        check_structure(header)?;
        let parents = self.resolve_parents(header, &hash)?;
        TopologyValidator::validate(header, &hash, &parents)?;
        self.check_neighbor_policy(header)?;
        self.check_timestamp(header, &parents, now)?;
        self.check_proof(header)?;

        debug!(%hash, number = header.number, position = %header.position, "header accepted");
        Ok(())
    }

    fn resolve_parents(
        &self,
        header: &HexHeader,
        own_hash: &Hash,
    ) -> Result<Vec<(usize, HexHeader)>, ParentError> {
        let max_gap = self.chain.config().max_depth_gap;
        let mut resolved = Vec::with_capacity(header.parent_slot_count());

        for (slot, hash) in header.parents() {
            // Reported as a topology error in the next stage.
            if hash == *own_hash {
                continue;
            }
            let parent = self
                .chain
                .header_by_hash(&hash)
                .ok_or(ParentError::Unknown { slot, hash })?;

            if parent.number >= header.number {
                return Err(ParentError::NotOlder {
                    slot,
                    parent_number: parent.number,
                    number: header.number,
                });
            }
            let gap = header.number - parent.number;
            if gap > max_gap {
                return Err(ParentError::TooDeep { slot, gap, max: max_gap });
            }
            resolved.push((slot, parent));
        }
        Ok(resolved)
    }

    fn check_neighbor_policy(&self, header: &HexHeader) -> Result<(), NeighborPolicyError> {
        let config = self.chain.config();
        let count = header.neighbor_count;
        if count > config.max_neighbors {
            return Err(NeighborPolicyError::TooMany {
                count,
                max: config.max_neighbors,
            });
        }
        let required = config.required_neighbors(header.number);
        if !header.is_genesis() && count < required {
            return Err(NeighborPolicyError::BelowFinality { count, required });
        }
        Ok(())
    }

    fn check_timestamp(
        &self,
        header: &HexHeader,
        parents: &[(usize, HexHeader)],
        now: u64,
    ) -> Result<(), TimestampError> {
        if let Some(parent_time) = parents.iter().map(|(_, p)| p.time).max() {
            if header.time <= parent_time {
                return Err(TimestampError::NotAfterParent {
                    time: header.time,
                    parent_time,
                });
            }
        }
        let limit = now.saturating_add(self.chain.config().max_future_skew_secs);
        if header.time > limit {
            return Err(TimestampError::TooFarInFuture {
                time: header.time,
                limit,
            });
        }
        Ok(())
    }

    fn check_proof(&self, header: &HexHeader) -> Result<(), ProofError> {
        let proof = &header.proof;

        if proof.timestamp() == 0 {
            return Err(ProofError::MissingTimestamp);
        }
        if proof.timestamp() < header.time {
            return Err(ProofError::BeforeHeader {
                proof: proof.timestamp(),
                header: header.time,
            });
        }

        // The validator owning each parent slot is that parent's author.
        let mut owners = [None; NEIGHBOR_SLOTS];
        for (slot, hash) in header.parents() {
            let parent = self
                .chain
                .header_by_hash(&hash)
                .ok_or(ProofError::UnknownParent { hash })?;
            owners[slot] = Some(parent.author);
        }

        let got = proof.signature_count();
        let need = header.neighbor_count as usize;
        if got < need {
            return Err(ProofError::InsufficientSignatures { got, need });
        }
        for (slot, _) in header.parents() {
            if proof.signature(slot).is_none() {
                return Err(ProofError::MissingSignature { slot });
            }
        }

        let seal = header.seal_hash();
        for slot in 0..NEIGHBOR_SLOTS {
            let Some(sig) = proof.signature(slot) else {
                continue;
            };
            if !proof.is_validator(&sig.signer) {
                return Err(ProofError::UnknownSigner {
                    slot,
                    signer: sig.signer,
                });
            }
            if let Some(owner) = owners[slot] {
                if sig.signer != owner {
                    return Err(ProofError::NotParentAuthor {
                        slot,
                        signer: sig.signer,
                        author: owner,
                    });
                }
            }
            if !self.signature_valid(&seal, sig) {
                return Err(ProofError::InvalidSignature {
                    slot,
                    signer: sig.signer,
                });
            }
        }
        Ok(())
    }

    fn signature_valid(&self, seal: &Hash, sig: &NeighborSignature) -> bool {
        let key = SignatureCache::key(seal, sig);
        if self.sig_cache.lock().contains(&key) {
            trace!(signer = %sig.signer, "signature cache hit");
            return true;
        }
        let valid = self.crypto.verify(seal, &sig.signature, &sig.signer);
        if valid {
            self.sig_cache.lock().insert(key);
        }
        valid
    }
}

impl ConsensusEngine for HexaProofEngine {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::HexaProof
    }

    fn verify_header(&self, header: &HexHeader) -> Result<(), ValidationError> {
        self.verify_header_at(header, unix_now())
    }
}

/// Stage 1: slot and count consistency.
fn check_structure(header: &HexHeader) -> Result<(), StructuralError> {
    let declared = header.neighbor_count;
    if declared as usize > NEIGHBOR_SLOTS {
        return Err(StructuralError::CountOutOfRange(declared));
    }
    let actual = header.parent_slot_count();
    if actual != declared as usize {
        return Err(StructuralError::CountMismatch { declared, actual });
    }
    if header.is_genesis() {
        if declared != 0 {
            return Err(StructuralError::GenesisWithParents(declared));
        }
        if header.position != HexCoordinate::ORIGIN {
            return Err(StructuralError::GenesisOffOrigin(header.position));
        }
    } else if declared == 0 {
        return Err(StructuralError::Orphan);
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
