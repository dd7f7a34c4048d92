//! Signed mesh ledgers for tests.
//!
//! Every grid cell has a deterministic validator key, so a fixture can sign
//! any child on behalf of its parents' authors without tracking keys.

use std::sync::Arc;

use hexchain_core::{
    CanonicalHasher, ChainConfig, ChainReader, Direction, Ed25519Blake3, Hash, HexBlock,
    HexCoordinate, HexHeader, HexaProof, LocalSigner, MemoryChain, NeighborSignature,
    WorldState,
};

use crate::engine::HexaProofEngine;
use crate::resolver::StateResolver;

/// Genesis timestamp used by every fixture.
pub const GENESIS_TIME: u64 = 1_700_000_000;

/// Validator key owning the cell at `position`.
pub fn signer_at(position: HexCoordinate) -> LocalSigner {
    let mut h = CanonicalHasher::new("hexchain.fixture.signer");
    h.coordinate(&position);
    LocalSigner::from_seed(h.finalize().0)
}

/// An in-memory ledger plus helpers for growing it with valid blocks.
pub struct MeshFixture {
    pub chain: Arc<MemoryChain>,
    pub crypto: Arc<Ed25519Blake3>,
    pub genesis: Hash,
}

impl Default for MeshFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshFixture {
    pub fn new() -> Self {
        Self::with_config(ChainConfig::default())
    }

    pub fn with_config(config: ChainConfig) -> Self {
        Self::with_genesis_state(config, WorldState::new())
    }

    pub fn with_genesis_state(config: ChainConfig, state: WorldState) -> Self {
        let genesis = HexBlock::genesis(GENESIS_TIME, signer_at(HexCoordinate::ORIGIN).id());
        let hash = genesis.hash();
        Self {
            chain: Arc::new(MemoryChain::new(config, genesis, state)),
            crypto: Arc::new(Ed25519Blake3),
            genesis: hash,
        }
    }

    pub fn reader(&self) -> Arc<dyn ChainReader> {
        self.chain.clone()
    }

    pub fn engine(&self) -> HexaProofEngine {
        HexaProofEngine::new(self.reader(), self.crypto.clone())
    }

    pub fn resolver(&self) -> StateResolver {
        StateResolver::new(self.reader())
    }

    pub fn header(&self, hash: &Hash) -> HexHeader {
        self.chain
            .header_by_hash(hash)
            .unwrap_or_else(|| panic!("fixture has no header {hash}"))
    }

    /// Unsigned child of `parents` at `position`.
    ///
    /// Adjacent parents go in their direction's slot, anything else in the
    /// first free slot. Number and time are one past the highest parent,
    /// and `mesh_root` is the merged parent state when it can be computed.
    pub fn child(&self, position: HexCoordinate, parents: &[Hash]) -> HexHeader {
        assert!(parents.len() <= 6, "at most six parents");
        let resolved: Vec<HexHeader> = parents.iter().map(|h| self.header(h)).collect();
        let number = resolved.iter().map(|p| p.number).max().unwrap_or(0) + 1;
        let time = resolved.iter().map(|p| p.time).max().unwrap_or(GENESIS_TIME) + 1;

        let mut header = HexHeader::genesis(time, signer_at(position).id());
        header.extra = Vec::new();
        header.number = number;
        header.position = position;
        for (hash, parent) in parents.iter().zip(&resolved) {
            let preferred = position
                .direction_to(&parent.position)
                .map(Direction::index)
                .filter(|slot| header.parent_hashes[*slot].is_none());
            let slot = preferred
                .or_else(|| header.parent_hashes.iter().position(Option::is_none))
                .unwrap_or_else(|| panic!("no free slot for {hash}"));
            header.parent_hashes[slot] = Some(*hash);
        }
        header.neighbor_count = parents.len() as u8;
        if let Ok(outcome) = self.resolver().merge_parents(&header) {
            header.mesh_root = outcome.root;
        }
        header
    }

    /// Replace the proof with signatures from every resolvable parent's
    /// cell validator over the header's seal hash.
    pub fn sign(&self, mut header: HexHeader) -> HexHeader {
        let seal = header.seal_hash();
        let signers: Vec<(usize, LocalSigner)> = header
            .parents()
            .filter_map(|(slot, hash)| {
                self.chain
                    .header_by_hash(&hash)
                    .map(|p| (slot, signer_at(p.position)))
            })
            .collect();

        let old = &header.proof;
        let mut proof = HexaProof::new(
            old.state_proof().to_vec(),
            old.mesh_proof().to_vec(),
            old.timestamp(),
            signers.iter().map(|(_, s)| s.id()).collect(),
        );
        for (slot, signer) in &signers {
            proof = proof.with_signature(
                *slot,
                NeighborSignature {
                    signer: signer.id(),
                    signature: signer.sign(&seal),
                },
            );
        }
        header.proof = proof;
        header
    }

    pub fn signed_child(&self, position: HexCoordinate, parents: &[Hash]) -> HexHeader {
        self.sign(self.child(position, parents))
    }

    /// Store `header` as an empty block with an explicit post-state.
    pub fn commit_with_state(&self, header: HexHeader, state: WorldState) -> Hash {
        let hash = self.chain.insert_block(HexBlock::new(header, Vec::new(), None));
        self.chain.insert_state(hash, state);
        hash
    }

    /// Store `header` with its merged parent state as post-state.
    pub fn commit(&self, header: HexHeader) -> Hash {
        let state = self
            .resolver()
            .merge_parents(&header)
            .map(|o| o.state)
            .unwrap_or_default();
        self.commit_with_state(header, state)
    }

    /// Build, sign and store a child in one step.
    pub fn extend(&self, position: HexCoordinate, parents: &[Hash]) -> Hash {
        self.commit(self.signed_child(position, parents))
    }
}
