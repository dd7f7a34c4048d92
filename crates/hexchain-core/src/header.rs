//! The multi-parent block header.

use hexchain_topology::{HexCoordinate, NEIGHBOR_SLOTS};
use serde::{Deserialize, Serialize};

use crate::hash::{ordered_root, CanonicalHasher, Hash, ValidatorId};
use crate::proof::HexaProof;
use crate::state::WorldState;

/// Default gas limit for a freshly created genesis header.
pub const GENESIS_GAS_LIMIT: u64 = 5_000_000;

/// A header referencing up to six parents on adjacent grid cells.
///
/// By convention `parent_hashes[i]` holds the parent in direction `i` (see
/// [`hexchain_topology::Direction`]), but validation only requires each
/// parent to sit on a cell adjacent to `position`. `neighbor_count` must
/// equal the number of filled slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HexHeader {
    pub parent_hashes: [Option<Hash>; NEIGHBOR_SLOTS],
    pub neighbor_count: u8,
    pub position: HexCoordinate,
    /// Root of the merged parent state.
    pub mesh_root: Hash,
    pub proof: HexaProof,

    pub author: ValidatorId,
    /// Post-execution state root.
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipt_root: Hash,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Unix seconds.
    pub time: u64,
    #[serde(with = "serde_bytes")]
    pub extra: Vec<u8>,
    pub base_fee: Option<u64>,
    pub withdrawals_root: Option<Hash>,
}

impl HexHeader {
    /// Genesis header at the origin with no parents.
    ///
    /// The proof timestamp is set to `time` so genesis passes the proof
    /// stage like any other header.
    pub fn genesis(time: u64, author: ValidatorId) -> Self {
        let empty_root = WorldState::new().root();
        let empty_list = ordered_root(std::iter::empty());
        Self {
            parent_hashes: [None; NEIGHBOR_SLOTS],
            neighbor_count: 0,
            position: HexCoordinate::ORIGIN,
            mesh_root: empty_root,
            proof: HexaProof::default().with_timestamp(time),
            author,
            state_root: empty_root,
            tx_root: empty_list,
            receipt_root: empty_list,
            number: 0,
            gas_limit: GENESIS_GAS_LIMIT,
            gas_used: 0,
            time,
            extra: b"Hexchain Genesis".to_vec(),
            base_fee: None,
            withdrawals_root: None,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }

    /// Filled parent slots as `(slot, hash)`.
    pub fn parents(&self) -> impl Iterator<Item = (usize, Hash)> + '_ {
        self.parent_hashes
            .iter()
            .enumerate()
            .filter_map(|(slot, h)| h.map(|h| (slot, h)))
    }

    /// Number of filled parent slots, independent of `neighbor_count`.
    pub fn parent_slot_count(&self) -> usize {
        self.parent_hashes.iter().flatten().count()
    }

    /// Identity hash over every field, proof included.
    pub fn hash(&self) -> Hash {
        let mut h = CanonicalHasher::new("hexchain.header");
        self.write_sealed_fields(&mut h);
        h.hash(&self.proof.hash());
        h.finalize()
    }

    /// Hash over every field except the proof. Neighbors sign this value,
    /// since the proof cannot contain signatures over itself.
    pub fn seal_hash(&self) -> Hash {
        let mut h = CanonicalHasher::new("hexchain.header.seal");
        self.write_sealed_fields(&mut h);
        h.finalize()
    }

    pub(crate) fn write_sealed_fields(&self, h: &mut CanonicalHasher) {
        for slot in &self.parent_hashes {
            h.opt_hash(slot.as_ref());
        }
        h.u8(self.neighbor_count)
            .coordinate(&self.position)
            .hash(&self.mesh_root)
            .validator(&self.author)
            .hash(&self.state_root)
            .hash(&self.tx_root)
            .hash(&self.receipt_root)
            .u64(self.number)
            .u64(self.gas_limit)
            .u64(self.gas_used)
            .u64(self.time)
            .bytes(&self.extra)
            .opt_u64(self.base_fee)
            .opt_hash(self.withdrawals_root.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::SignatureBytes;
    use crate::proof::NeighborSignature;

    fn sample() -> HexHeader {
        let mut h = HexHeader::genesis(1_700_000_000, ValidatorId([1; 32]));
        h.number = 4;
        h.position = HexCoordinate::new(1, 1);
        h.parent_hashes[0] = Some(Hash([0x12; 32]));
        h.parent_hashes[5] = Some(Hash([0x56; 32]));
        h.neighbor_count = 2;
        h
    }

    #[test]
    fn genesis_shape() {
        let g = HexHeader::genesis(100, ValidatorId::default());
        assert!(g.is_genesis());
        assert_eq!(g.neighbor_count, 0);
        assert_eq!(g.position, HexCoordinate::ORIGIN);
        assert_eq!(g.parents().count(), 0);
        assert_eq!(g.proof.timestamp(), 100);
    }

    #[test]
    fn parents_report_slots() {
        let h = sample();
        let parents: Vec<_> = h.parents().collect();
        assert_eq!(parents, vec![(0, Hash([0x12; 32])), (5, Hash([0x56; 32]))]);
        assert_eq!(h.parent_slot_count(), 2);
    }

    #[test]
    fn hash_covers_every_field() {
        let base = sample();
        let h = base.hash();

        let mut moved = base.clone();
        moved.position = HexCoordinate::new(2, 0);
        assert_ne!(moved.hash(), h);

        let mut swapped = base.clone();
        swapped.parent_hashes.swap(0, 1);
        assert_ne!(swapped.hash(), h);

        let mut fee = base.clone();
        fee.base_fee = Some(0);
        assert_ne!(fee.hash(), h);

        let mut extra = base.clone();
        extra.extra.push(0);
        assert_ne!(extra.hash(), h);
    }

    #[test]
    fn seal_hash_excludes_proof() {
        let base = sample();
        let signed = HexHeader {
            proof: base.proof.clone().with_signature(
                0,
                NeighborSignature {
                    signer: ValidatorId([7; 32]),
                    signature: SignatureBytes(vec![1; 64]),
                },
            ),
            ..base.clone()
        };
        assert_eq!(base.seal_hash(), signed.seal_hash());
        assert_ne!(base.hash(), signed.hash());
        assert_ne!(base.hash(), base.seal_hash());
    }
}
