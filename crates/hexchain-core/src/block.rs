//! Block aggregate: a header plus its body.

use std::sync::OnceLock;

use hexchain_topology::NEIGHBOR_SLOTS;
use serde::{Deserialize, Serialize};

use crate::hash::{ordered_root, CanonicalHasher, Hash, ValidatorId};
use crate::header::HexHeader;

/// An opaque transaction payload. Execution happens outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction(#[serde(with = "serde_bytes")] pub Vec<u8>);

/// A validator withdrawal carried in the block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub index: u64,
    pub validator: u64,
    pub recipient: ValidatorId,
    pub amount: u64,
}

impl Withdrawal {
    /// Canonical bytes committed to by the withdrawals root.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(56);
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.validator.to_le_bytes());
        out.extend_from_slice(&self.recipient.0);
        out.extend_from_slice(&self.amount.to_le_bytes());
        out
    }
}

/// Root committed to by `HexHeader::tx_root`.
pub fn transactions_root(txs: &[Transaction]) -> Hash {
    ordered_root(txs.iter().map(|tx| tx.0.as_slice()))
}

/// Root committed to by `HexHeader::withdrawals_root`.
pub fn withdrawals_root(withdrawals: &[Withdrawal]) -> Hash {
    let encoded: Vec<Vec<u8>> = withdrawals.iter().map(Withdrawal::canonical_bytes).collect();
    ordered_root(encoded.iter().map(Vec::as_slice))
}

/// A complete block.
///
/// Immutable once built; the hash and encoded size are computed on first
/// use and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HexBlock {
    header: HexHeader,
    transactions: Vec<Transaction>,
    withdrawals: Option<Vec<Withdrawal>>,
    neighbor_proofs: [Vec<u8>; NEIGHBOR_SLOTS],
    #[serde(with = "serde_bytes")]
    mesh_witness: Vec<u8>,

    #[serde(skip)]
    hash: OnceLock<Hash>,
    #[serde(skip)]
    size: OnceLock<u64>,
}

impl HexBlock {
    pub fn new(
        header: HexHeader,
        transactions: Vec<Transaction>,
        withdrawals: Option<Vec<Withdrawal>>,
    ) -> Self {
        Self::with_mesh_data(header, transactions, withdrawals, Default::default(), Vec::new())
    }

    /// Build a block that also carries per-neighbor proof blobs and a mesh
    /// witness.
    pub fn with_mesh_data(
        header: HexHeader,
        transactions: Vec<Transaction>,
        withdrawals: Option<Vec<Withdrawal>>,
        neighbor_proofs: [Vec<u8>; NEIGHBOR_SLOTS],
        mesh_witness: Vec<u8>,
    ) -> Self {
        Self {
            header,
            transactions,
            withdrawals,
            neighbor_proofs,
            mesh_witness,
            hash: OnceLock::new(),
            size: OnceLock::new(),
        }
    }

    /// Empty genesis block.
    pub fn genesis(time: u64, author: ValidatorId) -> Self {
        Self::new(HexHeader::genesis(time, author), Vec::new(), None)
    }

    pub fn header(&self) -> &HexHeader {
        &self.header
    }

    pub fn into_header(self) -> HexHeader {
        self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn withdrawals(&self) -> Option<&[Withdrawal]> {
        self.withdrawals.as_deref()
    }

    pub fn neighbor_proof(&self, slot: usize) -> Option<&[u8]> {
        self.neighbor_proofs.get(slot).map(Vec::as_slice)
    }

    pub fn mesh_witness(&self) -> &[u8] {
        &self.mesh_witness
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Block hash, equal to the header hash.
    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| self.header.hash())
    }

    /// Size in bytes of the canonical encoding of header and body.
    pub fn size(&self) -> u64 {
        *self.size.get_or_init(|| self.encoded_len())
    }

    fn encoded_len(&self) -> u64 {
        let mut h = CanonicalHasher::new("hexchain.block");
        self.header.write_sealed_fields(&mut h);
        h.hash(&self.header.proof.hash());
        h.u64(self.transactions.len() as u64);
        for tx in &self.transactions {
            h.bytes(&tx.0);
        }
        match &self.withdrawals {
            Some(ws) => {
                h.u8(1).u64(ws.len() as u64);
                for w in ws {
                    h.bytes(&w.canonical_bytes());
                }
            }
            None => {
                h.u8(0);
            }
        }
        for proof in &self.neighbor_proofs {
            h.bytes(proof);
        }
        h.bytes(&self.mesh_witness);
        h.written()
    }
}

impl PartialEq for HexBlock {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.transactions == other.transactions
            && self.withdrawals == other.withdrawals
            && self.neighbor_proofs == other.neighbor_proofs
            && self.mesh_witness == other.mesh_witness
    }
}

impl Eq for HexBlock {}
