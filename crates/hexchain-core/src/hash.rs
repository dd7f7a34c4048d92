//! Digests, identities and the canonical encoding they are computed over.
//!
//! Every identity hash in Hexchain is blake3 over a canonical byte stream:
//! a domain tag, then fields in declaration order with fixed-width
//! little-endian integers and length-prefixed byte strings. Optional values
//! carry a one-byte presence tag. The stream never depends on in-memory
//! layout, so the same value hashes identically on every node and across
//! restarts.

use hexchain_topology::HexCoordinate;
use serde::{Deserialize, Serialize};

/// A 256-bit blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// All-zero digest. Never produced by hashing real data.
    pub const ZERO: Self = Self([0; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Plain blake3 of arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", self)
    }
}

/// A validator's identity: the bytes of its ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ValidatorId(pub [u8; 32]);

impl ValidatorId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

impl std::fmt::Debug for ValidatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValidatorId({})", self)
    }
}

/// Raw signature bytes as carried on the wire.
///
/// Length is not checked here; a malformed signature simply fails
/// verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl SignatureBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Incremental writer for the canonical encoding.
///
/// Also counts the bytes written, which gives encoded sizes without
/// materializing the encoding.
pub struct CanonicalHasher {
    hasher: blake3::Hasher,
    written: u64,
}

impl CanonicalHasher {
    /// Start a stream under a domain tag.
    pub fn new(domain: &str) -> Self {
        let mut this = Self {
            hasher: blake3::Hasher::new(),
            written: 0,
        };
        this.bytes(domain.as_bytes());
        this
    }

    fn raw(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.written += data.len() as u64;
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.raw(&[v]);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.raw(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.raw(&v.to_le_bytes());
        self
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.u64(data.len() as u64);
        self.raw(data);
        self
    }

    pub fn hash(&mut self, h: &Hash) -> &mut Self {
        self.raw(&h.0);
        self
    }

    pub fn opt_hash(&mut self, h: Option<&Hash>) -> &mut Self {
        match h {
            Some(h) => self.u8(1).hash(h),
            None => self.u8(0),
        }
    }

    pub fn opt_u64(&mut self, v: Option<u64>) -> &mut Self {
        match v {
            Some(v) => self.u8(1).u64(v),
            None => self.u8(0),
        }
    }

    pub fn validator(&mut self, id: &ValidatorId) -> &mut Self {
        self.raw(&id.0);
        self
    }

    /// Position as `(q, r)`; `s` is derived and not encoded.
    pub fn coordinate(&mut self, c: &HexCoordinate) -> &mut Self {
        self.i64(c.q()).i64(c.r())
    }

    /// Bytes written so far, domain tag included.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finalize(&self) -> Hash {
        Hash(*self.hasher.finalize().as_bytes())
    }
}

/// Commitment over an ordered list of byte strings.
///
/// Used for the transaction and withdrawal roots. The empty list has a
/// fixed, non-zero root.
pub fn ordered_root<'a, I>(items: I) -> Hash
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut h = CanonicalHasher::new("hexchain.ordered-root");
    let mut count = 0u64;
    for item in items {
        h.u64(count).bytes(item);
        count += 1;
    }
    h.u64(count);
    h.finalize()
}
