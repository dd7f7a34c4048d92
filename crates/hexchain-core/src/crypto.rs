//! Hashing and signature capabilities.
//!
//! Validation code only sees [`CryptoProvider`]; [`Ed25519Blake3`] is the
//! implementation used on the network. [`LocalSigner`] produces the
//! neighbor signatures that providers verify.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{Error, Result};
use crate::hash::{Hash, SignatureBytes, ValidatorId};

/// Hash and verify primitives consumed by validation.
pub trait CryptoProvider: Send + Sync {
    /// Collision-resistant digest of arbitrary bytes.
    fn hash(&self, data: &[u8]) -> Hash;

    /// True when `signature` is `signer`'s signature over `message`.
    fn verify(&self, message: &Hash, signature: &SignatureBytes, signer: &ValidatorId) -> bool;
}

/// blake3 hashing with ed25519 signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Blake3;

impl CryptoProvider for Ed25519Blake3 {
    fn hash(&self, data: &[u8]) -> Hash {
        Hash::digest(data)
    }

    fn verify(&self, message: &Hash, signature: &SignatureBytes, signer: &ValidatorId) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&signer.0) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature.as_slice()) else {
            return false;
        };
        key.verify(message.as_bytes(), &sig).is_ok()
    }
}

/// A validator's signing key.
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a 64-character hex seed.
    pub fn from_hex(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn id(&self) -> ValidatorId {
        ValidatorId(self.key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &Hash) -> SignatureBytes {
        SignatureBytes(self.key.sign(message.as_bytes()).to_bytes().to_vec())
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner").field("id", &self.id()).finish()
    }
}
