//! Conditioning hash state.
//!
//! The conditioner absorbs arbitrary input into a running hash state and
//! produces fixed-width digests on extraction. After each extraction the
//! state is re-keyed with the finalized digest so that repeated
//! extractions never replay identical seed material.

use blake3::Hasher as Blake3Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

/// Maximum digest size supported by any conditioner, in bytes.
pub(crate) const MAX_DIGEST_BYTES: usize = 64;

/// Supported hash algorithms for conditioning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE3 - fast, secure, 256-bit output.
    Blake3,
    /// SHA-256 - widely deployed, conservative choice.
    Sha256,
    /// SHA-512 - default; widest pool the conditioner supports.
    #[default]
    Sha512,
}

impl HashAlgorithm {
    /// Returns the digest size in bits.
    pub fn digest_bits(self) -> u32 {
        match self {
            HashAlgorithm::Blake3 | HashAlgorithm::Sha256 => 256,
            HashAlgorithm::Sha512 => 512,
        }
    }

    /// Returns the digest size in bytes.
    pub fn digest_bytes(self) -> usize {
        (self.digest_bits() / 8) as usize
    }
}

/// Conditioned seed material produced by an extraction.
///
/// Holds one digest of the conditioner state. Wiped on drop.
#[derive(Clone)]
pub struct Seed {
    bytes: [u8; MAX_DIGEST_BYTES],
    len: usize,
}

impl Seed {
    /// Returns the seed bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Returns the seed length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the seed is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Seed {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seed").field("len", &self.len).finish_non_exhaustive()
    }
}

enum HashState {
    Blake3(Box<Blake3Hasher>),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl HashState {
    fn fresh(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => HashState::Blake3(Box::new(Blake3Hasher::new())),
            HashAlgorithm::Sha256 => HashState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HashState::Sha512(Sha512::new()),
        }
    }
}

/// Entropy conditioner with a running hash state.
pub struct Conditioner {
    algorithm: HashAlgorithm,
    state: HashState,
}

impl Conditioner {
    /// Creates a new conditioner with the specified algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            state: HashState::fresh(algorithm),
        }
    }

    /// Returns the configured algorithm.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Absorbs data into the hash state.
    pub fn absorb(&mut self, data: &[u8]) {
        match &mut self.state {
            HashState::Blake3(hasher) => {
                hasher.update(data);
            }
            HashState::Sha256(hasher) => hasher.update(data),
            HashState::Sha512(hasher) => hasher.update(data),
        }
    }

    /// Extracts the digest of the current state.
    ///
    /// The state is re-keyed with the finalized digest, so a subsequent
    /// extraction yields a different seed even without new absorptions.
    pub fn extract(&mut self) -> Seed {
        let mut bytes = [0u8; MAX_DIGEST_BYTES];
        let len = self.algorithm.digest_bytes();

        match &self.state {
            HashState::Blake3(hasher) => {
                bytes[..len].copy_from_slice(hasher.finalize().as_bytes());
            }
            HashState::Sha256(hasher) => {
                bytes[..len].copy_from_slice(&hasher.clone().finalize());
            }
            HashState::Sha512(hasher) => {
                bytes[..len].copy_from_slice(&hasher.clone().finalize());
            }
        }

        self.state = HashState::fresh(self.algorithm);
        self.absorb(&bytes[..len]);

        Seed { bytes, len }
    }
}

impl std::fmt::Debug for Conditioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conditioner")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
