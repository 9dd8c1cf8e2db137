//! Auxiliary entropy pool.
//!
//! The pool is a conditioning hash state paired with an entropy-bits
//! counter. A single mutex guards both so the counter can never diverge
//! from the pool contents.

use std::sync::Mutex;

use super::digest::{Conditioner, HashAlgorithm, Seed};

struct PoolInner {
    conditioner: Conditioner,
    credited_bits: u32,
}

/// Fixed-width conditioning pool with entropy accounting.
///
/// Data is folded in by absorbing into the conditioning hash. The
/// credited entropy saturates at the digest size `H`: the pool can never
/// claim more entropy than its own width.
pub struct AuxPool {
    inner: Mutex<PoolInner>,
}

impl AuxPool {
    /// Creates an empty pool using the given conditioning algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                conditioner: Conditioner::new(algorithm),
                credited_bits: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Absorbs `data` into the pool and credits `entropy_bits`.
    ///
    /// The credit saturates at the pool size. An empty buffer is a no-op;
    /// in SP800-90C operation the caller asserts that credited data
    /// originates from an SP800-90B source, which the pool records but
    /// does not validate.
    pub fn insert(&self, data: &[u8], entropy_bits: u32) {
        if data.is_empty() {
            return;
        }

        let mut inner = self.lock();
        let poolsize = inner.conditioner.algorithm().digest_bits();
        inner.conditioner.absorb(data);
        inner.credited_bits = inner.credited_bits.saturating_add(entropy_bits).min(poolsize);

        tracing::trace!(
            bytes = data.len(),
            credited = entropy_bits,
            pool_entropy = inner.credited_bits,
            "Inserted data into aux pool"
        );
    }

    /// Extracts conditioned seed material from the pool.
    ///
    /// Returns the digest of the pool state together with the entropy
    /// withdrawn: `min(credited, want_bits)`, never more than the pool
    /// size per extraction. The credit is zeroed and the hash state is
    /// re-keyed with the finalized digest.
    pub fn extract(&self, want_bits: u32) -> (Seed, u32) {
        let mut inner = self.lock();
        let seed = inner.conditioner.extract();
        let withdrawn = inner.credited_bits.min(want_bits);
        inner.credited_bits = 0;

        tracing::debug!(want_bits, withdrawn, "Extracted seed from aux pool");

        (seed, withdrawn)
    }

    /// Returns the currently credited entropy in bits.
    pub fn available_entropy(&self) -> u32 {
        self.lock().credited_bits
    }

    /// Sets the entropy credit, clamped to `[0, poolsize]`.
    ///
    /// Test and debug interface; not reachable through the RPC surface.
    pub fn set_entropy(&self, bits: u32) {
        let mut inner = self.lock();
        let poolsize = inner.conditioner.algorithm().digest_bits();
        inner.credited_bits = bits.min(poolsize);
    }

    /// Returns the pool size `H` in bits.
    pub fn poolsize(&self) -> u32 {
        self.lock().conditioner.algorithm().digest_bits()
    }
}

impl std::fmt::Debug for AuxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("AuxPool")
            .field("algorithm", &inner.conditioner.algorithm())
            .field("credited_bits", &inner.credited_bits)
            .finish()
    }
}
