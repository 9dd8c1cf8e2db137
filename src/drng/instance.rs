//! A single DRNG instance.
//!
//! Wraps a ChaCha20 DRBG with the bookkeeping the manager needs:
//! a generation counter bumped on every rekey, the bytes produced since
//! the last reseed, reseed timestamps and the force-reseed flag.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// A seeded DRBG with reseed bookkeeping.
pub struct Drng {
    rng: ChaCha20Rng,
    generation: u64,
    bytes_since_reseed: u64,
    last_reseed: Instant,
    last_reseed_secs: u64,
    force_reseed: bool,
    seeded_bits: u32,
}

fn wallclock_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Drng {
    /// Creates an instance keyed from OS entropy.
    ///
    /// The instance counts as unseeded until the manager reseeds it from
    /// the entropy sources; the OS key only protects best-effort output
    /// requested before that happens.
    pub fn new() -> Self {
        Self {
            rng: ChaCha20Rng::from_entropy(),
            generation: 0,
            bytes_since_reseed: 0,
            last_reseed: Instant::now(),
            last_reseed_secs: wallclock_secs(),
            force_reseed: false,
            seeded_bits: 0,
        }
    }

    /// Rekeys the DRBG with the given seed material.
    ///
    /// The new key is the conditioned seed material mixed with current
    /// DRBG output, so compromising the seed path alone cannot predict
    /// subsequent output.
    fn rekey(&mut self, material: &[u8]) {
        let mut current = [0u8; 32];
        self.rng.fill_bytes(&mut current);

        let mut digest: [u8; 32] = Sha256::digest(material).into();
        for (mixed, fresh) in digest.iter_mut().zip(current.iter()) {
            *mixed ^= fresh;
        }

        self.rng = ChaCha20Rng::from_seed(digest);
        self.generation += 1;

        current.zeroize();
        digest.zeroize();
    }

    /// Performs a full reseed with `credited_bits` of entropy.
    pub fn reseed(&mut self, material: &[u8], credited_bits: u32) {
        self.rekey(material);
        self.bytes_since_reseed = 0;
        self.last_reseed = Instant::now();
        self.last_reseed_secs = wallclock_secs();
        self.force_reseed = false;
        self.seeded_bits = credited_bits;

        tracing::debug!(
            generation = self.generation,
            credited_bits,
            "DRNG reseeded"
        );
    }

    /// Mixes partial seed material into the DRBG without resetting the
    /// reseed bookkeeping. Used by the prediction-resistant path when
    /// the sources cannot cover a full seed.
    pub fn mix(&mut self, material: &[u8]) {
        self.rekey(material);
    }

    /// Fills `out` with DRBG output.
    pub fn generate(&mut self, out: &mut [u8]) {
        self.rng.fill_bytes(out);
        self.bytes_since_reseed += out.len() as u64;
    }

    /// Returns true if a reseed is due before the next generate.
    pub fn needs_reseed(&self, max_bytes: u64, max_secs: u32) -> bool {
        self.force_reseed
            || self.bytes_since_reseed > max_bytes
            || self.last_reseed.elapsed().as_secs() > u64::from(max_secs)
    }

    /// Requests a reseed before the next generate.
    pub fn request_reseed(&mut self) {
        self.force_reseed = true;
    }

    /// Returns true if a reseed has been requested.
    pub fn reseed_requested(&self) -> bool {
        self.force_reseed
    }

    /// Returns the reseed generation counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the bytes produced since the last full reseed.
    pub fn bytes_since_reseed(&self) -> u64 {
        self.bytes_since_reseed
    }

    /// Returns the entropy credited at the last full reseed.
    pub fn seeded_bits(&self) -> u32 {
        self.seeded_bits
    }

    /// Returns the wallclock seconds of the last full reseed.
    pub fn last_reseed_secs(&self) -> u64 {
        self.last_reseed_secs
    }
}

impl Default for Drng {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Drng {
    fn drop(&mut self) {
        // Overwrite the DRBG key state before release.
        self.rng = ChaCha20Rng::from_seed([0u8; 32]);
        self.seeded_bits = 0;
    }
}

impl std::fmt::Debug for Drng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drng")
            .field("generation", &self.generation)
            .field("bytes_since_reseed", &self.bytes_since_reseed)
            .field("seeded_bits", &self.seeded_bits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reseed_bumps_generation_and_resets_counter() {
        let mut drng = Drng::new();
        let mut buf = [0u8; 100];

        drng.generate(&mut buf);
        assert_eq!(drng.bytes_since_reseed(), 100);

        drng.reseed(b"seed material", 256);
        assert_eq!(drng.generation(), 1);
        assert_eq!(drng.bytes_since_reseed(), 0);
        assert_eq!(drng.seeded_bits(), 256);
    }

    #[test]
    fn test_mix_keeps_counters() {
        let mut drng = Drng::new();
        let mut buf = [0u8; 64];
        drng.generate(&mut buf);

        drng.mix(b"partial seed");
        assert_eq!(drng.generation(), 1);
        assert_eq!(drng.bytes_since_reseed(), 64);
        assert_eq!(drng.seeded_bits(), 0);
    }

    #[test]
    fn test_reseed_changes_output() {
        let mut a = Drng::new();
        let mut before = [0u8; 32];
        let mut after = [0u8; 32];

        a.reseed(b"first", 256);
        a.generate(&mut before);

        a.reseed(b"second", 256);
        a.generate(&mut after);

        assert_ne!(before, after);
    }

    #[test]
    fn test_force_reseed_triggers_needs_reseed() {
        let mut drng = Drng::new();
        assert!(!drng.needs_reseed(u64::MAX, u32::MAX));

        drng.request_reseed();
        assert!(drng.needs_reseed(u64::MAX, u32::MAX));

        drng.reseed(b"seed", 256);
        assert!(!drng.needs_reseed(u64::MAX, u32::MAX));
    }

    #[test]
    fn test_byte_threshold_triggers_needs_reseed() {
        let mut drng = Drng::new();
        let mut buf = [0u8; 128];
        drng.generate(&mut buf);

        assert!(drng.needs_reseed(64, u32::MAX));
        assert!(!drng.needs_reseed(1024, u32::MAX));
    }
}
