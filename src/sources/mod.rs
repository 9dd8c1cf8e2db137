//! Pluggable entropy sources.
//!
//! Sources deliver raw or conditioned bytes together with an entropy
//! credit. The DRNG manager pulls from every registered source when
//! seeding; the concrete collection backends live behind the
//! [`EntropySource`] trait.

mod kernel;
mod mock;

pub use kernel::KernelRngSource;
pub use mock::MockSource;

use zeroize::Zeroize;

/// Result of polling a source once.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollResult {
    /// Bytes written into the caller's buffer.
    pub len: usize,
    /// Entropy credited for those bytes.
    pub credited_bits: u32,
}

/// A producer of entropy with an associated credit in bits.
pub trait EntropySource: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Entropy the source estimates it could deliver right now.
    fn available_entropy_bits(&self) -> u32;

    /// Delivers up to `needed_bits` of entropy into `buf`.
    ///
    /// Returns the bytes written and the entropy credited for them. A
    /// source may return data with zero credit (mixed in but not
    /// counted), or nothing at all.
    fn poll(&self, needed_bits: u32, buf: &mut [u8]) -> PollResult;

    /// Releases source resources at shutdown.
    fn fini(&self) {}
}

const SEED_BUFFER_CAPACITY: usize = 1024;

/// Fixed-capacity carrier for seed material gathered during a reseed.
///
/// Accumulates the outputs of all polled sources plus the aux pool
/// digest without heap allocation. Wiped on drop.
pub struct SeedBuffer {
    buf: [u8; SEED_BUFFER_CAPACITY],
    len: usize,
    credited_bits: u32,
}

impl SeedBuffer {
    /// Maximum seed material one reseed can gather.
    pub const CAPACITY: usize = SEED_BUFFER_CAPACITY;

    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: [0u8; Self::CAPACITY],
            len: 0,
            credited_bits: 0,
        }
    }

    /// Appends seed material with its entropy credit.
    ///
    /// Data beyond the buffer capacity is discarded; its credit is not.
    pub fn push(&mut self, data: &[u8], credited_bits: u32) {
        let space = Self::CAPACITY - self.len;
        let take = data.len().min(space);
        self.buf[self.len..self.len + take].copy_from_slice(&data[..take]);
        self.len += take;
        self.credited_bits = self.credited_bits.saturating_add(credited_bits);
    }

    /// Returns a writable tail of the buffer for a source to fill.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Commits `len` bytes previously written into [`Self::spare`].
    pub fn commit(&mut self, len: usize, credited_bits: u32) {
        debug_assert!(self.len + len <= Self::CAPACITY);
        self.len += len;
        self.credited_bits = self.credited_bits.saturating_add(credited_bits);
    }

    /// Returns the accumulated seed material.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Returns the total entropy credited.
    pub fn credited_bits(&self) -> u32 {
        self.credited_bits
    }
}

impl Default for SeedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SeedBuffer {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}

/// Registry of all entropy sources feeding the DRNG manager.
pub struct SourceRegistry {
    sources: Vec<Box<dyn EntropySource>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    /// Registers a source.
    pub fn register(&mut self, source: Box<dyn EntropySource>) {
        tracing::info!(source = source.name(), "Registered entropy source");
        self.sources.push(source);
    }

    /// Returns the number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if no sources are registered.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Sums the entropy all sources estimate they could deliver.
    pub fn available_entropy_bits(&self) -> u32 {
        self.sources
            .iter()
            .fold(0u32, |acc, s| acc.saturating_add(s.available_entropy_bits()))
    }

    /// Polls every source for `needed_bits` and accumulates the results.
    ///
    /// Returns the entropy credited by this pass.
    pub fn poll_all(&self, needed_bits: u32, seed: &mut SeedBuffer) -> u32 {
        let mut gathered = 0u32;

        for source in &self.sources {
            let spare = seed.spare();
            if spare.is_empty() {
                break;
            }
            let spare_len = spare.len();

            let result = source.poll(needed_bits, spare);
            let len = result.len.min(spare_len);
            seed.commit(len, result.credited_bits);
            gathered = gathered.saturating_add(result.credited_bits);

            tracing::trace!(
                source = source.name(),
                bytes = len,
                credited = result.credited_bits,
                "Polled entropy source"
            );
        }

        gathered
    }

    /// Finalizes all sources.
    pub fn fini_all(&self) {
        for source in &self.sources {
            source.fini();
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_buffer_accumulates() {
        let mut seed = SeedBuffer::new();
        seed.push(&[1, 2, 3], 24);
        seed.push(&[4, 5], 16);

        assert_eq!(seed.data(), &[1, 2, 3, 4, 5]);
        assert_eq!(seed.credited_bits(), 40);
    }

    #[test]
    fn test_seed_buffer_discards_overflow_data() {
        let mut seed = SeedBuffer::new();
        seed.push(&[0xAA; SeedBuffer::CAPACITY], 512);
        seed.push(&[0xBB; 16], 128);

        assert_eq!(seed.data().len(), SeedBuffer::CAPACITY);
        // Credit survives even when the bytes are dropped.
        assert_eq!(seed.credited_bits(), 640);
    }

    #[test]
    fn test_registry_sums_available_entropy() {
        let mut registry = SourceRegistry::new();
        registry.register(Box::new(MockSource::with_budget(128, 128)));
        registry.register(Box::new(MockSource::with_budget(64, 256)));

        assert_eq!(registry.available_entropy_bits(), 128 + 256);
    }

    #[test]
    fn test_poll_all_gathers_from_every_source() {
        let mut registry = SourceRegistry::new();
        registry.register(Box::new(MockSource::with_budget(128, 1024)));
        registry.register(Box::new(MockSource::with_budget(128, 1024)));

        let mut seed = SeedBuffer::new();
        let gathered = registry.poll_all(128, &mut seed);

        assert_eq!(gathered, 256);
        assert_eq!(seed.data().len(), 32);
        assert_eq!(seed.credited_bits(), 256);
    }

    #[test]
    fn test_empty_registry_gathers_nothing() {
        let registry = SourceRegistry::new();
        let mut seed = SeedBuffer::new();
        assert_eq!(registry.poll_all(256, &mut seed), 0);
        assert!(seed.data().is_empty());
    }
}
