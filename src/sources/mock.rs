//! Deterministic entropy source for tests and demonstrations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};

use super::{EntropySource, PollResult};

/// A test source with a bounded entropy budget.
///
/// Delivers at most `bits_per_poll` per call until the budget is
/// exhausted, then returns nothing until refilled. The data itself is a
/// deterministic keystream, so tests are reproducible.
pub struct MockSource {
    bits_per_poll: u32,
    remaining_bits: AtomicU32,
    stream: Mutex<ChaCha20Rng>,
}

impl MockSource {
    /// Creates a source delivering `bits_per_poll` per call from a total
    /// budget of `budget_bits`.
    pub fn with_budget(bits_per_poll: u32, budget_bits: u32) -> Self {
        Self {
            bits_per_poll,
            remaining_bits: AtomicU32::new(budget_bits),
            stream: Mutex::new(ChaCha20Rng::from_seed([0x5A; 32])),
        }
    }

    /// Adds entropy back to the budget.
    pub fn refill(&self, bits: u32) {
        self.remaining_bits.fetch_add(bits, Ordering::Relaxed);
    }
}

impl EntropySource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available_entropy_bits(&self) -> u32 {
        self.remaining_bits.load(Ordering::Relaxed)
    }

    fn poll(&self, needed_bits: u32, buf: &mut [u8]) -> PollResult {
        let want = needed_bits.min(self.bits_per_poll);

        let granted = self
            .remaining_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                Some(remaining - want.min(remaining))
            })
            .map(|before| want.min(before))
            .unwrap_or(0);

        if granted == 0 {
            return PollResult::default();
        }

        let len = (granted as usize).div_ceil(8).min(buf.len());
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.fill_bytes(&mut buf[..len]);

        PollResult {
            len,
            credited_bits: granted,
        }
    }
}
