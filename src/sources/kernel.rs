//! Kernel RNG entropy source.
//!
//! Pulls from the operating system CSPRNG via `getrandom`. In regular
//! operation the kernel RNG is treated as fully seeded and its output is
//! credited in full; in SP800-90C operation the kernel RNG is not an
//! SP800-90B source, so its output is mixed in without credit.

use super::{EntropySource, PollResult};

/// Entropy source backed by the operating system CSPRNG.
pub struct KernelRngSource {
    credited: bool,
}

impl KernelRngSource {
    /// Creates a source whose output is credited in full.
    pub fn new() -> Self {
        Self { credited: true }
    }

    /// Creates a source whose output is mixed in without entropy credit.
    pub fn uncredited() -> Self {
        Self { credited: false }
    }
}

impl Default for KernelRngSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for KernelRngSource {
    fn name(&self) -> &'static str {
        "krng"
    }

    fn available_entropy_bits(&self) -> u32 {
        if self.credited {
            u32::MAX
        } else {
            0
        }
    }

    fn poll(&self, needed_bits: u32, buf: &mut [u8]) -> PollResult {
        let want = (needed_bits as usize).div_ceil(8).min(buf.len());
        if want == 0 {
            return PollResult::default();
        }

        if let Err(err) = getrandom::getrandom(&mut buf[..want]) {
            tracing::warn!(%err, "Kernel RNG read failed");
            return PollResult::default();
        }

        let credited_bits = if self.credited {
            needed_bits.min((want * 8) as u32)
        } else {
            0
        };

        PollResult {
            len: want,
            credited_bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_fills_requested_bits() {
        let source = KernelRngSource::new();
        let mut buf = [0u8; 64];

        let result = source.poll(256, &mut buf);
        assert_eq!(result.len, 32);
        assert_eq!(result.credited_bits, 256);
    }

    #[test]
    fn test_poll_bounded_by_buffer() {
        let source = KernelRngSource::new();
        let mut buf = [0u8; 8];

        let result = source.poll(256, &mut buf);
        assert_eq!(result.len, 8);
        assert_eq!(result.credited_bits, 64);
    }

    #[test]
    fn test_uncredited_source_delivers_zero_credit() {
        let source = KernelRngSource::uncredited();
        let mut buf = [0u8; 32];

        let result = source.poll(128, &mut buf);
        assert_eq!(result.len, 16);
        assert_eq!(result.credited_bits, 0);
        assert_eq!(source.available_entropy_bits(), 0);
    }

    #[test]
    fn test_zero_request_is_noop() {
        let source = KernelRngSource::new();
        let mut buf = [0u8; 8];
        let result = source.poll(0, &mut buf);
        assert_eq!(result.len, 0);
        assert_eq!(result.credited_bits, 0);
    }
}
