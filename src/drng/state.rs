//! Seeding-state machine and process-wide service state.
//!
//! Three latching flags (`min_seeded`, `operational`) plus the
//! non-latching `fully_seeded` track how well the DRNGs are seeded.
//! Read paths use atomics; transitions happen on the reseed path and
//! wake blocked callers through a condition variable.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::{MIN_SEED_BITS, OVERSAMPLE_SEED_BITS, SECURITY_STRENGTH_BITS};

/// Process-wide seeding state and tunables.
pub struct SeedState {
    min_seeded: AtomicBool,
    fully_seeded: AtomicBool,
    operational: AtomicBool,
    sp80090c: bool,
    write_wakeup_bits: AtomicU32,
    reseed_max_secs: AtomicU32,
    exit: AtomicBool,
    gate: Mutex<()>,
    cond: Condvar,
}

impl SeedState {
    /// Creates the initial all-unseeded state.
    pub fn new(sp80090c: bool, write_wakeup_bits: u32, reseed_max_secs: u32) -> Self {
        Self {
            min_seeded: AtomicBool::new(false),
            fully_seeded: AtomicBool::new(false),
            operational: AtomicBool::new(false),
            sp80090c,
            write_wakeup_bits: AtomicU32::new(write_wakeup_bits),
            reseed_max_secs: AtomicU32::new(reseed_max_secs),
            exit: AtomicBool::new(false),
            gate: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Entropy a full seed must provide, with SP800-90C oversampling.
    pub fn seed_requirement_bits(&self) -> u32 {
        if self.sp80090c {
            SECURITY_STRENGTH_BITS + OVERSAMPLE_SEED_BITS
        } else {
            SECURITY_STRENGTH_BITS
        }
    }

    /// Entropy required for the minimally-seeded level.
    pub fn min_seed_bits(&self) -> u32 {
        MIN_SEED_BITS
    }

    /// Records a successful reseed with `credited_bits` of entropy.
    pub fn note_reseed(&self, credited_bits: u32) {
        if credited_bits >= self.min_seed_bits() {
            self.min_seeded.store(true, Ordering::Release);
        }
        if credited_bits >= self.seed_requirement_bits() {
            self.fully_seeded.store(true, Ordering::Release);
            if !self.operational.swap(true, Ordering::AcqRel) {
                tracing::info!("ESDM operational: DRNG fully seeded");
            }
        }
        self.notify();
    }

    /// Records a prediction-resistant pull that drained the sources
    /// below the full-seed level.
    pub fn note_pr_drain(&self) {
        self.fully_seeded.store(false, Ordering::Release);
    }

    /// True once any DRNG has been fully seeded; latching.
    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::Acquire)
    }

    /// True while a DRNG currently holds a full seed.
    pub fn is_fully_seeded(&self) -> bool {
        self.fully_seeded.load(Ordering::Acquire)
    }

    /// True once any DRNG reached the minimum seed level; latching.
    pub fn is_min_seeded(&self) -> bool {
        self.min_seeded.load(Ordering::Acquire)
    }

    /// True when operating SP800-90C compliant.
    pub fn sp80090c(&self) -> bool {
        self.sp80090c
    }

    /// Returns the write-wakeup threshold in bits.
    pub fn write_wakeup_bits(&self) -> u32 {
        self.write_wakeup_bits.load(Ordering::Relaxed)
    }

    /// Sets the write-wakeup threshold in bits.
    pub fn set_write_wakeup_bits(&self, bits: u32) {
        self.write_wakeup_bits.store(bits, Ordering::Relaxed);
    }

    /// Returns the maximum reseed interval in seconds.
    pub fn reseed_max_secs(&self) -> u32 {
        self.reseed_max_secs.load(Ordering::Relaxed)
    }

    /// Sets the maximum reseed interval in seconds.
    pub fn set_reseed_max_secs(&self, secs: u32) {
        self.reseed_max_secs.store(secs, Ordering::Relaxed);
    }

    /// Signals shutdown and wakes all blocked callers.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
        self.notify();
    }

    /// True once shutdown has been requested.
    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Sleeps until a state transition or `timeout`, whichever first.
    pub fn wait_tick(&self, timeout: Duration) {
        let guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .cond
            .wait_timeout(guard, timeout)
            .map(|(g, _)| g)
            .unwrap_or_else(|e| e.into_inner().0);
    }

    fn notify(&self) {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_all();
    }
}

/// Point-in-time view of the service state for status reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSnapshot {
    /// At least one DRNG has been fully seeded since startup.
    pub operational: bool,
    /// A DRNG currently holds a full seed.
    pub fully_seeded: bool,
    /// A DRNG has reached the minimum seed level.
    pub min_seeded: bool,
    /// SP800-90C mode is active.
    pub sp80090c: bool,
    /// Entropy available across all sources and the aux pool, in bits.
    pub avail_entropy_bits: u32,
    /// Entropy credited to the aux pool, in bits.
    pub avail_entropy_aux_bits: u32,
    /// Aux pool width in bits.
    pub poolsize_aux_bits: u32,
    /// Highest DRNG reseed generation.
    pub generation: u64,
    /// Write-wakeup threshold in bits.
    pub write_wakeup_bits: u32,
    /// Maximum reseed interval in seconds.
    pub reseed_max_secs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_all_false() {
        let state = SeedState::new(false, 896, 600);
        assert!(!state.is_operational());
        assert!(!state.is_fully_seeded());
        assert!(!state.is_min_seeded());
        assert!(!state.exiting());
    }

    #[test]
    fn test_min_seed_transition() {
        let state = SeedState::new(false, 896, 600);
        state.note_reseed(128);

        assert!(state.is_min_seeded());
        assert!(!state.is_fully_seeded());
        assert!(!state.is_operational());
    }

    #[test]
    fn test_full_seed_transition() {
        let state = SeedState::new(false, 896, 600);
        state.note_reseed(256);

        assert!(state.is_min_seeded());
        assert!(state.is_fully_seeded());
        assert!(state.is_operational());
    }

    #[test]
    fn test_operational_latches_through_pr_drain() {
        let state = SeedState::new(false, 896, 600);
        state.note_reseed(256);
        state.note_pr_drain();

        assert!(!state.is_fully_seeded());
        assert!(state.is_operational());
        assert!(state.is_min_seeded());

        // Re-asserts on the next full reseed.
        state.note_reseed(256);
        assert!(state.is_fully_seeded());
    }

    #[test]
    fn test_sp80090c_oversampling() {
        let regular = SeedState::new(false, 896, 600);
        let fips = SeedState::new(true, 896, 600);

        assert_eq!(regular.seed_requirement_bits(), 256);
        assert_eq!(fips.seed_requirement_bits(), 384);

        // A regular full seed is not enough under oversampling.
        fips.note_reseed(256);
        assert!(!fips.is_fully_seeded());
        fips.note_reseed(384);
        assert!(fips.is_fully_seeded());
    }

    #[test]
    fn test_tunables_roundtrip() {
        let state = SeedState::new(false, 896, 600);
        state.set_write_wakeup_bits(4096);
        state.set_reseed_max_secs(30);

        assert_eq!(state.write_wakeup_bits(), 4096);
        assert_eq!(state.reseed_max_secs(), 30);
    }

    #[test]
    fn test_exit_wakes_waiters() {
        use std::sync::Arc;

        let state = Arc::new(SeedState::new(false, 896, 600));
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                while !state.exiting() {
                    state.wait_tick(Duration::from_secs(5));
                }
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        state.request_exit();
        waiter.join().expect("waiter thread panicked");
    }
}
