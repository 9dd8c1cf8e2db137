//! DRNG manager.
//!
//! Owns one DRNG per logical node, the auxiliary pool and the source
//! registry, and implements the four output paths plus the reseed
//! algorithm with its entropy accounting.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::conditioning::{AuxPool, HashAlgorithm};
use crate::sources::{SeedBuffer, SourceRegistry};

use super::instance::Drng;
use super::state::{SeedState, StatusSnapshot};
use super::{EsdmError, GENERATE_CHUNK, MAX_RANDOM_REQUEST};

/// Configuration for the DRNG manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Number of DRNG nodes; 0 selects one per CPU, capped at 4.
    pub nodes: usize,
    /// SP800-90C oversampling mode, static per run.
    pub sp80090c: bool,
    /// Conditioning hash for the auxiliary pool.
    pub hash: HashAlgorithm,
    /// Bytes one DRNG may produce before a reseed is due.
    pub max_bytes_without_reseed: u64,
    /// Maximum seconds between reseeds.
    pub reseed_max_secs: u32,
    /// Initial write-wakeup threshold in bits.
    pub write_wakeup_bits: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            nodes: 0,
            sp80090c: false,
            hash: HashAlgorithm::default(),
            max_bytes_without_reseed: 1 << 26,
            reseed_max_secs: 600,
            write_wakeup_bits: 896,
        }
    }
}

enum ReseedMode {
    /// Reseed if the gathered entropy suffices, otherwise bank it in the
    /// aux pool and continue.
    Opportunistic,
    /// As opportunistic, but the caller requires a full seed and is told
    /// to retry when the entropy does not suffice.
    Required,
    /// Prediction-resistant pull: rekey with whatever was gathered and
    /// report how much that was.
    PredictionResistant,
}

enum ReseedOutcome {
    /// Full reseed with the credited bits.
    Seeded(u32),
    /// Partial rekey (PR only) with the credited bits.
    Partial(u32),
    /// Not enough entropy; nothing was drained from the pool.
    Deferred,
    /// No entropy at all was available (PR only).
    Empty,
}

/// Orchestrates seeding and output across all DRNG nodes.
pub struct DrngManager {
    drngs: Vec<Mutex<Drng>>,
    pool: AuxPool,
    sources: SourceRegistry,
    state: SeedState,
    max_bytes_without_reseed: u64,
}

impl DrngManager {
    /// Creates a manager with the given configuration and sources.
    pub fn new(config: ManagerConfig, sources: SourceRegistry) -> Self {
        let nodes = if config.nodes == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(4)
        } else {
            config.nodes
        };

        tracing::info!(
            nodes,
            sp80090c = config.sp80090c,
            hash = ?config.hash,
            "Initializing DRNG manager"
        );

        Self {
            drngs: (0..nodes).map(|_| Mutex::new(Drng::new())).collect(),
            pool: AuxPool::new(config.hash),
            sources,
            state: SeedState::new(
                config.sp80090c,
                config.write_wakeup_bits,
                config.reseed_max_secs,
            ),
            max_bytes_without_reseed: config.max_bytes_without_reseed,
        }
    }

    /// Returns the process-wide seeding state.
    pub fn state(&self) -> &SeedState {
        &self.state
    }

    /// Returns the auxiliary pool.
    pub fn pool(&self) -> &AuxPool {
        &self.pool
    }

    /// Returns the number of DRNG nodes.
    pub fn nodes(&self) -> usize {
        self.drngs.len()
    }

    /// Entropy available across all sources and the aux pool, in bits.
    pub fn avail_entropy_bits(&self) -> u32 {
        self.sources
            .available_entropy_bits()
            .saturating_add(self.pool.available_entropy())
    }

    /// Builds a status snapshot for the RPC and shared-memory surfaces.
    pub fn status(&self) -> StatusSnapshot {
        let generation = self
            .drngs
            .iter()
            .map(|d| self.lock_drng(d).generation())
            .max()
            .unwrap_or(0);

        StatusSnapshot {
            operational: self.state.is_operational(),
            fully_seeded: self.state.is_fully_seeded(),
            min_seeded: self.state.is_min_seeded(),
            sp80090c: self.state.sp80090c(),
            avail_entropy_bits: self.avail_entropy_bits(),
            avail_entropy_aux_bits: self.pool.available_entropy(),
            poolsize_aux_bits: self.pool.poolsize(),
            generation,
            write_wakeup_bits: self.state.write_wakeup_bits(),
            reseed_max_secs: self.state.reseed_max_secs(),
        }
    }

    fn lock_drng<'a>(&self, drng: &'a Mutex<Drng>) -> MutexGuard<'a, Drng> {
        drng.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn node(&self) -> &Mutex<Drng> {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        &self.drngs[(hasher.finish() as usize) % self.drngs.len()]
    }

    fn check_len(&self, requested: usize) -> Result<(), EsdmError> {
        if requested > MAX_RANDOM_REQUEST {
            return Err(EsdmError::Oversized {
                requested,
                max: MAX_RANDOM_REQUEST,
            });
        }
        Ok(())
    }

    /// Runs the reseed algorithm against one locked DRNG.
    ///
    /// Sources are polled first; the aux pool is only drained when the
    /// reseed actually commits, so an aborted attempt leaves the pool
    /// credited. Entropy gathered by an aborted attempt is banked in the
    /// pool instead of being discarded.
    fn reseed_drng(&self, drng: &mut Drng, mode: ReseedMode) -> ReseedOutcome {
        let need = self.state.seed_requirement_bits();
        let mut seed = SeedBuffer::new();
        self.sources.poll_all(need, &mut seed);

        let from_sources = seed.credited_bits();
        let total = from_sources.saturating_add(self.pool.available_entropy());

        if total >= need {
            let (aux_seed, aux_bits) = self.pool.extract(need);
            seed.push(aux_seed.as_bytes(), aux_bits);

            let credited = seed.credited_bits();
            drng.reseed(seed.data(), credited);
            self.state.note_reseed(credited);
            return ReseedOutcome::Seeded(credited);
        }

        match mode {
            ReseedMode::PredictionResistant => {
                if total == 0 {
                    return ReseedOutcome::Empty;
                }
                let (aux_seed, aux_bits) = self.pool.extract(need);
                seed.push(aux_seed.as_bytes(), aux_bits);

                let credited = seed.credited_bits();
                drng.mix(seed.data());
                // A partial pull can still reach the minimum seed level,
                // but it drains the sources below a full seed.
                self.state.note_reseed(credited);
                self.state.note_pr_drain();
                ReseedOutcome::Partial(credited)
            }
            ReseedMode::Opportunistic | ReseedMode::Required => {
                self.pool.insert(seed.data(), from_sources);
                ReseedOutcome::Deferred
            }
        }
    }

    fn fill(&self, drng: &mut Drng, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(GENERATE_CHUNK) {
            if drng.needs_reseed(self.max_bytes_without_reseed, self.state.reseed_max_secs()) {
                let _ = self.reseed_drng(drng, ReseedMode::Opportunistic);
            }
            drng.generate(chunk);
        }
    }

    /// Produces random bytes without a seeding guarantee.
    ///
    /// The caller accepts best-effort strength; a due reseed is attempted
    /// opportunistically before output.
    pub fn get_random_bytes(&self, buf: &mut [u8]) -> Result<usize, EsdmError> {
        self.check_len(buf.len())?;

        let mut drng = self.lock_drng(self.node());
        self.fill(&mut drng, buf);
        Ok(buf.len())
    }

    /// Produces random bytes from a fully-seeded DRNG.
    ///
    /// Blocks cooperatively until the service has been fully seeded at
    /// least once, then requires this node to hold a full seed.
    pub fn get_random_bytes_full(&self, buf: &mut [u8]) -> Result<usize, EsdmError> {
        self.check_len(buf.len())?;
        self.wait_ready(SeedState::is_operational)?;
        self.generate_seeded(buf, self.state.seed_requirement_bits())
    }

    /// Produces random bytes from an at least minimally seeded DRNG.
    pub fn get_random_bytes_min(&self, buf: &mut [u8]) -> Result<usize, EsdmError> {
        self.check_len(buf.len())?;
        self.wait_ready(SeedState::is_min_seeded)?;
        self.generate_seeded(buf, self.state.min_seed_bits())
    }

    fn generate_seeded(&self, buf: &mut [u8], threshold_bits: u32) -> Result<usize, EsdmError> {
        let mut drng = self.lock_drng(self.node());

        if drng.seeded_bits() < threshold_bits
            || drng.needs_reseed(self.max_bytes_without_reseed, self.state.reseed_max_secs())
        {
            match self.reseed_drng(&mut drng, ReseedMode::Required) {
                ReseedOutcome::Seeded(_) => {}
                _ => return Err(EsdmError::TryAgain),
            }
        }

        drng.generate(buf);
        Ok(buf.len())
    }

    /// Prediction-resistant output: reseeds from fresh entropy before
    /// generating and never returns more bytes than entropy was pulled.
    ///
    /// May return 0 bytes when the sources are drained.
    pub fn get_random_bytes_pr(&self, buf: &mut [u8]) -> Result<usize, EsdmError> {
        self.check_len(buf.len())?;

        let mut drng = self.lock_drng(self.node());
        let pulled_bits = match self.reseed_drng(&mut drng, ReseedMode::PredictionResistant) {
            ReseedOutcome::Seeded(bits) | ReseedOutcome::Partial(bits) => bits,
            ReseedOutcome::Empty | ReseedOutcome::Deferred => return Ok(0),
        };

        let n = buf.len().min(pulled_bits as usize / 8);
        drng.generate(&mut buf[..n]);
        Ok(n)
    }

    /// Flags every DRNG for a reseed before its next generate.
    pub fn force_reseed(&self) {
        for drng in &self.drngs {
            self.lock_drng(drng).request_reseed();
        }
        tracing::info!("Forced reseed of all DRNGs");
    }

    /// Attempts to bring every node to a full seed.
    ///
    /// Called at startup and from blocked `full`/`min` callers; leaves
    /// gathered entropy banked in the pool when a node cannot be seeded
    /// yet.
    pub fn try_seed(&self) {
        let need = self.state.seed_requirement_bits();
        for drng in &self.drngs {
            let mut drng = self.lock_drng(drng);
            if drng.seeded_bits() < need {
                let _ = self.reseed_drng(&mut drng, ReseedMode::Opportunistic);
            }
        }
    }

    fn wait_ready(&self, ready: fn(&SeedState) -> bool) -> Result<(), EsdmError> {
        loop {
            if ready(&self.state) {
                return Ok(());
            }
            if self.state.exiting() {
                return Err(EsdmError::ShuttingDown);
            }

            self.try_seed();
            if ready(&self.state) {
                return Ok(());
            }

            self.state.wait_tick(Duration::from_millis(100));
        }
    }

    /// Requests shutdown: wakes blocked callers and finalizes sources.
    pub fn shutdown(&self) {
        self.state.request_exit();
        self.sources.fini_all();
    }
}
