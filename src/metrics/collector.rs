//! Metrics collection and registry.

use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use thiserror::Error;

use crate::drng::StatusSnapshot;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registry or encoding failure.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Prometheus metrics registry for the entropy service.
pub struct MetricsRegistry {
    registry: Registry,

    operational: IntGauge,
    fully_seeded: IntGauge,
    min_seeded: IntGauge,
    sp80090c: IntGauge,
    avail_entropy_bits: IntGauge,
    aux_pool_entropy_bits: IntGauge,
    aux_poolsize_bits: IntGauge,
    drng_generation: IntGauge,
}

impl MetricsRegistry {
    /// Creates a registry with all service metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let operational = IntGauge::new(
            "esdm_operational",
            "1 once any DRNG has been fully seeded since startup",
        )?;
        let fully_seeded = IntGauge::new(
            "esdm_fully_seeded",
            "1 while a DRNG currently holds a full seed",
        )?;
        let min_seeded = IntGauge::new(
            "esdm_min_seeded",
            "1 once the minimum seed level was reached",
        )?;
        let sp80090c = IntGauge::new("esdm_sp80090c", "1 when SP800-90C mode is active")?;
        let avail_entropy_bits = IntGauge::new(
            "esdm_avail_entropy_bits",
            "Entropy available across sources and aux pool in bits",
        )?;
        let aux_pool_entropy_bits = IntGauge::new(
            "esdm_aux_pool_entropy_bits",
            "Entropy credited to the aux pool in bits",
        )?;
        let aux_poolsize_bits =
            IntGauge::new("esdm_aux_poolsize_bits", "Aux pool width in bits")?;
        let drng_generation =
            IntGauge::new("esdm_drng_generation", "Highest DRNG reseed generation")?;

        registry.register(Box::new(operational.clone()))?;
        registry.register(Box::new(fully_seeded.clone()))?;
        registry.register(Box::new(min_seeded.clone()))?;
        registry.register(Box::new(sp80090c.clone()))?;
        registry.register(Box::new(avail_entropy_bits.clone()))?;
        registry.register(Box::new(aux_pool_entropy_bits.clone()))?;
        registry.register(Box::new(aux_poolsize_bits.clone()))?;
        registry.register(Box::new(drng_generation.clone()))?;

        Ok(Self {
            registry,
            operational,
            fully_seeded,
            min_seeded,
            sp80090c,
            avail_entropy_bits,
            aux_pool_entropy_bits,
            aux_poolsize_bits,
            drng_generation,
        })
    }

    /// Updates all metrics from a status snapshot.
    pub fn update(&self, snapshot: &StatusSnapshot) {
        self.operational.set(i64::from(snapshot.operational));
        self.fully_seeded.set(i64::from(snapshot.fully_seeded));
        self.min_seeded.set(i64::from(snapshot.min_seeded));
        self.sp80090c.set(i64::from(snapshot.sp80090c));
        self.avail_entropy_bits
            .set(i64::from(snapshot.avail_entropy_bits));
        self.aux_pool_entropy_bits
            .set(i64::from(snapshot.avail_entropy_aux_bits));
        self.aux_poolsize_bits
            .set(i64::from(snapshot.poolsize_aux_bits));
        self.drng_generation.set(snapshot.generation as i64);
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
