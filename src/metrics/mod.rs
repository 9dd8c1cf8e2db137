//! Prometheus metrics for the entropy service.
//!
//! The collector mirrors the status snapshot into Prometheus gauges and
//! counters; the optional HTTP exporter behind the `metrics` feature
//! serves them for scraping.
//!
//! # Metrics Exposed
//!
//! - `esdm_operational` - 1 once any DRNG has been fully seeded
//! - `esdm_fully_seeded` - 1 while a DRNG holds a full seed
//! - `esdm_min_seeded` - 1 once the minimum seed level was reached
//! - `esdm_sp80090c` - 1 when SP800-90C mode is active
//! - `esdm_avail_entropy_bits` - entropy across sources and aux pool
//! - `esdm_aux_pool_entropy_bits` - entropy credited to the aux pool
//! - `esdm_aux_poolsize_bits` - aux pool width
//! - `esdm_drng_generation` - highest DRNG reseed generation

mod collector;
#[cfg(feature = "metrics")]
mod server;

pub use collector::{MetricsError, MetricsRegistry};
#[cfg(feature = "metrics")]
pub use server::{MetricsServer, MetricsServerConfig};
