//! DRNG instances and their manager.
//!
//! The manager owns one seeded DRNG per logical node, orchestrates
//! seeding from the entropy sources and the auxiliary pool, and enforces
//! the seeding-state transitions observable through the RPC surface.

mod instance;
mod manager;
mod state;

pub use instance::Drng;
pub use manager::{DrngManager, ManagerConfig};
pub use state::{SeedState, StatusSnapshot};

use thiserror::Error;

/// DRNG security strength in bits.
pub const SECURITY_STRENGTH_BITS: u32 = 256;

/// Additional seed entropy required per reseed in SP800-90C mode.
pub const OVERSAMPLE_SEED_BITS: u32 = 128;

/// Minimum seed threshold for the minimally-seeded level.
pub const MIN_SEED_BITS: u32 = 128;

/// Maximum bytes a single generate request may ask for.
pub const MAX_RANDOM_REQUEST: usize = 65536;

/// Bytes produced per DRBG invocation before reseed thresholds are
/// re-checked.
pub(crate) const GENERATE_CHUNK: usize = 4096;

/// Errors returned by the DRNG manager.
#[derive(Debug, Error)]
pub enum EsdmError {
    /// Not enough entropy is available right now; the caller may retry.
    #[error("insufficient entropy, try again")]
    TryAgain,

    /// The request exceeds the per-call byte limit.
    #[error("request of {requested} bytes exceeds the {max} byte limit")]
    Oversized {
        /// Bytes the caller asked for.
        requested: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The service is shutting down; blocked callers are woken with this.
    #[error("service is shutting down")]
    ShuttingDown,
}
