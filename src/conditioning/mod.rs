//! Entropy conditioning via cryptographic hashing.
//!
//! This module folds raw entropy into a fixed-width pool using a
//! cryptographic hash (the "conditioner") and accounts for the entropy
//! credited to the pool contents. Extraction produces conditioned seed
//! material for DRNG (re)seeding.

mod digest;
mod pool;

pub use digest::{Conditioner, HashAlgorithm, Seed};
pub use pool::AuxPool;
