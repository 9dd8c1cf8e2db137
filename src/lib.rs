//! Entropy Source and DRNG Manager (ESDM)
//!
//! A userspace service that collects entropy from pluggable sources,
//! conditions it into an auxiliary pool, drives per-node ChaCha20 DRNGs
//! and serves cryptographically strong random bytes to local clients
//! over two Unix-domain RPC sockets.
//!
//! # Architecture
//!
//! The system follows an explicit data flow:
//!
//! ```text
//! sources → aux pool (credited) → DRNG seeding → DRNG output → RPC response
//! ```
//!
//! and control flow:
//!
//! ```text
//! RPC dispatch → manager → (maybe reseed) → DRNG generate → framed reply
//! ```
//!
//! # Design Principles
//!
//! - **Entropy accounting**: the aux pool's credit can never diverge
//!   from its contents; one mutex guards both.
//! - **Latching state**: `operational` never clears once a DRNG has
//!   been fully seeded; `fully_seeded` may flip on draining pulls.
//! - **Bounded connections**: fixed per-connection buffers, a per-read
//!   timeout and no heap allocation while a request is in flight.
//! - **Privilege separation**: a retained-privilege reaper cleans up
//!   what the privilege-dropped server cannot.
//!
//! # Example
//!
//! ```no_run
//! use esdm::{
//!     drng::{DrngManager, ManagerConfig},
//!     sources::{KernelRngSource, SourceRegistry},
//! };
//!
//! let mut sources = SourceRegistry::new();
//! sources.register(Box::new(KernelRngSource::new()));
//!
//! let manager = DrngManager::new(ManagerConfig::default(), sources);
//!
//! let mut buf = [0u8; 32];
//! let written = manager.get_random_bytes_full(&mut buf).unwrap();
//! assert_eq!(written, 32);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod conditioning;
pub mod config;
pub mod daemon;
pub mod drng;
pub mod metrics;
pub mod rpc;
pub mod sources;

// Re-export commonly used types at crate root
pub use conditioning::{AuxPool, Conditioner, HashAlgorithm, Seed};
pub use config::EsdmConfig;
pub use drng::{DrngManager, EsdmError, ManagerConfig, SeedState, StatusSnapshot};
pub use rpc::{RpcServer, RpcService, ServerConfig, SocketKind};
pub use sources::{EntropySource, SourceRegistry};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
