//! Daemon configuration.
//!
//! Loaded from an optional TOML file and overridden by command-line
//! flags. Defaults match production operation; tests and unprivileged
//! development runs override the socket paths.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conditioning::HashAlgorithm;
use crate::drng::ManagerConfig;
use crate::rpc::ServerConfig;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EsdmConfig {
    /// User to drop privileges to.
    pub user: String,
    /// Force SP800-90C operation regardless of the kernel FIPS flag.
    pub fips: bool,
    /// DRNG nodes; 0 selects one per CPU, capped at 4.
    pub drng_nodes: usize,
    /// Conditioning hash of the auxiliary pool.
    pub hash: HashAlgorithm,
    /// Privileged socket path.
    pub priv_socket: PathBuf,
    /// Unprivileged socket path.
    pub unpriv_socket: PathBuf,
    /// Initial write-wakeup threshold in bits.
    pub write_wakeup_bits: u32,
    /// Maximum seconds between reseeds.
    pub reseed_max_secs: u32,
    /// Bytes one DRNG may produce before a reseed is due.
    pub max_bytes_without_reseed: u64,
    /// Per-read connection timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// Credit kernel RNG output as entropy.
    pub credit_kernel_rng: bool,
}

impl Default for EsdmConfig {
    fn default() -> Self {
        Self {
            user: "nobody".to_string(),
            fips: false,
            drng_nodes: 0,
            hash: HashAlgorithm::default(),
            priv_socket: PathBuf::from("/var/run/esdm-rpc-priv.socket"),
            unpriv_socket: PathBuf::from("/var/run/esdm-rpc-unpriv.socket"),
            write_wakeup_bits: 896,
            reseed_max_secs: 600,
            max_bytes_without_reseed: 1 << 26,
            read_timeout_ms: 2000,
            credit_kernel_rng: true,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file: {0}")]
    Read(#[from] std::io::Error),
    /// The configuration file could not be parsed.
    #[error("cannot parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

impl EsdmConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user.is_empty() {
            return Err(ConfigError::Invalid("user must not be empty"));
        }
        if self.reseed_max_secs == 0 {
            return Err(ConfigError::Invalid("reseed_max_secs must be positive"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be positive"));
        }
        if self.priv_socket == self.unpriv_socket {
            return Err(ConfigError::Invalid("socket paths must differ"));
        }
        Ok(())
    }

    /// Derives the DRNG manager configuration.
    pub fn manager_config(&self, sp80090c: bool) -> ManagerConfig {
        ManagerConfig {
            nodes: self.drng_nodes,
            sp80090c,
            hash: self.hash,
            max_bytes_without_reseed: self.max_bytes_without_reseed,
            reseed_max_secs: self.reseed_max_secs,
            write_wakeup_bits: self.write_wakeup_bits,
        }
    }

    /// Derives the RPC server configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            priv_path: self.priv_socket.clone(),
            unpriv_path: self.unpriv_socket.clone(),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            ..ServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(EsdmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_reseed_interval_invalid() {
        let config = EsdmConfig {
            reseed_max_secs: 0,
            ..EsdmConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_identical_socket_paths_invalid() {
        let config = EsdmConfig {
            priv_socket: PathBuf::from("/tmp/same.socket"),
            unpriv_socket: PathBuf::from("/tmp/same.socket"),
            ..EsdmConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("esdm.toml");
        std::fs::write(&path, "user = \"esdm\"\nhash = \"sha256\"\n").expect("write");

        let config = EsdmConfig::load(&path).expect("load");
        assert_eq!(config.user, "esdm");
        assert_eq!(config.hash, HashAlgorithm::Sha256);
        assert_eq!(config.reseed_max_secs, 600);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("esdm.toml");
        std::fs::write(&path, "not valid toml [").expect("write");

        assert!(matches!(EsdmConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_manager_config_propagates_fields() {
        let config = EsdmConfig {
            drng_nodes: 2,
            reseed_max_secs: 30,
            ..EsdmConfig::default()
        };
        let mc = config.manager_config(true);
        assert_eq!(mc.nodes, 2);
        assert_eq!(mc.reseed_max_secs, 30);
        assert!(mc.sp80090c);
    }
}
