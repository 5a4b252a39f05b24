//! Configuration file support for a Keel node.
//!
//! Loads optional `keel.toml` from the data directory. If no config file
//! exists, defaults are used.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::consensus::dag::Address;
use crate::consensus::witnesses::Committee;
use crate::consensus::ConsensusError;

/// Errors turning configuration values into protocol types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("witness {index} is not a 32-byte hex address: {value}")]
    InvalidAddress { index: usize, value: String },
    #[error("invalid genesis committee: {0}")]
    Committee(#[from] ConsensusError),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub consensus: ConsensusConfig,
    pub storage: StorageConfig,
}

/// Consensus configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Network name; part of the genesis unit
    pub network: String,
    /// The 12 genesis witnesses as hex addresses
    pub genesis_committee: Vec<String>,
    pub event_channel_capacity: usize,
    pub max_pending_units: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            network: "keel-dev".into(),
            genesis_committee: (0..crate::constants::COMMITTEE_SIZE)
                .map(|i| hex::encode(dev_witness(i as u8).0))
                .collect(),
            event_channel_capacity: crate::constants::STABILITY_EVENT_CAPACITY,
            max_pending_units: crate::constants::MAX_PENDING_UNITS,
        }
    }
}

/// Storage configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Flush sled to disk after every stability batch
    pub flush_after_batch: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: "./keel-data".into(),
            flush_after_batch: true,
        }
    }
}

/// Deterministic development witness address `n`.
pub fn dev_witness(n: u8) -> Address {
    Address(crate::hash_domain(b"keel.dev_witness", &[n]))
}

impl KeelConfig {
    /// Load configuration from `keel.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("keel.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Parse the configured genesis witnesses into a committee.
    pub fn parse_genesis_committee(&self) -> Result<Committee, ConfigError> {
        let addresses = self
            .consensus
            .genesis_committee
            .iter()
            .enumerate()
            .map(|(index, value)| {
                let invalid = || ConfigError::InvalidAddress {
                    index,
                    value: value.clone(),
                };
                let bytes = hex::decode(value.trim()).map_err(|_| invalid())?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
                Ok(Address(bytes))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Committee::new(addresses)?)
    }
}
