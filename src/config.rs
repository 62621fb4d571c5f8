//! Node configuration.
//!
//! A plain serde struct with per-field defaults and environment overrides.
//! The protocol constants in [`crate::constants`] are not configurable;
//! only local concerns (paths, debug chunk sizing) live here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{CHUNK_CACHE_SIZE, CHUNK_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Ledger node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the account store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory scanned for `*.wasm` guest processors at startup.
    #[serde(default = "default_processor_dir")]
    pub processor_dir: PathBuf,

    /// Sync chunk size. Smaller values help debugging; changing this on a
    /// live network is protocol-breaking.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Per-peer chunk cache capacity.
    #[serde(default = "default_chunk_cache_size")]
    pub chunk_cache_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: default_data_dir(),
            processor_dir: default_processor_dir(),
            chunk_size: default_chunk_size(),
            chunk_cache_size: default_chunk_cache_size(),
        }
    }
}

impl NodeConfig {
    /// Load defaults and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = NodeConfig::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `ALDER_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("ALDER_DATA_DIR") {
            self.data_dir = value.into();
        }
        if let Ok(value) = std::env::var("ALDER_PROCESSOR_DIR") {
            self.processor_dir = value.into();
        }
        if let Ok(value) = std::env::var("ALDER_CHUNK_SIZE") {
            self.chunk_size = parse_nonzero("ALDER_CHUNK_SIZE", &value)?;
        }
        if let Ok(value) = std::env::var("ALDER_CHUNK_CACHE_SIZE") {
            self.chunk_cache_size = parse_nonzero("ALDER_CHUNK_CACHE_SIZE", &value)?;
        }
        Ok(())
    }
}

fn parse_nonzero(field: &'static str, value: &str) -> Result<usize, ConfigError> {
    let parsed: usize = value.parse().map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("'{value}' is not a number"),
    })?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be nonzero".to_string(),
        });
    }
    Ok(parsed)
}

fn default_data_dir() -> PathBuf {
    "./data/ledger".into()
}

fn default_processor_dir() -> PathBuf {
    "./processors".into()
}

fn default_chunk_size() -> usize {
    CHUNK_SIZE
}

fn default_chunk_cache_size() -> usize {
    CHUNK_CACHE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.chunk_size, CHUNK_SIZE);
        assert_eq!(config.chunk_cache_size, CHUNK_CACHE_SIZE);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(parse_nonzero("ALDER_CHUNK_SIZE", "0").is_err());
        assert!(parse_nonzero("ALDER_CHUNK_SIZE", "ten").is_err());
        assert_eq!(parse_nonzero("ALDER_CHUNK_SIZE", "64").unwrap(), 64);
    }
}
