//! # Duchy Configuration
//!
//! Loaded from a TOML file (default `duchy.toml`). Every section except the
//! top-level identity has defaults, so a minimal file names the duchy, its
//! role, the ring and the endpoints.
//!
//! ```toml
//! duchy_name = "Alsace"
//! role = "secondary"
//! ring = ["Alsace", "Bavaria", "Carinthia"]
//!
//! [kingdom]
//! url = "http://kingdom:8080"
//!
//! [metric_values]
//! url = "http://localhost:9090"
//!
//! [crypto]
//! command = "/usr/local/bin/llv1-crypto"
//!
//! [peers]
//! Bavaria = "http://bavaria:8080"
//! ```

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::clients::CryptoKeySet;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use duchy_core::{ClaimOrder, Role, StorageConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Database used when neither the command line nor the config names one.
pub const DEFAULT_DATABASE: &str = "duchy.redb";

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MillSection {
    /// Number of concurrent mill tasks.
    pub count: usize,
    /// Mill ids are `{duchy_name}-{id_prefix}-{index}`; must be unique across processes
    /// sharing a database.
    pub id_prefix: String,
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
}

impl Default for MillSection {
    fn default() -> Self {
        Self {
            count: 1,
            id_prefix: "mill".to_string(),
            poll_interval_ms: 1_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeraldSection {
    pub poll_interval_ms: u64,
}

impl Default for HeraldSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub lock_duration_secs: u64,
    pub claim_order: ClaimOrder,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            lock_duration_secs: duchy_core::storage::DEFAULT_LOCK_DURATION.as_secs(),
            claim_order: ClaimOrder::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSection {
    pub url: String,
}

/// Crypto engine command and key material (keys in base64).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CryptoSection {
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub curve_id: i64,
    pub own_public_key: String,
    pub own_private_key: String,
    pub client_public_key: String,
}

impl CryptoSection {
    /// Decode the configured key material.
    pub fn key_set(&self) -> Result<CryptoKeySet, ConfigError> {
        let decode = |name: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| ConfigError::Invalid(format!("crypto.{}: {}", name, e)))
        };
        Ok(CryptoKeySet {
            own_public_key: decode("own_public_key", &self.own_public_key)?,
            own_private_key: decode("own_private_key", &self.own_private_key)?,
            client_public_key: decode("client_public_key", &self.client_public_key)?,
            curve_id: self.curve_id,
        })
    }
}

// =============================================================================
// DUCHY CONFIG
// =============================================================================

/// Complete configuration of one duchy process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuchyConfig {
    pub duchy_name: String,
    /// The role this duchy plays in every computation it creates.
    pub role: Role,
    /// All duchies in protocol order, this one included. Results flow to the
    /// next duchy in the ring.
    pub ring: Vec<String>,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default)]
    pub mill: MillSection,
    #[serde(default)]
    pub herald: HeraldSection,
    #[serde(default)]
    pub storage: StorageSection,
    pub kingdom: EndpointSection,
    pub metric_values: EndpointSection,
    /// Base URL of each peer duchy's control service.
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
    #[serde(default)]
    pub crypto: CryptoSection,
}

impl DuchyConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: DuchyConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.duchy_name.is_empty() {
            return Err(ConfigError::Invalid("duchy_name is empty".to_string()));
        }
        if !self.ring.contains(&self.duchy_name) {
            return Err(ConfigError::Invalid(format!(
                "duchy {} is not in the ring",
                self.duchy_name
            )));
        }
        if self.ring.len() < 2 {
            return Err(ConfigError::Invalid(
                "the ring needs at least two duchies".to_string(),
            ));
        }
        if self.mill.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "mill.chunk_size must be greater than zero".to_string(),
            ));
        }
        let next = self.next_duchy();
        if !self.peers.contains_key(next) {
            return Err(ConfigError::Invalid(format!(
                "no peer URL for next duchy {}",
                next
            )));
        }
        Ok(())
    }

    /// The duchy after this one in the ring.
    #[must_use]
    pub fn next_duchy(&self) -> &str {
        let position = self
            .ring
            .iter()
            .position(|d| d == &self.duchy_name)
            .unwrap_or(0);
        self.ring
            .get((position + 1) % self.ring.len().max(1))
            .map(String::as_str)
            .unwrap_or(self.duchy_name.as_str())
    }

    /// Every duchy except this one, in ring order.
    #[must_use]
    pub fn other_duchies(&self) -> Vec<String> {
        self.ring
            .iter()
            .filter(|d| *d != &self.duchy_name)
            .cloned()
            .collect()
    }

    /// Storage settings derived from the ring and the storage section.
    #[must_use]
    pub fn storage_config(&self) -> StorageConfig {
        let mut config = StorageConfig::new(self.other_duchies());
        config.lock_duration = Duration::from_secs(self.storage.lock_duration_secs);
        config.claim_order = self.storage.claim_order;
        config
    }

    /// Ids of the mill tasks this process runs.
    #[must_use]
    pub fn mill_ids(&self) -> Vec<String> {
        (0..self.mill.count.max(1))
            .map(|idx| format!("{}-{}-{}", self.duchy_name, self.mill.id_prefix, idx))
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
