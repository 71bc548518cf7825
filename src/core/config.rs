//! Store and scavenging configuration
//!
//! Configuration can be built in code or loaded from TOML:
//!
//! ```toml
//! [store]
//! name = "images"
//! block_size = 512
//! max_size = 10485760
//!
//! [scavenging]
//! max_percent_used_before_scavenging = 0.8
//! percent_used_left_after_scavenging = 0.6
//! ```

use crate::error::{StoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{Validate, ValidationError};

/// Smallest supported block size
pub const MIN_BLOCK_SIZE: u32 = 32;

/// Block size used when none is configured
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Quota used when none is configured (10 MiB)
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Scavenging starts above this share of the effective maximum size
pub const DEFAULT_MAX_PERCENT_BEFORE: f64 = 0.8;

/// Scavenging stops below this share of the effective maximum size
pub const DEFAULT_PERCENT_AFTER: f64 = 0.6;

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_max_size() -> u64 {
    DEFAULT_MAX_SIZE
}

/// Shape of one block store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_block_fits"))]
pub struct StoreConfig {
    /// User-facing store name (sanitized into a namespace)
    #[validate(length(min = 1, max = 200))]
    pub name: String,

    /// Block size in bytes
    #[serde(default = "default_block_size")]
    #[validate(range(min = 32))]
    pub block_size: u32,

    /// Storage quota in bytes
    #[serde(default = "default_max_size")]
    #[validate(range(min = 1))]
    pub max_size: u64,
}

fn validate_block_fits(config: &StoreConfig) -> std::result::Result<(), ValidationError> {
    if config.block_size as u64 > config.max_size {
        let mut err = ValidationError::new("block_size_exceeds_max_size");
        err.message = Some("block size must not exceed max size".into());
        return Err(err);
    }
    Ok(())
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, block_size: u32, max_size: u64) -> Self {
        StoreConfig {
            name: name.into(),
            block_size,
            max_size,
        }
    }

    /// Validate all fields
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }
}

/// Thresholds of the size-based scavenging strategy
///
/// A value of `0.0` selects the default for that threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct ScavengingConfig {
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_percent_used_before_scavenging: f64,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub percent_used_left_after_scavenging: f64,
}

impl Default for ScavengingConfig {
    fn default() -> Self {
        ScavengingConfig {
            max_percent_used_before_scavenging: DEFAULT_MAX_PERCENT_BEFORE,
            percent_used_left_after_scavenging: DEFAULT_PERCENT_AFTER,
        }
    }
}

impl ScavengingConfig {
    pub fn new(before: f64, after: f64) -> Self {
        ScavengingConfig {
            max_percent_used_before_scavenging: before,
            percent_used_left_after_scavenging: after,
        }
    }

    /// Thresholds with zeros replaced by their defaults, validated
    ///
    /// Returns `(before, after)`.
    pub fn resolve(&self) -> Result<(f64, f64)> {
        self.validate()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        let before = if self.max_percent_used_before_scavenging == 0.0 {
            DEFAULT_MAX_PERCENT_BEFORE
        } else {
            self.max_percent_used_before_scavenging
        };
        let after = if self.percent_used_left_after_scavenging == 0.0 {
            DEFAULT_PERCENT_AFTER
        } else {
            self.percent_used_left_after_scavenging
        };

        if after > before {
            return Err(StoreError::InvalidConfig(format!(
                "scavenging stops at {} but starts at {}; the stop threshold must not exceed the start threshold",
                after, before
            )));
        }

        Ok((before, after))
    }
}

/// Complete configuration of a cache store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub store: StoreConfig,

    #[serde(default)]
    pub scavenging: ScavengingConfig,
}

impl CacheConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(text)?;
        config.store.check()?;
        config.scavenging.resolve()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
