//! Store configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. [`StoreConfig::load_for_root`] reads `<root>/store.toml`
//! when present and then applies `STAMPSTORE_*` environment overrides.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigurationError;
use crate::spine::Backend;

pub const CONFIG_FILE: &str = "store.toml";

/// Whether committed stamps with identical fields share one nid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StampDedup {
    /// Every stamp gets a fresh random UUID.
    Never,
    /// Committed stamps derive their UUID from their fields, so re-importing
    /// the same (status, time, author, module, path) reuses the stamp.
    #[default]
    Committed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub spine_size: usize,
    pub io_permits: usize,
    pub workers: usize,
    pub coordinate_cache_capacity: usize,
    pub calculator_cache_capacity: usize,
    pub stamp_cache_capacity: usize,
    pub max_cas_retries: u32,
    pub stamp_dedup: StampDedup,
    pub backend: Backend,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            spine_size: 1024,
            io_permits: 4,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            coordinate_cache_capacity: 1024,
            calculator_cache_capacity: 256,
            stamp_cache_capacity: 4096,
            max_cas_retries: 1 << 20,
            stamp_dedup: StampDedup::default(),
            backend: Backend::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigurationError> {
        let config: StoreConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigurationError::UnusableRoot {
            path: path.to_path_buf(),
            reason: format!("failed to read configuration: {e}"),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads `<root>/store.toml` if it exists, defaults otherwise, then
    /// applies environment overrides.
    pub fn load_for_root(root: &Path) -> Result<Self, ConfigurationError> {
        let path = root.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `STAMPSTORE_WORKERS` and `STAMPSTORE_IO_PERMITS`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("STAMPSTORE_WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(workers) => self.workers = workers,
                Err(err) => tracing::warn!("invalid STAMPSTORE_WORKERS, ignoring: {err}"),
            }
        }
        if let Ok(raw) = std::env::var("STAMPSTORE_IO_PERMITS") {
            match raw.trim().parse::<usize>() {
                Ok(permits) => self.io_permits = permits,
                Err(err) => tracing::warn!("invalid STAMPSTORE_IO_PERMITS, ignoring: {err}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.spine_size == 0 || !self.spine_size.is_power_of_two() {
            return Err(ConfigurationError::InvalidSpineSize(self.spine_size));
        }
        if self.io_permits == 0 {
            return Err(ConfigurationError::InvalidPermitCount(self.io_permits));
        }
        if self.workers == 0 {
            return Err(ConfigurationError::InvalidWorkerCount(self.workers));
        }
        if self.coordinate_cache_capacity == 0 {
            return Err(ConfigurationError::InvalidCacheCapacity(
                "coordinate_cache_capacity",
            ));
        }
        if self.calculator_cache_capacity == 0 {
            return Err(ConfigurationError::InvalidCacheCapacity(
                "calculator_cache_capacity",
            ));
        }
        if self.stamp_cache_capacity == 0 {
            return Err(ConfigurationError::InvalidCacheCapacity(
                "stamp_cache_capacity",
            ));
        }
        if self.max_cas_retries == 0 {
            return Err(ConfigurationError::InvalidRetryBound(self.max_cas_retries));
        }
        Ok(())
    }
}
