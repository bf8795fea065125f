use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::storage::CachePolicy;

/// Cache validity as written in configuration: `true` caches forever,
/// `false` or `0` caches for one frame, a number caches for that many
/// milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheSetting {
    Flag(bool),
    Millis(u64),
}

impl Default for CacheSetting {
    fn default() -> Self {
        CacheSetting::Flag(true)
    }
}

impl From<CacheSetting> for CachePolicy {
    fn from(setting: CacheSetting) -> Self {
        match setting {
            CacheSetting::Flag(true) => CachePolicy::Forever,
            CacheSetting::Flag(false) => CachePolicy::Frame,
            CacheSetting::Millis(ms) => CachePolicy::from_millis(ms),
        }
    }
}

/// Configuration of a [`crate::Store`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Log every data error mapped into an error instance at `warn` level.
    pub log_errors: bool,
    /// Validity of models kept by the built-in memory adapter.
    pub memory_cache: CacheSetting,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            log_errors: true,
            memory_cache: CacheSetting::default(),
        }
    }
}

impl StoreConfig {
    /// Configuration without error logging, for production builds.
    pub fn quiet() -> Self {
        Self {
            log_errors: false,
            ..Default::default()
        }
    }

    /// Parse from TOML. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> StoreResult<Self> {
        toml::from_str(input).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string(self).map_err(|e| StoreError::Config(e.to_string()))
    }
}
