//! Dispatch configuration (`[dispatch]` table of a TOML file)
//!
//! ```toml
//! [dispatch]
//! pool_size = 2
//! thread_name_prefix = "engine-worker"
//! ```
//!
//! `SKEIN_POOL_SIZE` in the environment overrides `pool_size`.

use crate::pool::{resolve_pool_size, DEFAULT_NAME_PREFIX};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable overriding the pool size hint
pub const POOL_SIZE_ENV: &str = "SKEIN_POOL_SIZE";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override is not an integer
    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Pool size hint; zero or less means one worker per CPU
    pub pool_size: i64,

    /// Worker fibers are named `{prefix}-{index}`
    pub thread_name_prefix: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            thread_name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    dispatch: DispatchConfig,
}

impl DispatchConfig {
    /// Parse the `[dispatch]` table out of a TOML document.
    ///
    /// Missing table or keys fall back to defaults; other tables are ignored.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.dispatch)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `SKEIN_POOL_SIZE` from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let value = std::env::var(POOL_SIZE_ENV).ok();
        self.apply_pool_size_override(value.as_deref())
    }

    fn apply_pool_size_override(&mut self, value: Option<&str>) -> Result<(), ConfigError> {
        let Some(value) = value else {
            return Ok(());
        };
        self.pool_size = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv {
                var: POOL_SIZE_ENV,
                value: value.to_string(),
            })?;
        Ok(())
    }

    /// Worker count this configuration yields
    pub fn resolved_pool_size(&self) -> usize {
        resolve_pool_size(self.pool_size)
    }
}
