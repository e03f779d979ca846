//! TOML configuration for the scheduler environment

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default wall-clock budget between driver yields to the host loop
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 250;

/// Default timeout for async blocks and `waits_for`
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Polling increment used by `waits_for`
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// File looked up in the working directory by [`EnvConfig::load_or_default`]
pub const DEFAULT_CONFIG_FILE: &str = "otter_bdd.toml";

/// Scheduler configuration loaded from TOML file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Milliseconds of synchronous driving before the queue yields to the
    /// host loop. Zero disables yielding.
    pub update_interval_ms: u64,

    /// Timeout for async blocks and latch polling when none is given
    pub default_timeout_ms: u64,

    /// Latch polling increment
    pub poll_interval_ms: u64,

    /// Convert block errors and panics into spec failures
    pub catch_exceptions: bool,

    /// Report ">> waiting for ..." messages to reporters
    pub verbose: bool,

    /// Record a timeout failure when an async block's timer beats `done`
    pub fail_on_async_timeout: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            catch_exceptions: true,
            verbose: false,
            fail_on_async_timeout: false,
        }
    }
}

impl EnvConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|source| Error::ConfigParse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Try to load from `path` or the default location, fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    return Self::default();
                }
                default_path
            }
        };

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{e}; using default scheduler config");
                Self::default()
            }
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Never zero, so latch polling always makes progress.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
