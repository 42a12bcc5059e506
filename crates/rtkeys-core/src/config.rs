//! Subsystem sizing configuration.
//!
//! Capacities are fixed when a [`crate::KeyManager`] is built. They can be
//! given directly, deserialized, or read from the environment:
//! - `RTKEYS_MAX_KEYS`: size of the key namespace (default 128).
//! - `RTKEYS_MAX_THREADS`: threads that may hold bindings at once (default 32).
//! - `RTKEYS_MAX_BINDINGS`: value entry pool capacity. When unset the pool is
//!   sized for every thread binding every key (`max_keys * max_threads`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PTHREAD_KEYS_MAX;

/// Default number of threads that may hold bindings simultaneously.
pub const DEFAULT_MAX_THREADS: usize = 32;

/// Hard ceiling on the key namespace; a key slot index is 16 bits wide.
pub const KEYS_LIMIT: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("max_keys {0} exceeds the limit of {KEYS_LIMIT}")]
    TooManyKeys(usize),
    #[error("pool capacity {0} does not fit a 32-bit node handle")]
    PoolTooLarge(usize),
    #[error("{var}: cannot parse '{raw}' as a count")]
    Parse { var: &'static str, raw: String },
}

/// Capacities of the key manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub max_keys: usize,
    pub max_threads: usize,
    pub max_bindings: Option<usize>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            max_keys: PTHREAD_KEYS_MAX,
            max_threads: DEFAULT_MAX_THREADS,
            max_bindings: None,
        }
    }
}

impl KeyConfig {
    #[must_use]
    pub fn new(max_keys: usize, max_threads: usize, max_bindings: usize) -> Self {
        Self {
            max_keys,
            max_threads,
            max_bindings: Some(max_bindings),
        }
    }

    /// Pool capacity, defaulting to one entry per (key, thread) pair.
    #[must_use]
    pub fn pool_capacity(&self) -> usize {
        self.max_bindings
            .unwrap_or_else(|| self.max_keys.saturating_mul(self.max_threads))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_keys == 0 {
            return Err(ConfigError::Zero { field: "max_keys" });
        }
        if self.max_threads == 0 {
            return Err(ConfigError::Zero {
                field: "max_threads",
            });
        }
        if self.max_keys > KEYS_LIMIT {
            return Err(ConfigError::TooManyKeys(self.max_keys));
        }
        let capacity = self.pool_capacity();
        if capacity == 0 {
            return Err(ConfigError::Zero {
                field: "max_bindings",
            });
        }
        if capacity > u32::MAX as usize {
            return Err(ConfigError::PoolTooLarge(capacity));
        }
        Ok(())
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    ///
    /// Unset variables keep their defaults; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(n) = parse_count(&lookup, "RTKEYS_MAX_KEYS")? {
            config.max_keys = n;
        }
        if let Some(n) = parse_count(&lookup, "RTKEYS_MAX_THREADS")? {
            config.max_threads = n;
        }
        if let Some(n) = parse_count(&lookup, "RTKEYS_MAX_BINDINGS")? {
            config.max_bindings = Some(n);
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_count<F>(lookup: &F, var: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .replace('_', "")
        .parse::<usize>()
        .map(Some)
        .map_err(|_| ConfigError::Parse { var, raw })
}
