//! Transaction manager configuration via `gridtx.toml`
//!
//! Every field has a default, so an empty file (or no file) is valid.

use gridtx_core::MemberId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Config file name looked up by embedders.
pub const CONFIG_FILE_NAME: &str = "gridtx.toml";

/// Errors from loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// File that failed
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The config text is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Transaction manager configuration
///
/// # Example
///
/// ```toml
/// lock_timeout_ms = 5000
/// failover_cache_capacity = 1000
/// # failover_ttl_secs = 300
/// # member_name = "server-1"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxConfig {
    /// How long the local lock service waits for a lock batch
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Number of outcome summaries kept for client failover
    #[serde(default = "default_failover_cache_capacity")]
    pub failover_cache_capacity: usize,
    /// Age after which outcome summaries are dropped (none = kept until evicted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_ttl_secs: Option<u64>,
    /// Name of the local member (random when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_failover_cache_capacity() -> usize {
    1000
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            failover_cache_capacity: default_failover_cache_capacity(),
            failover_ttl_secs: None,
            member_name: None,
        }
    }
}

impl TxConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and
    /// `ConfigError::Invalid` for out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: TxConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failover_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "failover_cache_capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(name) = &self.member_name {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "member_name must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Lock wait as a `Duration`
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Failover entry lifetime, if any
    pub fn failover_ttl(&self) -> Option<Duration> {
        self.failover_ttl_secs.map(Duration::from_secs)
    }

    /// Identity of the local member
    pub fn local_member(&self) -> MemberId {
        match &self.member_name {
            Some(name) => MemberId::new(name.clone()),
            None => MemberId::random(),
        }
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# gridtx transaction configuration
#
# Milliseconds to wait for cluster-wide locks before reporting a commit conflict
lock_timeout_ms = 5000

# Outcome summaries kept for clients that reconnect after a failover
failover_cache_capacity = 1000

# Drop outcome summaries older than this many seconds (default: never)
# failover_ttl_secs = 300

# Name of this member (default: random UUID)
# member_name = "server-1"
"#
    }
}
