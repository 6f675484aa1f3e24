//! Configuration for the column indexer.
//!
//! Loads settings from `.colstats.toml` in a given directory, overridden by
//! `COLSTATS_*` environment variables. Uses figment for layered configuration
//! with provenance tracking.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the optional config file.
pub const CONFIG_FILE_NAME: &str = ".colstats.toml";

/// Prefix for environment overrides (e.g. `COLSTATS_CHUNK_SIZE=500`).
pub const ENV_PREFIX: &str = "COLSTATS_";

/// Indexer tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexerConfig {
    /// Rows scanned per backfill chunk (default: 1000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Sleep after a scheduler pass that found no work, in milliseconds (default: 1000).
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Primary keys sampled per distinct-value bucket (default: 10).
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Longest text (in characters) that is bucketed or used for min/max (default: 100).
    #[serde(default = "default_max_value_length")]
    pub max_value_length: usize,

    /// Characters of the lowercased value kept as the bucket key (default: 20).
    #[serde(default = "default_key_length")]
    pub key_length: usize,

    /// Buckets fetched per autosuggest prefix lookup (default: 100).
    #[serde(default = "default_suggest_candidates")]
    pub suggest_candidates: usize,

    /// Suggestions returned per lookup (default: 10).
    #[serde(default = "default_suggest_limit")]
    pub suggest_limit: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            idle_sleep_ms: default_idle_sleep_ms(),
            max_samples: default_max_samples(),
            max_value_length: default_max_value_length(),
            key_length: default_key_length(),
            suggest_candidates: default_suggest_candidates(),
            suggest_limit: default_suggest_limit(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}

fn default_idle_sleep_ms() -> u64 {
    1000
}

fn default_max_samples() -> usize {
    10
}

fn default_max_value_length() -> usize {
    100
}

fn default_key_length() -> usize {
    20
}

fn default_suggest_candidates() -> usize {
    100
}

fn default_suggest_limit() -> usize {
    10
}

impl IndexerConfig {
    /// Load configuration from `.colstats.toml` in the given directory.
    ///
    /// Layers: defaults <- toml file <- environment.
    /// Returns defaults if the configuration is invalid, logging the
    /// figment error (which names the offending key and source).
    pub fn load(root: &Path) -> Self {
        let config_path = root.join(CONFIG_FILE_NAME);

        let figment = Figment::from(Serialized::defaults(IndexerConfig::default()));

        // Only add TOML provider if file exists
        let figment = if config_path.exists() {
            figment.merge(Toml::file(&config_path))
        } else {
            figment
        };

        match figment.merge(Env::prefixed(ENV_PREFIX)).extract() {
            Ok(config) => {
                if config_path.exists() {
                    tracing::info!("Loaded config from {:?}", config_path);
                }
                Self::sanitized(config)
            }
            Err(e) => {
                tracing::warn!("Config error: {}", e);
                Self::default()
            }
        }
    }

    /// Replace sizes that would stall the indexer with their defaults.
    fn sanitized(mut config: Self) -> Self {
        if config.chunk_size == 0 {
            tracing::warn!(
                "Config error: chunk_size must be at least 1, using {}",
                default_chunk_size()
            );
            config.chunk_size = default_chunk_size();
        }
        if config.key_length == 0 {
            tracing::warn!(
                "Config error: key_length must be at least 1, using {}",
                default_key_length()
            );
            config.key_length = default_key_length();
        }
        config
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}
