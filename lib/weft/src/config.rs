// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/weft/etc/weft.toml`
//! 3. TOML file named by `WEFT_CONFIG_PATH`
//! 4. Environment variables (`WEFT_TREE_*`, `WEFT_TERMINATION_*`, `WEFT_LOCATION_*`, `WEFT_LOGGING_*`)

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const CONFIG_PATH_ENV: &str = "WEFT_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/opt/weft/etc/weft.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Top-level runtime configuration, one per node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RuntimeConfig {
    #[validate(nested)]
    #[serde(default)]
    pub tree: TreeConfig,

    #[validate(nested)]
    #[serde(default)]
    pub termination: TerminationConfig,

    #[validate(nested)]
    #[serde(default)]
    pub location: LocationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Spanning tree shape.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TreeConfig {
    /// Children per interior node.
    #[validate(range(min = 1, max = 64))]
    pub fanout: u32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self { fanout: 2 }
    }
}

/// Termination detector tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TerminationConfig {
    /// Delay before re-driving a wave that found work still in flight.
    #[validate(range(min = 1))]
    pub retry_interval_ms: u64,

    /// Warn when an epoch's global counts stop moving without balancing.
    pub detect_hangs: bool,

    /// Number of unchanged, unbalanced waves between hang warnings.
    #[validate(range(min = 1))]
    pub hang_frequency: u64,
}

impl TerminationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5,
            detect_hangs: true,
            hang_frequency: 1024,
        }
    }
}

/// Location directory limits.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LocationConfig {
    /// Forwarding hops after which a route or query is a fatal routing error.
    #[validate(range(min = 1))]
    pub max_hops: u32,

    /// Cached forward pointers kept for entities homed elsewhere.
    #[validate(range(min = 1))]
    pub cache_capacity: usize,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            max_hops: 64,
            cache_capacity: 65536,
        }
    }
}

/// Logging setup consumed by [`crate::logging::init`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,

    /// Emit JSON lines instead of compact human-readable output.
    pub jsonl: bool,

    /// Per-module level overrides, e.g. `"weft::location" = "trace"`.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            jsonl: false,
            filters: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // WEFT_TREE_FANOUT
            .merge(
                Env::prefixed("WEFT_TREE_")
                    .map(|k| format!("tree.{}", k.as_str().to_lowercase()).into()),
            )
            // WEFT_TERMINATION_RETRY_INTERVAL_MS, WEFT_TERMINATION_HANG_FREQUENCY, ...
            .merge(
                Env::prefixed("WEFT_TERMINATION_")
                    .map(|k| format!("termination.{}", k.as_str().to_lowercase()).into()),
            )
            // WEFT_LOCATION_MAX_HOPS, WEFT_LOCATION_CACHE_CAPACITY
            .merge(
                Env::prefixed("WEFT_LOCATION_")
                    .map(|k| format!("location.{}", k.as_str().to_lowercase()).into()),
            )
            // WEFT_LOGGING_LEVEL, WEFT_LOGGING_JSONL
            .merge(
                Env::prefixed("WEFT_LOGGING_")
                    .map(|k| format!("logging.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = RuntimeConfig::extract_from(
    ///     RuntimeConfig::figment().merge(("location.max_hops", 8u32)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider on top.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }
}

impl Provider for RuntimeConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("RuntimeConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_KEYS: [&str; 6] = [
        "WEFT_CONFIG_PATH",
        "WEFT_TREE_FANOUT",
        "WEFT_TERMINATION_RETRY_INTERVAL_MS",
        "WEFT_TERMINATION_HANG_FREQUENCY",
        "WEFT_LOCATION_MAX_HOPS",
        "WEFT_LOGGING_JSONL",
    ];

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.tree.fanout, 2);
        assert_eq!(config.termination.retry_interval(), Duration::from_millis(5));
        assert!(config.termination.detect_hangs);
        assert_eq!(config.location.max_hops, 64);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(ENV_KEYS, || {
            let config = RuntimeConfig::from_env().unwrap();
            assert_eq!(config.tree.fanout, 2);
            assert_eq!(config.termination.hang_frequency, 1024);
        });
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            vec![
                ("WEFT_TREE_FANOUT", Some("4")),
                ("WEFT_TERMINATION_RETRY_INTERVAL_MS", Some("20")),
                ("WEFT_LOCATION_MAX_HOPS", Some("8")),
                ("WEFT_LOGGING_JSONL", Some("true")),
            ],
            || {
                let config = RuntimeConfig::from_env().unwrap();
                assert_eq!(config.tree.fanout, 4);
                assert_eq!(config.termination.retry_interval_ms, 20);
                assert_eq!(config.location.max_hops, 8);
                assert!(config.logging.jsonl);
            },
        );
    }

    #[test]
    fn test_validation_rejects_zero_fanout() {
        temp_env::with_vars_unset(ENV_KEYS, || {
            let result = RuntimeConfig::extract_from(RuntimeConfig::figment_with((
                "tree.fanout",
                0u32,
            )));
            assert!(matches!(result, Err(ConfigError::Validation(_))));
        });
    }

    #[test]
    fn test_programmatic_override() {
        temp_env::with_vars_unset(ENV_KEYS, || {
            let config = RuntimeConfig::extract_from(
                RuntimeConfig::figment()
                    .merge(("location.cache_capacity", 16usize))
                    .merge(("termination.detect_hangs", false)),
            )
            .unwrap();
            assert_eq!(config.location.cache_capacity, 16);
            assert!(!config.termination.detect_hangs);
        });
    }

    #[test]
    fn test_toml_file_from_env_path() {
        let dir = std::env::temp_dir().join(format!("weft-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("weft.toml");
        std::fs::write(
            &path,
            "[termination]\nretry_interval_ms = 50\ndetect_hangs = true\nhang_frequency = 3\n",
        )
        .unwrap();

        temp_env::with_vars(
            vec![
                ("WEFT_CONFIG_PATH", Some(path.to_str().unwrap())),
                ("WEFT_TERMINATION_RETRY_INTERVAL_MS", None),
                ("WEFT_TERMINATION_HANG_FREQUENCY", None),
            ],
            || {
                let config = RuntimeConfig::from_env().unwrap();
                assert_eq!(config.termination.retry_interval_ms, 50);
                assert_eq!(config.termination.hang_frequency, 3);
            },
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
