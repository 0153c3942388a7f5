// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide `tracing` subscriber setup.
//!
//! Output is compact and human-readable by default, or JSON lines when
//! [`LoggingConfig::jsonl`] is set. The `WEFT_LOG` environment variable takes
//! filter directives in `EnvFilter` syntax and overrides the configured level;
//! per-module entries in [`LoggingConfig::filters`] are applied last.

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LoggingConfig;

/// ENV used to set the log filter
const FILTER_ENV: &str = "WEFT_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops, as is a call made
/// after some other subscriber has already been installed.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| setup_logging(config));
}

fn setup_logging(config: &LoggingConfig) {
    let filter_layer = filters(config);
    if config.jsonl {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = fmt::layer()
            .event_format(fmt::format().compact())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn filters(config: &LoggingConfig) -> EnvFilter {
    let default_directive = config
        .level
        .parse::<Directive>()
        .or_else(|_| DEFAULT_FILTER_LEVEL.parse::<Directive>())
        .unwrap_or_else(|_| tracing::level_filters::LevelFilter::INFO.into());

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in &config.filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_accept_module_overrides() {
        temp_env::with_var_unset(FILTER_ENV, || {
            let mut config = LoggingConfig::default();
            config
                .filters
                .insert("weft::location".to_string(), "trace".to_string());
            let filter = filters(&config);
            let rendered = filter.to_string();
            assert!(rendered.contains("weft::location=trace"));
            assert!(rendered.contains("info"));
        });
    }

    #[test]
    fn test_bad_level_falls_back_to_default() {
        temp_env::with_var_unset(FILTER_ENV, || {
            let config = LoggingConfig {
                level: "weft=loud".to_string(),
                ..Default::default()
            };
            assert!(filters(&config).to_string().contains("info"));
        });
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init(&config);
        init(&config);
    }
}
