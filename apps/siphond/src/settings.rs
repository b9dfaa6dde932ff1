// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Daemon settings: pipeline tuning knobs and logging, layered from an
//! optional TOML file and `SIPHOND__`-prefixed environment variables.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use siphon_core::PipelineGlobals;
use std::path::Path;

const fn default_pool_size() -> usize {
    100
}

const fn default_decoder_pool_size() -> usize {
    4
}

const fn default_plugin_chan_size() -> usize {
    50
}

const fn default_max_msg_loops() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Pipeline-wide tuning values, the `[globals]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalsSettings {
    /// Packs in each of the input and inject pools.
    pub pool_size: usize,
    /// Decoder sets available for concurrent lease.
    pub decoder_pool_size: usize,
    /// Capacity of the router and plugin input channels.
    pub plugin_chan_size: usize,
    /// Cap on record re-injection depth.
    pub max_msg_loops: u32,
}

impl Default for GlobalsSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            decoder_pool_size: default_decoder_pool_size(),
            plugin_chan_size: default_plugin_chan_size(),
            max_msg_loops: default_max_msg_loops(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Console logging, the `[log]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default level directive; `RUST_LOG` overrides it when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: default_log_level(), format: LogFormat::Text }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub globals: GlobalsSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Layers defaults, the optional settings file, and environment
    /// variables (e.g. `SIPHOND__GLOBALS__POOL_SIZE=200`).
    ///
    /// # Errors
    ///
    /// Returns a figment error for unreadable files or undecodable values.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("SIPHOND__").split("__")).extract()
    }

    pub fn pipeline_globals(&self) -> PipelineGlobals {
        PipelineGlobals::new(
            self.globals.pool_size,
            self.globals.decoder_pool_size,
            self.globals.plugin_chan_size,
            self.globals.max_msg_loops,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.globals.pool_size, 100);
        assert_eq!(settings.globals.max_msg_loops, 4);
        assert_eq!(settings.log.format, LogFormat::Text);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("siphond.toml");
        std::fs::write(&path, "[globals]\npool_size = 7\n\n[log]\nlevel = \"debug\"\n").unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.globals.pool_size, 7);
        assert_eq!(settings.log.level, "debug");
        // Untouched values keep their defaults.
        assert_eq!(settings.globals.decoder_pool_size, 4);
    }
}
