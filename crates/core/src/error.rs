// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for Siphon.
//!
//! The variants map onto the stages where things can go wrong: loading
//! configuration, constructing plugins, running plugins, and moving records
//! through the pipeline. Invariant violations (pool overflow, a factory
//! producing the wrong plugin kind) are not represented here; those are
//! programming defects and abort via `assert!`.

use thiserror::Error;

/// Main error type for Siphon operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error: unresolvable plugin type, bad encoding name,
    /// undecodable section, invalid match expression.
    #[error("configuration error: {0}")]
    Config(String),

    /// Aggregate reported after a config load in which one or more sections
    /// failed. The individual failures have already been logged.
    #[error("{errors} errors loading plugins")]
    Load { errors: usize },

    /// A plugin factory failed while constructing or initializing an instance.
    #[error("plugin '{plugin}' failed to initialize: {reason}")]
    PluginInit { plugin: String, reason: String },

    /// A plugin's run loop returned an error or panicked.
    #[error("plugin '{plugin}' runtime failure: {reason}")]
    PluginRuntime { plugin: String, reason: String },

    /// A record could not make forward progress: decode failure, inject past
    /// the loop cap, runtime match compilation failure. The affected record
    /// is released and the pipeline continues.
    #[error("flow error: {0}")]
    Flow(String),

    /// I/O error (file persistence, sockets).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for Results using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_plugin_name() {
        let err = PipelineError::PluginInit {
            plugin: "UdpInput".to_string(),
            reason: "bad address".to_string(),
        };
        assert_eq!(err.to_string(), "plugin 'UdpInput' failed to initialize: bad address");
    }

    #[test]
    fn load_aggregate_reports_count() {
        let err = PipelineError::Load { errors: 3 };
        assert_eq!(err.to_string(), "3 errors loading plugins");
    }
}
