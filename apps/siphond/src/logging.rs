// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

use tracing_subscriber::EnvFilter;

use crate::settings::{LogFormat, LogSettings};

fn env_filter_or_level(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Initialize console logging based on configuration.
///
/// # Errors
///
/// Fails when a subscriber is already installed (e.g. calling twice).
pub fn init_logging(log: &LogSettings) -> anyhow::Result<()> {
    let filter = env_filter_or_level(&log.level);
    match log.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("can't install logger: {e}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("can't install logger: {e}"))?,
    }
    Ok(())
}
