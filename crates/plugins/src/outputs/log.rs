// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Log output: writes every matched record through the process logger.
//! Mostly useful while developing a pipeline.

use siphon_core::plugin::{parse_config, FoContext, FoEvent, Output, PluginHelper};
use siphon_core::{async_trait, Result};
use std::sync::Arc;

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct LogOutputConfig {}

#[derive(Debug, Default)]
pub struct LogOutput;

impl LogOutput {
    /// # Errors
    ///
    /// Returns [`siphon_core::PipelineError::PluginInit`] for an
    /// undecodable section.
    pub fn from_config(config: Option<&toml::Value>) -> Result<Self> {
        let _: LogOutputConfig = parse_config("LogOutput", config)?;
        Ok(Self)
    }
}

#[async_trait]
impl Output for LogOutput {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        loop {
            match ctx.next().await {
                FoEvent::Pack(plc) => {
                    let msg = &plc.pack.message;
                    tracing::info!(
                        output = %ctx.name(),
                        uuid = %msg.uuid,
                        msg_type = %msg.msg_type,
                        logger = %msg.logger,
                        severity = msg.severity,
                        payload = %msg.payload,
                        "record"
                    );
                }
                FoEvent::Tick => {}
                FoEvent::Closed => return Ok(()),
            }
        }
    }
}
