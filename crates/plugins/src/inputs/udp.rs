// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! UDP datagram input.
//!
//! Each datagram carries a one-byte wire-encoding tag followed by the raw
//! message body. Per datagram the input leases a decoder set, decodes into a
//! fresh input-pool pack, and hands the pack to the router. Decode failures
//! release the pack and the loop continues.

use serde::Deserialize;
use siphon_core::plugin::{parse_config, Input, InputContext, PluginHelper};
use siphon_core::{async_trait, PipelineError, Result};
use std::sync::Arc;
use tokio::net::UdpSocket;

const MAX_DATAGRAM: usize = 64 * 1024;

fn default_address() -> String {
    "127.0.0.1:5565".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UdpInputConfig {
    pub address: String,
}

impl Default for UdpInputConfig {
    fn default() -> Self {
        Self { address: default_address() }
    }
}

pub struct UdpInput {
    config: UdpInputConfig,
}

impl UdpInput {
    /// Builds the input from its config section.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PluginInit`] for an undecodable section.
    pub fn from_config(config: Option<&toml::Value>) -> Result<Self> {
        Ok(Self { config: parse_config("UdpInput", config)? })
    }
}

#[async_trait]
impl Input for UdpInput {
    async fn run(
        self: Box<Self>,
        ctx: &mut InputContext,
        helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        let socket = UdpSocket::bind(&self.config.address).await.map_err(|e| {
            PipelineError::PluginInit {
                plugin: ctx.name().to_string(),
                reason: format!("can't bind {}: {e}", self.config.address),
            }
        })?;
        tracing::info!(plugin = %ctx.name(), address = %self.config.address, "udp input listening");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = tokio::select! {
                () = ctx.token().cancelled() => return Ok(()),
                received = socket.recv(&mut buf) => received?,
            };
            if len < 2 {
                ctx.log_error(&PipelineError::Flow(format!("runt datagram ({len} bytes)")));
                continue;
            }

            let tag = buf[0];
            let raw = &buf[1..len];
            let mut pack = ctx.new_pack().await;

            let decoded = {
                let mut decoders = helper.decoder_set().await;
                match decoders.by_encoding(tag) {
                    Some(decoder) => decoder.decode(raw, &mut pack.message),
                    None => Err(PipelineError::Flow(format!("no decoder for encoding tag {tag}"))),
                }
            };

            match decoded {
                Ok(()) => {
                    if !ctx.deliver(pack).await {
                        // Router gone; the pipeline is shutting down.
                        return Ok(());
                    }
                }
                Err(e) => ctx.log_error(&e),
            }
        }
    }
}
