// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stub plugins and fixtures for the engine's unit tests.

use siphon_core::plugin::{
    FoContext, FoEvent, Filter, Output, PluginHelper, PluginInstance, PluginKind, PluginRegistry,
};
use siphon_core::{async_trait, Decoder, Message, PipelineGlobals, Result};
use std::sync::Arc;

pub(crate) struct StubDecoder;

impl Decoder for StubDecoder {
    fn decode(&mut self, raw: &[u8], msg: &mut Message) -> Result<()> {
        msg.msg_type.push_str("stub");
        msg.payload.push_str(&String::from_utf8_lossy(raw));
        Ok(())
    }
}

/// Consumes everything it is sent and exits cleanly on close.
pub(crate) struct StubSink;

#[async_trait]
impl Filter for StubSink {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        loop {
            match ctx.next().await {
                FoEvent::Closed => return Ok(()),
                FoEvent::Pack(_) | FoEvent::Tick => {}
            }
        }
    }
}

#[async_trait]
impl Output for StubSink {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        loop {
            match ctx.next().await {
                FoEvent::Closed => return Ok(()),
                FoEvent::Pack(_) | FoEvent::Tick => {}
            }
        }
    }
}

/// A helper for driving runners outside a full pipeline: no outputs, no
/// filters, one empty decoder set, and a real inject pool.
pub(crate) struct NopHelper {
    pub inject_pool: siphon_core::PackPool,
    pub decoder_pool: siphon_core::DecoderSetPool,
}

impl NopHelper {
    pub(crate) fn new() -> Self {
        let empty_set = siphon_core::DecoderSet::new(Vec::new(), &std::collections::HashMap::new())
            .unwrap_or_else(|_| unreachable!("empty decoder set is always valid"));
        Self {
            inject_pool: siphon_core::PackPool::new(4, 4),
            decoder_pool: siphon_core::DecoderSetPool::new(vec![empty_set]),
        }
    }
}

#[async_trait]
impl siphon_core::PluginHelper for NopHelper {
    fn output(&self, _name: &str) -> Option<siphon_core::FoHandle> {
        None
    }

    fn filter(&self, _name: &str) -> Option<siphon_core::FoHandle> {
        None
    }

    async fn decoder_set(&self) -> siphon_core::DecoderSetLease {
        self.decoder_pool.lease().await
    }

    async fn pipeline_pack(&self, msg_loop_count: u32) -> Option<siphon_core::PackLease> {
        self.inject_pool.acquire_inject(msg_loop_count).await
    }

    async fn add_filter(&self, _name: &str, _section: toml::Value) -> Result<()> {
        Err(siphon_core::PipelineError::Config("no runtime".to_string()))
    }

    async fn remove_filter(&self, _name: &str) -> bool {
        false
    }
}

pub(crate) fn test_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register("StubDecoder", PluginKind::Decoder, |_| {
        Ok(PluginInstance::Decoder(Box::new(StubDecoder)))
    });
    // The loader synthesises sections for these two names when absent.
    registry.register("JsonDecoder", PluginKind::Decoder, |_| {
        Ok(PluginInstance::Decoder(Box::new(StubDecoder)))
    });
    registry.register("ProtobufDecoder", PluginKind::Decoder, |_| {
        Ok(PluginInstance::Decoder(Box::new(StubDecoder)))
    });
    registry.register("StubFilter", PluginKind::Filter, |_| {
        Ok(PluginInstance::Filter(Box::new(StubSink)))
    });
    registry.register("StubOutput", PluginKind::Output, |_| {
        Ok(PluginInstance::Output(Box::new(StubSink)))
    });
    registry
}

pub(crate) fn test_globals() -> PipelineGlobals {
    PipelineGlobals::new(4, 2, 8, 4)
}
