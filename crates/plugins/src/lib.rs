// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in plugins for Siphon pipelines.
//!
//! - Decoders: [`decoders::JsonDecoder`], [`decoders::ProtobufDecoder`]
//! - Inputs: [`inputs::UdpInput`]
//! - Filters: [`filters::CounterFilter`], [`filters::ManagerFilter`]
//! - Outputs: [`outputs::LogOutput`], [`outputs::FileOutput`]

use siphon_core::plugin::{PluginInstance, PluginKind, PluginRegistry};

pub mod decoders;
pub mod filters;
pub mod inputs;
pub mod outputs;

/// Registers every built-in plugin type.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register("JsonDecoder", PluginKind::Decoder, |_| {
        Ok(PluginInstance::Decoder(Box::new(decoders::JsonDecoder::default())))
    });
    registry.register("ProtobufDecoder", PluginKind::Decoder, |_| {
        Ok(PluginInstance::Decoder(Box::new(decoders::ProtobufDecoder::default())))
    });
    registry.register("UdpInput", PluginKind::Input, |config| {
        Ok(PluginInstance::Input(Box::new(inputs::UdpInput::from_config(config)?)))
    });
    registry.register("CounterFilter", PluginKind::Filter, |config| {
        Ok(PluginInstance::Filter(Box::new(filters::CounterFilter::from_config(config)?)))
    });
    registry.register("ManagerFilter", PluginKind::Filter, |config| {
        Ok(PluginInstance::Filter(Box::new(filters::ManagerFilter::from_config(config)?)))
    });
    registry.register("LogOutput", PluginKind::Output, |config| {
        Ok(PluginInstance::Output(Box::new(outputs::LogOutput::from_config(config)?)))
    });
    registry.register("FileOutput", PluginKind::Output, |config| {
        Ok(PluginInstance::Output(Box::new(outputs::FileOutput::from_config(config)?)))
    });
}
