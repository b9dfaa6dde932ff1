// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Siphon Core - fundamental traits and data structures for the telemetry
//! pipeline.
//!
//! This crate defines the pieces the engine composes into a running
//! pipeline:
//!
//! - [`message`]: the record payload ([`Message`], fields, encoding tags)
//! - [`pack`]: pooled record carriers and the recycling protocol
//! - [`matcher`]: compiled match expressions and [`MatchRunner`]
//! - [`plugin`]: the Input/Decoder/Filter/Output contract, registry, and
//!   run contexts
//! - [`decoders`]: leased decoder sets
//! - [`globals`]: shared tuning knobs and the shutdown gate
//! - [`error`]: error types

// Re-export async_trait for use in plugin implementations.
pub use async_trait::async_trait;

pub mod decoders;
pub mod error;
pub mod globals;
pub mod matcher;
pub mod message;
pub mod pack;
pub mod plugin;

// Convenience re-exports for the types most plugin and engine code touches.

pub use error::{PipelineError, Result};

pub use globals::PipelineGlobals;

pub use message::{Encoding, Field, FieldValue, Message};

pub use pack::{PackCapture, PackLease, PackPool, PipelinePack, SharedPack};

pub use matcher::{Captures, CompiledMatcher, MatchRunner};

pub use plugin::{
    parse_config, Decoder, Filter, FoContext, FoEvent, FoHandle, Input, InputContext, Output,
    PluginFactory, PluginHelper, PluginInstance, PluginKind, PluginRegistry, PluginWrapper,
};

pub use decoders::{DecoderRunner, DecoderSet, DecoderSetLease, DecoderSetPool};
