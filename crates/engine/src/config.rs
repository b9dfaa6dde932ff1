// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The config loader: from a TOML document to an assembled [`Pipeline`].
//!
//! Each top-level table is one plugin section; the section name is the
//! logical instance name and `type` defaults to it. The loader decodes the
//! common header, resolves the type against the registry, freezes the
//! section body into a [`PluginWrapper`], constructs and validates the
//! instance, and files it by registered kind. Section failures are logged
//! and counted; the load as a whole fails with the aggregate count.

use crate::fo_runner::FoRunner;
use crate::input::InputRunner;
use crate::pipeline::Pipeline;
use crate::router::MessageRouter;
use crate::ROUTER_CTL_CAPACITY;
use serde::Deserialize;
use siphon_core::decoders::{DecoderRunner, DecoderSet, DecoderSetPool};
use siphon_core::matcher::CompiledMatcher;
use siphon_core::pack::PackPool;
use siphon_core::plugin::{PluginInstance, PluginKind, PluginRegistry, PluginWrapper};
use siphon_core::{Encoding, PipelineError, PipelineGlobals, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Decoder sections synthesised when the config file provides none.
const DEFAULT_DECODER_TOML: &str = r#"
[JsonDecoder]
encoding_name = "JSON"

[ProtobufDecoder]
encoding_name = "PROTOCOL_BUFFER"
"#;

/// The keys every plugin section shares. Everything else in the section
/// body belongs to the plugin's own config.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct SectionHeader {
    #[serde(rename = "type")]
    pub typ: Option<String>,
    /// Ticker period in seconds; 0 means no ticker.
    pub ticker_interval: f64,
    pub encoding_name: Option<String>,
    pub message_matcher: Option<String>,
    pub message_signer: Option<String>,
}

pub(crate) fn decode_header(name: &str, section: &toml::Value) -> Result<SectionHeader> {
    section.clone().try_into().map_err(|e| {
        PipelineError::Config(format!("unable to decode config for plugin '{name}': {e}"))
    })
}

/// Builds a filter or output runner from one config section. Shared between
/// the loader and runtime filter installation.
pub(crate) fn build_fo_runner(
    registry: &PluginRegistry,
    plugin_chan_size: usize,
    name: &str,
    section: &toml::Value,
) -> Result<FoRunner> {
    let header = decode_header(name, section)?;
    let plugin_type = header.typ.clone().unwrap_or_else(|| name.to_string());
    let kind = registry
        .kind_of(&plugin_type)
        .ok_or_else(|| PipelineError::Config(format!("no such plugin: {plugin_type}")))?;
    if !matches!(kind, PluginKind::Filter | PluginKind::Output) {
        return Err(PipelineError::Config(format!(
            "'{name}' resolves to a {kind} plugin, expected a filter or output"
        )));
    }

    let factory = registry
        .factory(&plugin_type)
        .ok_or_else(|| PipelineError::Config(format!("no such plugin: {plugin_type}")))?;
    let wrapper = PluginWrapper::new(name, kind, factory, Some(section.clone()));
    let instance = wrapper.create()?;

    let ticker = (header.ticker_interval > 0.0)
        .then(|| Duration::from_secs_f64(header.ticker_interval));
    let matcher = header
        .message_matcher
        .as_deref()
        .map(|expr| {
            CompiledMatcher::compile(expr, header.message_signer.clone()).map_err(|e| {
                PipelineError::Config(format!("can't create message matcher for '{name}': {e}"))
            })
        })
        .transpose()?;

    Ok(FoRunner::new(wrapper, instance, plugin_chan_size, ticker, matcher))
}

/// Loads a declarative pipeline config into a ready-to-start [`Pipeline`].
pub struct ConfigLoader {
    registry: Arc<PluginRegistry>,
    globals: Arc<PipelineGlobals>,
    errors: usize,
    input_token: CancellationToken,
    input_runners: Vec<InputRunner>,
    fo_runners: Vec<FoRunner>,
    decoder_wrappers: BTreeMap<String, PluginWrapper>,
    decoders_by_encoding: HashMap<u8, String>,
}

impl ConfigLoader {
    pub fn new(registry: Arc<PluginRegistry>, globals: Arc<PipelineGlobals>) -> Self {
        Self {
            registry,
            globals,
            errors: 0,
            input_token: CancellationToken::new(),
            input_runners: Vec::new(),
            fo_runners: Vec::new(),
            decoder_wrappers: BTreeMap::new(),
            decoders_by_encoding: HashMap::new(),
        }
    }

    /// Loads a TOML config file.
    ///
    /// # Errors
    ///
    /// I/O and syntax problems fail immediately; per-section failures are
    /// counted and reported as [`PipelineError::Load`] once every section
    /// has been attempted.
    pub fn load_file(self, path: impl AsRef<Path>) -> Result<Pipeline> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        self.load_str(&raw)
    }

    /// Loads a TOML config document. See [`Self::load_file`].
    pub fn load_str(mut self, raw: &str) -> Result<Pipeline> {
        let sections: toml::Table = toml::from_str(raw)
            .map_err(|e| PipelineError::Config(format!("error decoding config file: {e}")))?;

        for (name, section) in &sections {
            tracing::info!(section = %name, "loading");
            if let Err(e) = self.load_section(name, section) {
                tracing::error!(section = %name, error = %e, "section failed to load");
                self.errors += 1;
            }
        }

        self.load_default_decoders();
        let decoder_pool = self.build_decoder_pool();

        if self.errors > 0 {
            return Err(PipelineError::Load { errors: self.errors });
        }

        let (router_tx, router_in_rx) = mpsc::channel(self.globals.plugin_chan_size);
        let (router_ctl_tx, router_ctl_rx) = mpsc::channel(ROUTER_CTL_CAPACITY);
        let router = MessageRouter::new(router_in_rx, router_ctl_rx);

        Ok(Pipeline {
            input_pool: PackPool::new(self.globals.pool_size, self.globals.max_msg_loops),
            inject_pool: PackPool::new(self.globals.pool_size, self.globals.max_msg_loops),
            globals: self.globals,
            registry: self.registry,
            decoder_pool,
            decoders_by_encoding: self.decoders_by_encoding,
            input_runners: self.input_runners,
            fo_runners: self.fo_runners,
            router,
            router_tx,
            router_ctl_tx,
            input_token: self.input_token,
        })
    }

    fn load_section(&mut self, name: &str, section: &toml::Value) -> Result<()> {
        let header = decode_header(name, section)?;
        let plugin_type = header.typ.clone().unwrap_or_else(|| name.to_string());
        let kind = self
            .registry
            .kind_of(&plugin_type)
            .ok_or_else(|| PipelineError::Config(format!("no such plugin: {plugin_type}")))?;

        match kind {
            PluginKind::Decoder => {
                let factory = self
                    .registry
                    .factory(&plugin_type)
                    .ok_or_else(|| PipelineError::Config(format!("no such plugin: {plugin_type}")))?;
                let wrapper = PluginWrapper::new(name, kind, factory, Some(section.clone()));
                // Construct once now so a broken section fails at load, not
                // at decoder-set assembly.
                wrapper.create()?;
                if let Some(encoding_name) = &header.encoding_name {
                    let encoding = Encoding::from_name(encoding_name).ok_or_else(|| {
                        PipelineError::Config(format!(
                            "can't register decoder '{name}': no message encoding named '{encoding_name}'"
                        ))
                    })?;
                    self.decoders_by_encoding.insert(encoding.tag(), name.to_string());
                }
                self.decoder_wrappers.insert(name.to_string(), wrapper);
            }
            PluginKind::Input => {
                let factory = self
                    .registry
                    .factory(&plugin_type)
                    .ok_or_else(|| PipelineError::Config(format!("no such plugin: {plugin_type}")))?;
                let wrapper = PluginWrapper::new(name, kind, factory, Some(section.clone()));
                let instance = wrapper.create()?;
                self.input_runners.push(InputRunner::new(
                    wrapper,
                    instance,
                    self.input_token.child_token(),
                ));
            }
            PluginKind::Filter | PluginKind::Output => {
                let runner = build_fo_runner(
                    &self.registry,
                    self.globals.plugin_chan_size,
                    name,
                    section,
                )?;
                if self.fo_runners.iter().any(|r| r.name() == name) {
                    return Err(PipelineError::Config(format!("'{name}' is defined twice")));
                }
                self.fo_runners.push(runner);
            }
        }
        Ok(())
    }

    /// Synthesises the JSON and protobuf decoders when the config omits
    /// them, so every pipeline can decode the two stock encodings.
    fn load_default_decoders(&mut self) {
        let defaults: toml::Table = match toml::from_str(DEFAULT_DECODER_TOML) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(error = %e, "builtin decoder defaults failed to parse");
                self.errors += 1;
                return;
            }
        };
        for name in ["JsonDecoder", "ProtobufDecoder"] {
            if self.decoder_wrappers.contains_key(name) {
                continue;
            }
            let Some(section) = defaults.get(name) else { continue };
            tracing::info!(section = %name, "loading builtin decoder");
            if let Err(e) = self.load_section(name, section) {
                tracing::error!(section = %name, error = %e, "builtin decoder failed to load");
                self.errors += 1;
            }
        }
    }

    fn build_decoder_pool(&mut self) -> DecoderSetPool {
        let mut sets = Vec::with_capacity(self.globals.decoder_pool_size);
        for _ in 0..self.globals.decoder_pool_size {
            match self.build_decoder_set() {
                Ok(set) => sets.push(set),
                Err(e) => {
                    tracing::error!(error = %e, "decoder set assembly failed");
                    self.errors += 1;
                    break;
                }
            }
        }
        DecoderSetPool::new(sets)
    }

    fn build_decoder_set(&self) -> Result<DecoderSet> {
        let mut runners = Vec::with_capacity(self.decoder_wrappers.len());
        for (name, wrapper) in &self.decoder_wrappers {
            match wrapper.create()? {
                PluginInstance::Decoder(decoder) => {
                    runners.push(DecoderRunner::new(Arc::from(name.as_str()), decoder));
                }
                _ => unreachable!("decoder wrapper produced a non-decoder"),
            }
        }
        DecoderSet::new(runners, &self.decoders_by_encoding)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing;

    fn loader() -> ConfigLoader {
        ConfigLoader::new(Arc::new(testing::test_registry()), Arc::new(testing::test_globals()))
    }

    #[tokio::test]
    async fn empty_config_gets_default_decoders() {
        let pipeline = loader().load_str("").unwrap();
        assert_eq!(pipeline.decoder_for_encoding(Encoding::Json), Some("JsonDecoder"));
        assert_eq!(
            pipeline.decoder_for_encoding(Encoding::ProtocolBuffer),
            Some("ProtobufDecoder")
        );
    }

    #[tokio::test]
    async fn named_json_decoder_suppresses_the_builtin_section() {
        // A section named JsonDecoder replaces the synthesised one; only the
        // protobuf default is added.
        let pipeline = loader()
            .load_str(
                r#"
                [JsonDecoder]
                type = "StubDecoder"
                encoding_name = "JSON"
                "#,
            )
            .unwrap();
        assert_eq!(pipeline.decoder_for_encoding(Encoding::Json), Some("JsonDecoder"));
        assert_eq!(
            pipeline.decoder_for_encoding(Encoding::ProtocolBuffer),
            Some("ProtobufDecoder")
        );
    }

    #[tokio::test]
    async fn unknown_type_counts_as_one_error() {
        let err = loader()
            .load_str(
                r#"
                [nope]
                type = "NoSuchThing"

                [counts]
                type = "StubFilter"
                message_matcher = "TRUE"
                "#,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load { errors: 1 }), "got {err:?}");
    }

    #[tokio::test]
    async fn section_name_is_the_default_type() {
        let err = loader()
            .load_str(
                r#"
                [SomethingUnregistered]
                value = 3
                "#,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load { errors: 1 }));
    }

    #[tokio::test]
    async fn bad_matcher_expression_fails_the_section() {
        let err = loader()
            .load_str(
                r#"
                [counts]
                type = "StubFilter"
                message_matcher = "Type &= 'x'"
                "#,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load { errors: 1 }));
    }

    #[tokio::test]
    async fn bad_encoding_name_fails_the_section() {
        let err = loader()
            .load_str(
                r#"
                [weird]
                type = "StubDecoder"
                encoding_name = "CARRIER_PIGEON"
                "#,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load { errors: 1 }));
    }

    #[tokio::test]
    async fn filter_and_output_sections_build_runners() {
        let pipeline = loader()
            .load_str(
                r#"
                [counts]
                type = "StubFilter"
                message_matcher = "Type == 'X'"
                ticker_interval = 5.0

                [sink]
                type = "StubOutput"
                message_matcher = "TRUE"
                "#,
            )
            .unwrap();
        let mut names: Vec<&str> = pipeline.fo_runner_names().collect();
        names.sort_unstable();
        assert_eq!(names, ["counts", "sink"]);
    }
}
