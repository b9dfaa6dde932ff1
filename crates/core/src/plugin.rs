// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The plugin contract: traits, factory registry, and run contexts.
//!
//! This module defines the interface every pipeline plugin implements:
//! - [`Input`], [`Decoder`], [`Filter`], [`Output`]: the four plugin traits
//! - [`PluginRegistry`]: name → kind + factory, the source of all instances
//! - [`PluginWrapper`]: a factory bound to a frozen config, used to restart
//!   a plugin without re-reading the config file
//! - [`InputContext`] / [`FoContext`]: the runtime surface handed to a
//!   plugin's `run`
//! - [`PluginHelper`]: pipeline services available to running plugins

use crate::decoders::DecoderSetLease;
use crate::error::{PipelineError, Result};
use crate::message::Message;
use crate::pack::{PackCapture, PackLease, PackPool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

/// The four plugin categories. Registration carries the kind explicitly;
/// nothing is inferred from plugin names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Input,
    Decoder,
    Filter,
    Output,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Input => "input",
            Self::Decoder => "decoder",
            Self::Filter => "filter",
            Self::Output => "output",
        };
        f.write_str(name)
    }
}

/// An input plugin reads an external source, decodes what it reads, and
/// hands the resulting packs to the router. `run` blocks until the context's
/// cancellation token fires or a terminal error occurs.
#[async_trait]
pub trait Input: Send {
    async fn run(
        self: Box<Self>,
        ctx: &mut InputContext,
        helper: Arc<dyn PluginHelper>,
    ) -> Result<()>;
}

/// A decoder turns raw bytes into a record. Decoders are leased as part of a
/// decoder set and used synchronously by the leasing input.
pub trait Decoder: Send {
    fn decode(&mut self, raw: &[u8], msg: &mut Message) -> Result<()>;
}

/// A filter consumes matched records and may synthesise new ones back into
/// the router via [`FoContext::inject`].
#[async_trait]
pub trait Filter: Send {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        helper: Arc<dyn PluginHelper>,
    ) -> Result<()>;
}

/// An output consumes matched records and delivers them to a sink.
#[async_trait]
pub trait Output: Send {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        helper: Arc<dyn PluginHelper>,
    ) -> Result<()>;
}

/// A freshly constructed, initialized plugin instance.
pub enum PluginInstance {
    Input(Box<dyn Input>),
    Decoder(Box<dyn Decoder>),
    Filter(Box<dyn Filter>),
    Output(Box<dyn Output>),
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(match self {
            Self::Input(_) => "Input",
            Self::Decoder(_) => "Decoder",
            Self::Filter(_) => "Filter",
            Self::Output(_) => "Output",
        })
        .finish()
    }
}

impl PluginInstance {
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Input(_) => PluginKind::Input,
            Self::Decoder(_) => PluginKind::Decoder,
            Self::Filter(_) => PluginKind::Filter,
            Self::Output(_) => PluginKind::Output,
        }
    }
}

/// A factory builds and initializes a plugin from its decoded config section.
/// Construction is plainly fallible; there is no separate `Init` step.
pub type PluginFactory = Arc<dyn Fn(Option<&toml::Value>) -> Result<PluginInstance> + Send + Sync>;

/// Deserializes a plugin's typed config from its raw section, falling back
/// to the default when the section carries no body. Unknown keys (including
/// the common header keys) are ignored.
///
/// # Errors
///
/// Returns [`PipelineError::PluginInit`] when the section does not decode
/// into `T`.
pub fn parse_config<T>(plugin: &str, value: Option<&toml::Value>) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    value.map_or_else(
        || Ok(T::default()),
        |v| {
            v.clone().try_into().map_err(|e| PipelineError::PluginInit {
                plugin: plugin.to_string(),
                reason: format!("can't unmarshal config: {e}"),
            })
        },
    )
}

struct PluginInfo {
    kind: PluginKind,
    factory: PluginFactory,
}

/// The registry holds every plugin type the loader can construct.
#[derive(Default)]
pub struct PluginRegistry {
    info: HashMap<String, PluginInfo>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin type under `name` with its kind and factory.
    pub fn register<F>(&mut self, name: &str, kind: PluginKind, factory: F)
    where
        F: Fn(Option<&toml::Value>) -> Result<PluginInstance> + Send + Sync + 'static,
    {
        self.info.insert(name.to_string(), PluginInfo { kind, factory: Arc::new(factory) });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.info.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<PluginKind> {
        self.info.get(name).map(|info| info.kind)
    }

    pub fn factory(&self, name: &str) -> Option<PluginFactory> {
        self.info.get(name).map(|info| Arc::clone(&info.factory))
    }

    /// Builds and initializes an instance of `name` from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for unknown plugin types and
    /// whatever the factory reports for construction failures.
    pub fn create(&self, name: &str, config: Option<&toml::Value>) -> Result<PluginInstance> {
        let info = self
            .info
            .get(name)
            .ok_or_else(|| PipelineError::Config(format!("no such plugin: {name}")))?;
        let instance = (info.factory)(config)?;
        // A factory producing a different kind than it registered is a
        // defect in the plugin, not a runtime condition.
        assert!(
            instance.kind() == info.kind,
            "plugin '{name}' factory produced a {} but is registered as a {}",
            instance.kind(),
            info.kind
        );
        Ok(instance)
    }
}

/// A plugin factory bound to its frozen, already-decoded config section.
/// Runners keep their wrapper so a crashed plugin can be rebuilt without
/// touching the config file again.
#[derive(Clone)]
pub struct PluginWrapper {
    name: Arc<str>,
    kind: PluginKind,
    factory: PluginFactory,
    config: Option<toml::Value>,
}

impl PluginWrapper {
    pub fn new(
        name: &str,
        kind: PluginKind,
        factory: PluginFactory,
        config: Option<toml::Value>,
    ) -> Self {
        Self { name: Arc::from(name), kind, factory, config }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Builds a fresh instance from the frozen config.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PluginInit`] when the factory fails.
    pub fn create(&self) -> Result<PluginInstance> {
        let instance =
            (self.factory)(self.config.as_ref()).map_err(|e| PipelineError::PluginInit {
                plugin: self.name.to_string(),
                reason: e.to_string(),
            })?;
        assert!(
            instance.kind() == self.kind,
            "plugin '{}' factory produced a {} but is registered as a {}",
            self.name,
            instance.kind(),
            self.kind
        );
        Ok(instance)
    }
}

/// Delivery handle for one filter or output runner, as exposed to plugins
/// through [`PluginHelper::output`] and [`PluginHelper::filter`].
#[derive(Debug, Clone)]
pub struct FoHandle {
    name: Arc<str>,
    tx: mpsc::Sender<PackCapture>,
}

impl FoHandle {
    pub fn new(name: Arc<str>, tx: mpsc::Sender<PackCapture>) -> Self {
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivers a pack directly to this runner, bypassing the router.
    /// Returns false when the runner's input channel has closed.
    pub async fn deliver(&self, capture: PackCapture) -> bool {
        self.tx.send(capture).await.is_ok()
    }
}

/// Pipeline services available to plugins during `run`.
#[async_trait]
pub trait PluginHelper: Send + Sync {
    /// Looks up a running output runner by name.
    fn output(&self, name: &str) -> Option<FoHandle>;

    /// Looks up a running filter runner by name.
    fn filter(&self, name: &str) -> Option<FoHandle>;

    /// Leases a decoder set for the current operation. Hold the lease only
    /// for a single message; holding longer starves other inputs.
    async fn decoder_set(&self) -> DecoderSetLease;

    /// Acquires a pack from the injection pool, bumping the loop count.
    /// Returns `None` when the loop cap would be exceeded.
    async fn pipeline_pack(&self, msg_loop_count: u32) -> Option<PackLease>;

    /// Builds, starts, and registers a filter runner from a single config
    /// section. Used by the manager filter.
    ///
    /// # Errors
    ///
    /// Fails when the name is already taken, the section is invalid, or the
    /// plugin cannot be constructed.
    async fn add_filter(&self, name: &str, section: toml::Value) -> Result<()>;

    /// Stops and removes a dynamically added filter runner. Returns false if
    /// no such filter exists or shutdown has already begun.
    async fn remove_filter(&self, name: &str) -> bool;
}

/// Runtime context handed to an input plugin's `run`.
pub struct InputContext {
    name: Arc<str>,
    input_pool: PackPool,
    router_tx: mpsc::Sender<PackLease>,
    token: CancellationToken,
}

impl InputContext {
    pub fn new(
        name: Arc<str>,
        input_pool: PackPool,
        router_tx: mpsc::Sender<PackLease>,
        token: CancellationToken,
    ) -> Self {
        Self { name, input_pool, router_tx, token }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires a cleared pack from the input pool, waiting for one to be
    /// recycled if the pool is exhausted.
    pub async fn new_pack(&self) -> PackLease {
        self.input_pool.acquire().await
    }

    /// Hands a decoded pack to the router. Returns false when the router has
    /// shut down; the pack is recycled either way.
    pub async fn deliver(&self, pack: PackLease) -> bool {
        self.router_tx.send(pack).await.is_ok()
    }

    /// The stop signal for this input. Transport reads should select against
    /// [`CancellationToken::cancelled`].
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn log_message(&self, msg: &str) {
        tracing::info!(plugin = %self.name, "{msg}");
    }

    pub fn log_error(&self, err: &PipelineError) {
        tracing::error!(plugin = %self.name, error = %err, "input error");
    }
}

/// One event from a filter/output runner's perspective.
#[derive(Debug)]
pub enum FoEvent {
    /// A matched record arrived.
    Pack(PackCapture),
    /// The configured ticker fired.
    Tick,
    /// The input channel closed; the plugin should return.
    Closed,
}

/// Runtime context handed to a filter or output plugin's `run`.
///
/// The context owns the runner's input channel and ticker so that a plugin
/// crash cannot lose them; a restarted instance resumes on the same channel.
pub struct FoContext {
    name: Arc<str>,
    in_rx: mpsc::Receiver<PackCapture>,
    ticker: Option<Interval>,
    inject_pool: PackPool,
    router_tx: mpsc::Sender<PackLease>,
    shutdown: CancellationToken,
}

impl FoContext {
    pub fn new(
        name: Arc<str>,
        in_rx: mpsc::Receiver<PackCapture>,
        ticker_interval: Option<Duration>,
        inject_pool: PackPool,
        router_tx: mpsc::Sender<PackLease>,
        shutdown: CancellationToken,
    ) -> Self {
        let ticker = ticker_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        Self { name, in_rx, ticker, inject_pool, router_tx, shutdown }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next record, tick, or channel close. If no ticker
    /// interval was configured, only records and close are ever produced.
    ///
    /// Pipeline shutdown closes the input channel from this side; queued
    /// records are still delivered, then [`FoEvent::Closed`] is produced.
    pub async fn next(&mut self) -> FoEvent {
        loop {
            if self.shutdown.is_cancelled() {
                self.in_rx.close();
            }
            match &mut self.ticker {
                Some(interval) => tokio::select! {
                    plc = self.in_rx.recv() => return plc.map_or(FoEvent::Closed, FoEvent::Pack),
                    _ = interval.tick() => return FoEvent::Tick,
                    () = self.shutdown.cancelled(), if !self.shutdown.is_cancelled() => {}
                },
                None => tokio::select! {
                    plc = self.in_rx.recv() => return plc.map_or(FoEvent::Closed, FoEvent::Pack),
                    () = self.shutdown.cancelled(), if !self.shutdown.is_cancelled() => {}
                },
            }
        }
    }

    /// Acquires an injection pack with the loop-count guard. `None` means
    /// the cap was reached; log and drop.
    pub async fn new_pack(&self, msg_loop_count: u32) -> Option<PackLease> {
        self.inject_pool.acquire_inject(msg_loop_count).await
    }

    /// Enqueues a synthesised record into the router. Returns false when the
    /// router has shut down; the pack is recycled either way.
    pub async fn inject(&self, pack: PackLease) -> bool {
        self.router_tx.send(pack).await.is_ok()
    }

    /// The loop-count cap, for log messages.
    pub fn max_msg_loops(&self) -> u32 {
        self.inject_pool.max_msg_loops()
    }

    /// Whether a ticker interval was configured for this runner.
    pub fn has_ticker(&self) -> bool {
        self.ticker.is_some()
    }

    /// Consumes and recycles every record still queued, waiting until the
    /// channel closes. Runners call this after the plugin returns so a dead
    /// plugin never blocks the router.
    pub async fn drain_until_closed(&mut self) {
        loop {
            if self.shutdown.is_cancelled() {
                self.in_rx.close();
            }
            tokio::select! {
                plc = self.in_rx.recv() => if plc.is_none() { return },
                () = self.shutdown.cancelled(), if !self.shutdown.is_cancelled() => {}
            }
        }
    }

    pub fn log_message(&self, msg: &str) {
        tracing::info!(plugin = %self.name, "{msg}");
    }

    pub fn log_error(&self, err: &PipelineError) {
        tracing::error!(plugin = %self.name, error = %err, "plugin error");
    }
}
