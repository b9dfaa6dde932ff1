// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipeline assembly, runtime services, and lifecycle.
//!
//! A [`Pipeline`] is the loader's output: pools, runners, and an unspawned
//! router. [`Pipeline::start`] brings it to life and returns a
//! [`PipelineHandle`] for shutdown. The [`PipelineRuntime`] behind the
//! handle implements [`PluginHelper`], giving running plugins access to
//! outputs, filters, decoder sets, injection packs, and dynamic filter
//! management.
//!
//! Shutdown order matters and is fixed: gate new work, stop inputs (no new
//! records), drain the router (closing matched delivery channels), close
//! every remaining filter/output channel, then wait for the runner trackers.

use crate::config::build_fo_runner;
use crate::fo_runner::FoRunner;
use crate::input::InputRunner;
use crate::router::{MessageRouter, RouterCommand};
use siphon_core::decoders::{DecoderSetLease, DecoderSetPool};
use siphon_core::pack::{PackLease, PackPool};
use siphon_core::plugin::{FoHandle, PluginHelper, PluginKind, PluginRegistry};
use siphon_core::{async_trait, Encoding, PipelineError, PipelineGlobals, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A loaded, not-yet-running pipeline.
pub struct Pipeline {
    pub(crate) globals: Arc<PipelineGlobals>,
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) input_pool: PackPool,
    pub(crate) inject_pool: PackPool,
    pub(crate) decoder_pool: DecoderSetPool,
    pub(crate) decoders_by_encoding: HashMap<u8, String>,
    pub(crate) input_runners: Vec<InputRunner>,
    pub(crate) fo_runners: Vec<FoRunner>,
    pub(crate) router: MessageRouter,
    pub(crate) router_tx: mpsc::Sender<PackLease>,
    pub(crate) router_ctl_tx: mpsc::Sender<RouterCommand>,
    pub(crate) input_token: CancellationToken,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// The decoder registered for a wire encoding, if any.
    pub fn decoder_for_encoding(&self, encoding: Encoding) -> Option<&str> {
        self.decoders_by_encoding.get(&encoding.tag()).map(String::as_str)
    }

    /// Names of the configured filter and output runners.
    pub fn fo_runner_names(&self) -> impl Iterator<Item = &str> {
        self.fo_runners.iter().map(FoRunner::name)
    }

    /// Spawns the router and every runner. Outputs start before filters so
    /// filters can look them up; inputs start last so nothing flows into a
    /// half-wired pipeline.
    pub async fn start(mut self) -> PipelineHandle {
        let router_task = tokio::spawn(self.router.run());

        let fo_shutdown = CancellationToken::new();
        let filter_tracker = TaskTracker::new();
        let output_tracker = TaskTracker::new();

        let mut filters = HashMap::new();
        let mut outputs = HashMap::new();
        for runner in &self.fo_runners {
            match runner.kind() {
                PluginKind::Filter => filters.insert(runner.name().to_string(), runner.handle()),
                PluginKind::Output => outputs.insert(runner.name().to_string(), runner.handle()),
                _ => unreachable!("FoRunner is always a filter or output"),
            };
        }

        let runtime = Arc::new_cyclic(|weak: &Weak<PipelineRuntime>| PipelineRuntime {
            weak_self: weak.clone(),
            globals: Arc::clone(&self.globals),
            registry: Arc::clone(&self.registry),
            inject_pool: self.inject_pool.clone(),
            decoder_pool: self.decoder_pool.clone(),
            router_tx: self.router_tx.clone(),
            router_ctl_tx: self.router_ctl_tx.clone(),
            filters: Mutex::new(filters),
            outputs: Mutex::new(outputs),
            filter_tracker: filter_tracker.clone(),
            fo_shutdown: fo_shutdown.clone(),
        });
        let helper: Arc<dyn PluginHelper> = runtime.clone();

        // Outputs, then filters.
        let mut ordered: Vec<&mut FoRunner> = self.fo_runners.iter_mut().collect();
        ordered.sort_by_key(|runner| match runner.kind() {
            PluginKind::Output => 0,
            _ => 1,
        });
        for runner in ordered {
            let kind = runner.kind();
            let tracker =
                if kind == PluginKind::Filter { &filter_tracker } else { &output_tracker };
            let matcher = runner.start(
                self.inject_pool.clone(),
                self.router_tx.clone(),
                fo_shutdown.clone(),
                tracker,
                Arc::clone(&helper),
            );
            if let Some(matcher) = matcher {
                let cmd = if kind == PluginKind::Filter {
                    RouterCommand::AddFilterMatcher(matcher)
                } else {
                    RouterCommand::AddOutputMatcher(matcher)
                };
                if self.router_ctl_tx.send(cmd).await.is_err() {
                    tracing::error!(runner = runner.name(), "router control channel closed");
                }
            }
        }

        for runner in &mut self.input_runners {
            runner.start(self.input_pool.clone(), self.router_tx.clone(), Arc::clone(&helper));
        }

        tracing::info!(
            inputs = self.input_runners.len(),
            "pipeline started"
        );

        PipelineHandle {
            globals: self.globals,
            runtime,
            router_task,
            router_ctl_tx: self.router_ctl_tx,
            input_runners: self.input_runners,
            input_token: self.input_token,
            filter_tracker,
            output_tracker,
            fo_shutdown,
            input_pool: self.input_pool,
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    globals: Arc<PipelineGlobals>,
    runtime: Arc<PipelineRuntime>,
    router_task: JoinHandle<()>,
    router_ctl_tx: mpsc::Sender<RouterCommand>,
    input_runners: Vec<InputRunner>,
    input_token: CancellationToken,
    filter_tracker: TaskTracker,
    output_tracker: TaskTracker,
    fo_shutdown: CancellationToken,
    input_pool: PackPool,
}

impl PipelineHandle {
    /// The helper surface, as plugins see it. Useful for feeding records in
    /// from embedding code and tests.
    pub fn helper(&self) -> Arc<dyn PluginHelper> {
        self.runtime.clone()
    }

    pub fn globals(&self) -> &Arc<PipelineGlobals> {
        &self.globals
    }

    /// The input pack pool; embedding code uses this to submit records on
    /// behalf of an external source.
    pub fn input_pool(&self) -> &PackPool {
        &self.input_pool
    }

    /// Feeds a pack into the router as an input would.
    pub async fn submit(&self, pack: PackLease) -> bool {
        self.runtime.router_tx.send(pack).await.is_ok()
    }

    /// A clone of the router's input sender, for producers that outlive
    /// this handle's borrows.
    pub fn record_tx(&self) -> mpsc::Sender<PackLease> {
        self.runtime.router_tx.clone()
    }

    /// Runs the full shutdown sequence and waits for every task.
    pub async fn shutdown(mut self) {
        tracing::info!("pipeline shutting down");
        self.globals.set_stopping();

        // 1. Stop inputs: no new records enter the router.
        self.input_token.cancel();
        for input in &mut self.input_runners {
            input.stop().await;
        }

        // 2. Drain the router; it dispatches what is queued, then drops its
        //    matcher lists, closing the matched delivery channels.
        if self.router_ctl_tx.send(RouterCommand::Drain).await.is_err() {
            tracing::debug!("router already gone at shutdown");
        }
        if let Err(e) = self.router_task.await {
            tracing::error!(error = %e, "router task join failed");
        }

        // 3. Close every remaining filter/output channel and wake their
        //    runners out of any blocking receive.
        self.runtime.release_runners();
        self.fo_shutdown.cancel();

        // 4. Wait for the runner wait-groups.
        self.filter_tracker.close();
        self.output_tracker.close();
        self.filter_tracker.wait().await;
        self.output_tracker.wait().await;
        tracing::info!("pipeline stopped");
    }
}

/// Runtime services shared by every running plugin; the engine's
/// [`PluginHelper`] implementation.
pub struct PipelineRuntime {
    weak_self: Weak<PipelineRuntime>,
    globals: Arc<PipelineGlobals>,
    registry: Arc<PluginRegistry>,
    inject_pool: PackPool,
    decoder_pool: DecoderSetPool,
    router_tx: mpsc::Sender<PackLease>,
    router_ctl_tx: mpsc::Sender<RouterCommand>,
    /// Guards the filter table. Held only across map mutation and runner
    /// start; never across an await.
    filters: Mutex<HashMap<String, FoHandle>>,
    outputs: Mutex<HashMap<String, FoHandle>>,
    filter_tracker: TaskTracker,
    fo_shutdown: CancellationToken,
}

impl PipelineRuntime {
    fn lock_filters(&self) -> std::sync::MutexGuard<'_, HashMap<String, FoHandle>> {
        self.filters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every runner delivery handle, closing the channels of runners
    /// the router was not fronting. Part of shutdown only.
    fn release_runners(&self) {
        self.lock_filters().clear();
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl PluginHelper for PipelineRuntime {
    fn output(&self, name: &str) -> Option<FoHandle> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    fn filter(&self, name: &str) -> Option<FoHandle> {
        self.lock_filters().get(name).cloned()
    }

    async fn decoder_set(&self) -> DecoderSetLease {
        self.decoder_pool.lease().await
    }

    async fn pipeline_pack(&self, msg_loop_count: u32) -> Option<PackLease> {
        self.inject_pool.acquire_inject(msg_loop_count).await
    }

    async fn add_filter(&self, name: &str, section: toml::Value) -> Result<()> {
        if self.globals.is_stopping() {
            return Err(PipelineError::Config("pipeline is stopping".to_string()));
        }

        let mut runner =
            build_fo_runner(&self.registry, self.globals.plugin_chan_size, name, &section)?;
        if runner.kind() != PluginKind::Filter {
            return Err(PipelineError::Config(format!("'{name}' is not a filter")));
        }
        let helper: Arc<dyn PluginHelper> = self
            .weak_self
            .upgrade()
            .ok_or_else(|| PipelineError::Config("pipeline is gone".to_string()))?;

        let matcher = {
            let mut filters = self.lock_filters();
            if filters.contains_key(name) {
                return Err(PipelineError::Config(format!("'{name}' is already running")));
            }
            let matcher = runner.start(
                self.inject_pool.clone(),
                self.router_tx.clone(),
                self.fo_shutdown.clone(),
                &self.filter_tracker,
                helper,
            );
            filters.insert(name.to_string(), runner.handle());
            matcher
        };

        if let Some(matcher) = matcher {
            if self.router_ctl_tx.send(RouterCommand::AddFilterMatcher(matcher)).await.is_err() {
                tracing::error!(filter = %name, "router control channel closed");
            }
        }
        tracing::info!(filter = %name, "filter runner added");
        Ok(())
    }

    async fn remove_filter(&self, name: &str) -> bool {
        if self.globals.is_stopping() {
            return false;
        }
        if !self.lock_filters().contains_key(name) {
            return false;
        }

        // Unregister the matcher first, then close the input channel by
        // dropping the table's delivery handle.
        if self
            .router_ctl_tx
            .send(RouterCommand::RemoveFilterMatcher(name.to_string()))
            .await
            .is_err()
        {
            tracing::debug!(filter = %name, "router already gone; removing entry anyway");
        }
        let removed = self.lock_filters().remove(name).is_some();
        if removed {
            tracing::info!(filter = %name, "filter runner removed");
        }
        removed
    }
}
