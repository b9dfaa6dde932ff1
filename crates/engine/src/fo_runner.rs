// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Task host for filter and output plugins.
//!
//! An [`FoRunner`] is assembled by the config loader (or by the manager
//! filter at runtime) and started by the pipeline. Starting spawns the
//! plugin's run loop on the lifecycle tracker and yields the runner's
//! [`MatchRunner`] for router registration. After the plugin returns, the
//! host drains the input channel until it closes so a finished plugin can
//! never block the router.

use crate::input::panic_to_error;
use crate::MAX_PLUGIN_RESTARTS;
use futures::FutureExt;
use siphon_core::matcher::{CompiledMatcher, MatchRunner};
use siphon_core::pack::{PackCapture, PackLease, PackPool};
use siphon_core::plugin::{
    FoContext, FoHandle, PluginHelper, PluginInstance, PluginKind, PluginWrapper,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct FoRunner {
    name: Arc<str>,
    kind: PluginKind,
    wrapper: PluginWrapper,
    instance: Option<PluginInstance>,
    in_tx: mpsc::Sender<PackCapture>,
    in_rx: Option<mpsc::Receiver<PackCapture>>,
    ticker_interval: Option<Duration>,
    matcher: Option<CompiledMatcher>,
}

impl FoRunner {
    /// Builds a runner around an already-constructed plugin instance.
    /// `kind` must be `Filter` or `Output` and match the instance.
    pub fn new(
        wrapper: PluginWrapper,
        instance: PluginInstance,
        chan_size: usize,
        ticker_interval: Option<Duration>,
        matcher: Option<CompiledMatcher>,
    ) -> Self {
        let kind = instance.kind();
        assert!(
            matches!(kind, PluginKind::Filter | PluginKind::Output),
            "FoRunner built for a {kind} plugin"
        );
        let (in_tx, in_rx) = mpsc::channel(chan_size);
        Self {
            name: Arc::from(wrapper.name()),
            kind,
            wrapper,
            instance: Some(instance),
            in_tx,
            in_rx: Some(in_rx),
            ticker_interval,
            matcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Delivery handle for this runner's input channel. Valid before and
    /// after start.
    pub fn handle(&self) -> FoHandle {
        FoHandle::new(Arc::clone(&self.name), self.in_tx.clone())
    }

    /// Spawns the plugin run loop on `tracker` and returns the match runner
    /// to register with the router, if a matcher was configured.
    ///
    /// # Panics
    ///
    /// Panics when called twice; a runner starts exactly once.
    pub fn start(
        &mut self,
        inject_pool: PackPool,
        router_tx: mpsc::Sender<PackLease>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
        helper: Arc<dyn PluginHelper>,
    ) -> Option<MatchRunner> {
        let in_rx = self.in_rx.take().unwrap_or_else(|| {
            panic!("filter/output runner '{}' started twice", self.name)
        });
        let mut ctx = FoContext::new(
            Arc::clone(&self.name),
            in_rx,
            self.ticker_interval,
            inject_pool,
            router_tx,
            shutdown,
        );

        let name = Arc::clone(&self.name);
        let kind = self.kind;
        let wrapper = self.wrapper.clone();
        let mut instance = self.instance.take();

        tracker.spawn(async move {
            let mut restarts = 0;
            loop {
                let plugin = match instance.take() {
                    Some(plugin) => plugin,
                    None => match wrapper.create() {
                        Ok(plugin) => plugin,
                        Err(e) => {
                            tracing::error!(plugin = %name, error = %e, "restart failed");
                            break;
                        }
                    },
                };

                let result = match plugin {
                    PluginInstance::Filter(p) => {
                        AssertUnwindSafe(p.run(&mut ctx, Arc::clone(&helper))).catch_unwind().await
                    }
                    PluginInstance::Output(p) => {
                        AssertUnwindSafe(p.run(&mut ctx, Arc::clone(&helper))).catch_unwind().await
                    }
                    _ => unreachable!("FoRunner holds a non-filter/output plugin"),
                };
                let result = result.unwrap_or_else(|panic| Err(panic_to_error(&name, panic)));

                match result {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(plugin = %name, kind = %kind, error = %e, "plugin failed");
                        if restarts >= MAX_PLUGIN_RESTARTS {
                            tracing::error!(plugin = %name, "gave up after {MAX_PLUGIN_RESTARTS} restarts");
                            break;
                        }
                        restarts += 1;
                    }
                }
            }

            // Keep consuming so the router never blocks on a dead runner.
            ctx.drain_until_closed().await;
            tracing::info!(plugin = %name, kind = %kind, "runner stopped");
        });

        self.matcher
            .take()
            .map(|matcher| MatchRunner::new(Arc::clone(&self.name), matcher, self.in_tx.clone()))
    }
}

impl std::fmt::Debug for FoRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoRunner")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("ticker_interval", &self.ticker_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::NopHelper;
    use siphon_core::matcher::Captures;
    use siphon_core::plugin::{FoEvent, PluginFactory};
    use siphon_core::{async_trait, Filter, PipelineError, Result};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Fails on its first record in its first incarnation; collects payloads
    /// afterwards.
    struct FlakyFilter {
        incarnation: u32,
        collected: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Filter for FlakyFilter {
        async fn run(
            self: Box<Self>,
            ctx: &mut FoContext,
            _helper: Arc<dyn PluginHelper>,
        ) -> Result<()> {
            loop {
                match ctx.next().await {
                    FoEvent::Pack(plc) => {
                        if self.incarnation == 0 {
                            return Err(PipelineError::Flow("synthetic failure".to_string()));
                        }
                        self.collected
                            .lock()
                            .unwrap()
                            .push(plc.pack.message.payload.clone());
                    }
                    FoEvent::Tick => {}
                    FoEvent::Closed => return Ok(()),
                }
            }
        }
    }

    #[tokio::test]
    async fn crashed_plugin_is_rebuilt_from_its_wrapper() {
        let creations = Arc::new(AtomicU32::new(0));
        let collected = Arc::new(Mutex::new(Vec::new()));

        let factory: PluginFactory = {
            let creations = Arc::clone(&creations);
            let collected = Arc::clone(&collected);
            Arc::new(move |_| {
                let incarnation = creations.fetch_add(1, Ordering::SeqCst);
                Ok(PluginInstance::Filter(Box::new(FlakyFilter {
                    incarnation,
                    collected: Arc::clone(&collected),
                })))
            })
        };
        let wrapper = PluginWrapper::new("flaky", PluginKind::Filter, factory, None);
        let instance = wrapper.create().unwrap();
        let mut runner = FoRunner::new(
            wrapper,
            instance,
            8,
            None,
            Some(siphon_core::CompiledMatcher::compile("TRUE", None).unwrap()),
        );

        let helper = Arc::new(NopHelper::new());
        let pool = siphon_core::PackPool::new(4, 4);
        let (router_tx, _router_rx) = mpsc::channel(8);
        let tracker = TaskTracker::new();
        let matcher = runner
            .start(
                helper.inject_pool.clone(),
                router_tx,
                CancellationToken::new(),
                &tracker,
                helper.clone(),
            )
            .expect("a matcher was configured");

        // First record crashes incarnation 0; second reaches incarnation 1.
        for payload in ["first", "second"] {
            let mut lease = pool.acquire().await;
            lease.message.payload.push_str(payload);
            assert!(matcher.deliver(lease.into_shared(), Captures::default()).await);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while collected.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "restart never delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(collected.lock().unwrap().as_slice(), &["second".to_string()]);
        assert_eq!(creations.load(Ordering::SeqCst), 2);

        // Dropping every sender ends the runner cleanly.
        drop(matcher);
        drop(runner);
        tracker.close();
        timeout(Duration::from_secs(5), tracker.wait()).await.expect("runner never exited");
        // Both packs made it back to the pool.
        assert_eq!(pool.idle(), 4);
    }
}
