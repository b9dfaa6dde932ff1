// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Task host for input plugins.

use crate::MAX_PLUGIN_RESTARTS;
use futures::FutureExt;
use siphon_core::pack::{PackLease, PackPool};
use siphon_core::plugin::{InputContext, PluginHelper, PluginInstance, PluginWrapper};
use siphon_core::PipelineError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drives one input plugin on its own task.
///
/// The plugin's blocking read loop runs until the cancellation token fires.
/// Errors are logged and the plugin is rebuilt from its wrapper a bounded
/// number of times; panics are caught at this boundary and treated the same
/// way.
pub struct InputRunner {
    name: Arc<str>,
    wrapper: PluginWrapper,
    instance: Option<PluginInstance>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl InputRunner {
    pub fn new(wrapper: PluginWrapper, instance: PluginInstance, token: CancellationToken) -> Self {
        Self {
            name: Arc::from(wrapper.name()),
            wrapper,
            instance: Some(instance),
            token,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the plugin's run loop.
    pub fn start(
        &mut self,
        input_pool: PackPool,
        router_tx: mpsc::Sender<PackLease>,
        helper: Arc<dyn PluginHelper>,
    ) {
        let name = Arc::clone(&self.name);
        let wrapper = self.wrapper.clone();
        let instance = self.instance.take();
        let token = self.token.clone();
        let mut ctx = InputContext::new(Arc::clone(&name), input_pool, router_tx, token.clone());

        self.handle = Some(tokio::spawn(async move {
            let mut instance = instance;
            let mut restarts = 0;
            loop {
                let plugin = match instance.take() {
                    Some(PluginInstance::Input(plugin)) => plugin,
                    Some(_) => unreachable!("input runner holds a non-input plugin"),
                    None => match wrapper.create() {
                        Ok(PluginInstance::Input(plugin)) => plugin,
                        Ok(_) => unreachable!("input runner holds a non-input plugin"),
                        Err(e) => {
                            tracing::error!(plugin = %name, error = %e, "input restart failed");
                            break;
                        }
                    },
                };

                let result = AssertUnwindSafe(plugin.run(&mut ctx, Arc::clone(&helper)))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_to_error(&name, panic)));

                match result {
                    Ok(()) => break,
                    Err(_) if token.is_cancelled() => break,
                    Err(e) => {
                        tracing::error!(plugin = %name, error = %e, "input plugin failed");
                        if restarts >= MAX_PLUGIN_RESTARTS {
                            tracing::error!(plugin = %name, "input gave up after {MAX_PLUGIN_RESTARTS} restarts");
                            break;
                        }
                        restarts += 1;
                    }
                }
            }
            tracing::info!(plugin = %name, "input stopped");
        }));
    }

    /// Cancels the plugin and waits for its task to exit.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(plugin = %self.name, error = %e, "input task join failed");
            }
        }
    }
}

pub(crate) fn panic_to_error(plugin: &str, panic: Box<dyn std::any::Any + Send>) -> PipelineError {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    PipelineError::PluginRuntime { plugin: plugin.to_string(), reason: format!("panicked: {reason}") }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::NopHelper;
    use siphon_core::plugin::{Input, InputContext, PluginFactory, PluginKind};
    use siphon_core::{async_trait, Result};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Delivers one record, then parks until cancelled.
    struct OneShotInput;

    #[async_trait]
    impl Input for OneShotInput {
        async fn run(
            self: Box<Self>,
            ctx: &mut InputContext,
            _helper: Arc<dyn PluginHelper>,
        ) -> Result<()> {
            let mut pack = ctx.new_pack().await;
            pack.message.msg_type.push_str("one.shot");
            ctx.deliver(pack).await;
            ctx.token().cancelled().await;
            Ok(())
        }
    }

    /// Panics immediately; used to prove the restart ceiling holds.
    struct PanickingInput;

    #[async_trait]
    impl Input for PanickingInput {
        async fn run(
            self: Box<Self>,
            _ctx: &mut InputContext,
            _helper: Arc<dyn PluginHelper>,
        ) -> Result<()> {
            panic!("wire fell out");
        }
    }

    #[tokio::test]
    async fn delivers_then_stops_on_cancel() {
        let factory: PluginFactory =
            Arc::new(|_| Ok(PluginInstance::Input(Box::new(OneShotInput))));
        let wrapper = PluginWrapper::new("one", PluginKind::Input, factory, None);
        let instance = wrapper.create().unwrap();
        let mut runner = InputRunner::new(wrapper, instance, CancellationToken::new());

        let pool = PackPool::new(2, 4);
        let (router_tx, mut router_rx) = mpsc::channel(4);
        runner.start(pool.clone(), router_tx, Arc::new(NopHelper::new()));

        let lease = timeout(Duration::from_secs(1), router_rx.recv())
            .await
            .unwrap()
            .expect("input should deliver one record");
        assert_eq!(lease.message.msg_type, "one.shot");
        drop(lease);

        timeout(Duration::from_secs(5), runner.stop()).await.expect("stop hung");
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn panicking_input_stops_after_bounded_restarts() {
        let factory: PluginFactory =
            Arc::new(|_| Ok(PluginInstance::Input(Box::new(PanickingInput))));
        let wrapper = PluginWrapper::new("bad", PluginKind::Input, factory, None);
        let instance = wrapper.create().unwrap();
        let mut runner = InputRunner::new(wrapper, instance, CancellationToken::new());

        let pool = PackPool::new(2, 4);
        let (router_tx, _router_rx) = mpsc::channel(4);
        runner.start(pool, router_tx, Arc::new(NopHelper::new()));

        // The task ends on its own once the restart budget is spent.
        timeout(Duration::from_secs(5), runner.stop()).await.expect("runner never gave up");
    }
}
