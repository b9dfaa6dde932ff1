// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The message router: the fan-out heart of the pipeline.
//!
//! The router task owns the filter and output matcher lists outright;
//! membership changes only ever arrive through its control channel, so
//! evaluation never races a mutation. Per record it evaluates every
//! registered matcher and delivers a shared handle (plus the extracted
//! captures) to each matched runner's input channel. Those sends wait for
//! channel capacity; that is the pipeline's backpressure primitive, and it
//! propagates upstream through the pack pools.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use siphon_core::matcher::MatchRunner;
use siphon_core::pack::PackLease;
use tokio::sync::mpsc;

/// Most control messages applied between two record dispatches. Bounded so
/// a burst of mutations cannot starve the data path.
const CONTROL_DRAIN_LIMIT: usize = 32;

/// Membership mutations for the router's matcher lists.
///
/// Mutations are idempotent: adding a matcher for a runner name that is
/// already present replaces it, and removing an absent name is a no-op.
#[derive(Debug)]
pub enum RouterCommand {
    AddFilterMatcher(MatchRunner),
    RemoveFilterMatcher(String),
    AddOutputMatcher(MatchRunner),
    RemoveOutputMatcher(String),
    /// Finish whatever is already queued on the input channel, close every
    /// delivery channel, and exit. Sent once during shutdown, after inputs
    /// have stopped.
    Drain,
}

pub struct MessageRouter {
    in_rx: mpsc::Receiver<PackLease>,
    ctl_rx: mpsc::Receiver<RouterCommand>,
    f_matchers: Vec<MatchRunner>,
    o_matchers: Vec<MatchRunner>,
    dispatched: Counter<u64>,
    no_match: Counter<u64>,
    deliveries: Counter<u64>,
}

impl MessageRouter {
    pub fn new(in_rx: mpsc::Receiver<PackLease>, ctl_rx: mpsc::Receiver<RouterCommand>) -> Self {
        let meter = global::meter("siphon_engine");
        Self {
            in_rx,
            ctl_rx,
            f_matchers: Vec::new(),
            o_matchers: Vec::new(),
            dispatched: meter
                .u64_counter("router.dispatched")
                .with_description("Records fanned out to at least one runner")
                .build(),
            no_match: meter
                .u64_counter("router.no_match")
                .with_description("Records that matched nothing and were recycled immediately")
                .build(),
            deliveries: meter
                .u64_counter("router.deliveries")
                .with_description("Individual record deliveries to runner channels")
                .build(),
        }
    }

    /// The router main loop. Control messages preempt the data path so
    /// membership changes stay timely under load.
    pub async fn run(mut self) {
        tracing::debug!("message router started");

        let mut draining = false;
        while !draining {
            tokio::select! {
                biased;

                cmd = self.ctl_rx.recv() => match cmd {
                    Some(RouterCommand::Drain) | None => draining = true,
                    Some(cmd) => self.apply(cmd),
                },

                lease = self.in_rx.recv() => match lease {
                    Some(lease) => {
                        draining = self.drain_control();
                        self.dispatch(lease).await;
                    }
                    None => break,
                },
            }
        }

        // Consume what is already queued, then drop the matcher lists; that
        // closes every delivery channel and lets the runners drain out.
        while let Ok(lease) = self.in_rx.try_recv() {
            self.dispatch(lease).await;
        }
        tracing::debug!(
            filters = self.f_matchers.len(),
            outputs = self.o_matchers.len(),
            "message router drained; closing delivery channels"
        );
    }

    /// Applies pending control messages without blocking the data path.
    /// Returns true when a Drain was encountered.
    fn drain_control(&mut self) -> bool {
        for _ in 0..CONTROL_DRAIN_LIMIT {
            match self.ctl_rx.try_recv() {
                Ok(RouterCommand::Drain) => return true,
                Ok(cmd) => self.apply(cmd),
                Err(_) => break,
            }
        }
        false
    }

    fn apply(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::AddFilterMatcher(runner) => Self::add(&mut self.f_matchers, runner),
            RouterCommand::RemoveFilterMatcher(name) => Self::remove(&mut self.f_matchers, &name),
            RouterCommand::AddOutputMatcher(runner) => Self::add(&mut self.o_matchers, runner),
            RouterCommand::RemoveOutputMatcher(name) => Self::remove(&mut self.o_matchers, &name),
            RouterCommand::Drain => unreachable!("Drain is handled by the main loop"),
        }
    }

    fn add(list: &mut Vec<MatchRunner>, runner: MatchRunner) {
        list.retain(|m| m.runner_name() != runner.runner_name());
        tracing::debug!(runner = runner.runner_name(), "matcher registered");
        list.push(runner);
    }

    fn remove(list: &mut Vec<MatchRunner>, name: &str) {
        list.retain(|m| m.runner_name() != name);
    }

    /// Evaluates every matcher against the record and delivers to the ones
    /// that matched. With zero matches the lease drop recycles the pack on
    /// the spot.
    async fn dispatch(&mut self, lease: PackLease) {
        let mut matched: Vec<(bool, usize, siphon_core::matcher::Captures)> = Vec::new();
        {
            let msg = &lease.message;
            for (idx, matcher) in self.f_matchers.iter().enumerate() {
                if let Some(captures) = matcher.evaluate(msg) {
                    matched.push((true, idx, captures));
                }
            }
            for (idx, matcher) in self.o_matchers.iter().enumerate() {
                if let Some(captures) = matcher.evaluate(msg) {
                    matched.push((false, idx, captures));
                }
            }
        }

        if matched.is_empty() {
            self.no_match.add(1, &[]);
            return;
        }
        self.dispatched.add(1, &[]);
        self.deliveries.add(matched.len() as u64, &[]);

        let shared = lease.into_shared();
        let mut closed: Vec<(bool, String)> = Vec::new();
        for (is_filter, idx, captures) in matched {
            let matcher = if is_filter { &self.f_matchers[idx] } else { &self.o_matchers[idx] };
            if !matcher.deliver(shared.clone(), captures).await {
                tracing::debug!(
                    runner = matcher.runner_name(),
                    "delivery channel closed; evicting matcher"
                );
                closed.push((is_filter, matcher.runner_name().to_string()));
            }
        }
        drop(shared);

        for (is_filter, name) in closed {
            if is_filter {
                Self::remove(&mut self.f_matchers, &name);
            } else {
                Self::remove(&mut self.o_matchers, &name);
            }
        }
    }
}
