// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Message-rate counter filter.
//!
//! Counts every matched record and, on each ticker fire, injects a
//! `siphon.counter-output` record carrying the rate since the previous tick.
//! Every ten samples it also injects a min/max/mean summary.

use siphon_core::plugin::{parse_config, Filter, FoContext, FoEvent, PluginHelper};
use siphon_core::{async_trait, PipelineError, Result};
use std::sync::Arc;
use std::time::Instant;

const SUMMARY_SAMPLES: usize = 10;

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct CounterFilterConfig {}

#[derive(Default)]
pub struct CounterFilter {
    last_time: Option<Instant>,
    last_count: u64,
    count: u64,
    rates: Vec<f64>,
}

impl CounterFilter {
    /// Builds the filter; the section carries no filter-specific keys today
    /// but is decoded so future ones fail loudly rather than silently.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PluginInit`] for an undecodable section.
    pub fn from_config(config: Option<&toml::Value>) -> Result<Self> {
        let _: CounterFilterConfig = parse_config("CounterFilter", config)?;
        Ok(Self::default())
    }

    async fn tally(&mut self, ctx: &FoContext, msg_loop_count: u32) {
        let msgs_sent = self.count - self.last_count;
        if msgs_sent == 0 {
            return;
        }

        let now = Instant::now();
        let elapsed = self.last_time.map_or(0.0, |t| now.duration_since(t).as_secs_f64());
        self.last_time = Some(now);
        self.last_count = self.count;
        #[allow(clippy::cast_precision_loss)]
        let rate = if elapsed > 0.0 { msgs_sent as f64 / elapsed } else { 0.0 };
        self.rates.push(rate);

        let Some(mut pack) = ctx.new_pack(msg_loop_count).await else {
            ctx.log_error(&PipelineError::Flow(format!(
                "exceeded MaxMsgLoops = {}",
                ctx.max_msg_loops()
            )));
            return;
        };
        pack.message.msg_type.push_str("siphon.counter-output");
        pack.message.logger.push_str(ctx.name());
        pack.message.payload = format!("Got {} messages. {:.2} msg/sec", self.count, rate);
        if !ctx.inject(pack).await {
            return;
        }

        if self.rates.len() == SUMMARY_SAMPLES {
            let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
            for &sample in &self.rates {
                min = min.min(sample);
                max = max.max(sample);
                sum += sample;
            }
            #[allow(clippy::cast_precision_loss)]
            let mean = sum / self.rates.len() as f64;

            let Some(mut pack) = ctx.new_pack(msg_loop_count).await else {
                ctx.log_error(&PipelineError::Flow(format!(
                    "exceeded MaxMsgLoops = {}",
                    ctx.max_msg_loops()
                )));
                return;
            };
            pack.message.msg_type.push_str("siphon.counter-output");
            pack.message.logger.push_str(ctx.name());
            pack.message.payload =
                format!("AGG Sum. Min: {min:.2}    Max: {max:.2}    Mean: {mean:.2}");
            let _ = ctx.inject(pack).await;
            self.rates.clear();
        }
    }
}

#[async_trait]
impl Filter for CounterFilter {
    async fn run(
        mut self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        self.last_time = Some(Instant::now());
        let mut msg_loop_count = 0;
        loop {
            match ctx.next().await {
                FoEvent::Pack(plc) => {
                    msg_loop_count = plc.pack.msg_loop_count;
                    self.count += 1;
                }
                FoEvent::Tick => self.tally(ctx, msg_loop_count).await,
                FoEvent::Closed => return Ok(()),
            }
        }
    }
}
