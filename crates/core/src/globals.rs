// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide pipeline tuning knobs and the shutdown gate.

use std::sync::atomic::{AtomicBool, Ordering};

/// Default number of packs in each of the input and inject pools.
const DEFAULT_POOL_SIZE: usize = 100;

/// Default number of decoder sets circulating through the decoder pool.
const DEFAULT_DECODER_POOL_SIZE: usize = 4;

/// Default capacity of the router input channel and of each filter/output
/// input channel.
const DEFAULT_PLUGIN_CHAN_SIZE: usize = 50;

/// Default cap on how many times a record lineage may be re-injected.
const DEFAULT_MAX_MSG_LOOPS: u32 = 4;

/// Shared pipeline settings, fixed at startup apart from the `stopping` flag.
///
/// Shared as an `Arc` between the runtime, the pools, and the runners. The
/// `stopping` flag gates work that must not begin once shutdown has started,
/// most notably dynamic filter removal.
#[derive(Debug)]
pub struct PipelineGlobals {
    /// Capacity of the input and inject pack pools (each).
    pub pool_size: usize,
    /// Number of decoder sets available for concurrent lease.
    pub decoder_pool_size: usize,
    /// Capacity of the router and filter/output input channels.
    pub plugin_chan_size: usize,
    /// Upper bound on a record's inject loop count.
    pub max_msg_loops: u32,
    stopping: AtomicBool,
}

impl Default for PipelineGlobals {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            decoder_pool_size: DEFAULT_DECODER_POOL_SIZE,
            plugin_chan_size: DEFAULT_PLUGIN_CHAN_SIZE,
            max_msg_loops: DEFAULT_MAX_MSG_LOOPS,
            stopping: AtomicBool::new(false),
        }
    }
}

impl PipelineGlobals {
    pub fn new(
        pool_size: usize,
        decoder_pool_size: usize,
        plugin_chan_size: usize,
        max_msg_loops: u32,
    ) -> Self {
        Self {
            pool_size,
            decoder_pool_size,
            plugin_chan_size,
            max_msg_loops,
            stopping: AtomicBool::new(false),
        }
    }

    /// True once shutdown has begun. No new runners may be added or removed
    /// past this point.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopping_flag_latches() {
        let globals = PipelineGlobals::default();
        assert!(!globals.is_stopping());
        globals.set_stopping();
        assert!(globals.is_stopping());
    }
}
