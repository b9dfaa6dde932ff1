// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end pipeline tests: fan-out recycling, injection loop caps, and
//! backpressure under a slow output.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use siphon_core::plugin::{
    Decoder, Filter, FoContext, FoEvent, Output, PluginHelper, PluginInstance, PluginKind,
    PluginRegistry,
};
use siphon_core::{async_trait, Message, PipelineError, PipelineGlobals, Result};
use siphon_engine::{ConfigLoader, PipelineHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

struct NopDecoder;

impl Decoder for NopDecoder {
    fn decode(&mut self, _raw: &[u8], _msg: &mut Message) -> Result<()> {
        Ok(())
    }
}

/// A registry carrying the two decoder names the loader synthesises
/// sections for; tests add their own plugins on top.
fn base_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register("JsonDecoder", PluginKind::Decoder, |_| {
        Ok(PluginInstance::Decoder(Box::new(NopDecoder)))
    });
    registry.register("ProtobufDecoder", PluginKind::Decoder, |_| {
        Ok(PluginInstance::Decoder(Box::new(NopDecoder)))
    });
    registry
}

/// Records every (type, loop count) pair it sees.
struct CollectOutput {
    seen: Arc<Mutex<Vec<(String, u32)>>>,
}

#[async_trait]
impl Output for CollectOutput {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        loop {
            match ctx.next().await {
                FoEvent::Pack(plc) => {
                    let entry =
                        (plc.pack.message.msg_type.clone(), plc.pack.msg_loop_count);
                    self.seen.lock().expect("collector poisoned").push(entry);
                }
                FoEvent::Tick => {}
                FoEvent::Closed => return Ok(()),
            }
        }
    }
}

/// Consumes nothing until a permit is available; the test controls the gate.
struct SlowOutput {
    gate: Arc<Semaphore>,
    processed: Arc<AtomicU64>,
}

#[async_trait]
impl Output for SlowOutput {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        loop {
            match ctx.next().await {
                FoEvent::Pack(plc) => {
                    let permit = self.gate.acquire().await.map_err(|e| {
                        PipelineError::Flow(format!("gate closed: {e}"))
                    })?;
                    permit.forget();
                    drop(plc);
                    self.processed.fetch_add(1, Ordering::SeqCst);
                }
                FoEvent::Tick => {}
                FoEvent::Closed => return Ok(()),
            }
        }
    }
}

/// Re-injects every record it receives, bumping the loop count, and counts
/// how many injects were refused by the loop cap.
struct EchoFilter {
    refused: Arc<AtomicU64>,
}

#[async_trait]
impl Filter for EchoFilter {
    async fn run(
        self: Box<Self>,
        ctx: &mut FoContext,
        _helper: Arc<dyn PluginHelper>,
    ) -> Result<()> {
        loop {
            match ctx.next().await {
                FoEvent::Pack(plc) => {
                    let loop_count = plc.pack.msg_loop_count;
                    let msg_type = plc.pack.message.msg_type.clone();
                    drop(plc);
                    match ctx.new_pack(loop_count).await {
                        Some(mut pack) => {
                            pack.message.msg_type.push_str(&msg_type);
                            pack.message.logger.push_str(ctx.name());
                            let _ = ctx.inject(pack).await;
                        }
                        None => {
                            ctx.log_error(&PipelineError::Flow(format!(
                                "exceeded MaxMsgLoops = {}",
                                ctx.max_msg_loops()
                            )));
                            self.refused.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                FoEvent::Tick => {}
                FoEvent::Closed => return Ok(()),
            }
        }
    }
}

async fn start_pipeline(
    registry: PluginRegistry,
    globals: PipelineGlobals,
    config: &str,
) -> PipelineHandle {
    let loader = ConfigLoader::new(Arc::new(registry), Arc::new(globals));
    loader.load_str(config).expect("config should load").start().await
}

async fn submit_typed(handle: &PipelineHandle, msg_type: &str) {
    let mut lease = handle.input_pool().acquire().await;
    lease.message.msg_type.push_str(msg_type);
    assert!(handle.submit(lease).await, "router should accept the record");
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn fanout_reaches_every_matching_runner_and_recycles() {
    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));

    let mut registry = base_registry();
    let (a, b) = (Arc::clone(&seen_a), Arc::clone(&seen_b));
    registry.register("CollectA", PluginKind::Output, move |_| {
        Ok(PluginInstance::Output(Box::new(CollectOutput { seen: Arc::clone(&a) })))
    });
    registry.register("CollectB", PluginKind::Output, move |_| {
        Ok(PluginInstance::Output(Box::new(CollectOutput { seen: Arc::clone(&b) })))
    });

    let handle = start_pipeline(
        registry,
        PipelineGlobals::new(4, 1, 8, 4),
        r#"
        [first]
        type = "CollectA"
        message_matcher = "Type == 'X'"

        [second]
        type = "CollectB"
        message_matcher = "Type == 'X'"
        "#,
    )
    .await;

    submit_typed(&handle, "X").await;
    submit_typed(&handle, "unrelated").await;

    wait_for("both outputs to see the record", || {
        !seen_a.lock().unwrap().is_empty() && !seen_b.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(seen_a.lock().unwrap().as_slice(), &[("X".to_string(), 0)]);
    assert_eq!(seen_b.lock().unwrap().as_slice(), &[("X".to_string(), 0)]);

    // Both records fully released: the pool refills to capacity.
    let pool = handle.input_pool().clone();
    wait_for("the pool to refill", || pool.idle() == 4).await;

    timeout(Duration::from_secs(5), handle.shutdown()).await.expect("shutdown hung");
}

#[tokio::test]
async fn injection_stops_at_the_loop_cap() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let refused = Arc::new(AtomicU64::new(0));

    let mut registry = base_registry();
    let (seen_reg, refused_reg) = (Arc::clone(&seen), Arc::clone(&refused));
    registry.register("CollectOutput", PluginKind::Output, move |_| {
        Ok(PluginInstance::Output(Box::new(CollectOutput { seen: Arc::clone(&seen_reg) })))
    });
    registry.register("EchoFilter", PluginKind::Filter, move |_| {
        Ok(PluginInstance::Filter(Box::new(EchoFilter { refused: Arc::clone(&refused_reg) })))
    });

    // Loop cap of 2: the original record plus two injected generations.
    let handle = start_pipeline(
        registry,
        PipelineGlobals::new(4, 1, 8, 2),
        r#"
        [echo]
        type = "EchoFilter"
        message_matcher = "Type == 'ping'"

        [collect]
        type = "CollectOutput"
        message_matcher = "Type == 'ping'"
        "#,
    )
    .await;

    submit_typed(&handle, "ping").await;

    wait_for("the inject chain to exhaust", || refused.load(Ordering::SeqCst) == 1).await;
    // Exactly three generations observed: loop counts 0, 1, 2.
    wait_for("three generations", || seen.lock().unwrap().len() == 3).await;
    sleep(Duration::from_millis(50)).await;
    let observed = seen.lock().unwrap().clone();
    assert_eq!(
        observed,
        vec![("ping".to_string(), 0), ("ping".to_string(), 1), ("ping".to_string(), 2)]
    );
    assert_eq!(refused.load(Ordering::SeqCst), 1, "exactly one inject past the cap");

    // Nothing leaked from either pool.
    let input_pool = handle.input_pool().clone();
    wait_for("input pool refill", || input_pool.idle() == 4).await;

    timeout(Duration::from_secs(5), handle.shutdown()).await.expect("shutdown hung");
}

#[tokio::test]
async fn backpressure_blocks_producers_without_dropping() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let gate = Arc::new(Semaphore::new(0));
    let processed = Arc::new(AtomicU64::new(0));

    let mut registry = base_registry();
    let (gate_reg, processed_reg) = (Arc::clone(&gate), Arc::clone(&processed));
    registry.register("SlowOutput", PluginKind::Output, move |_| {
        Ok(PluginInstance::Output(Box::new(SlowOutput {
            gate: Arc::clone(&gate_reg),
            processed: Arc::clone(&processed_reg),
        })))
    });

    // Tiny pool and channels so the flood saturates quickly.
    let handle = start_pipeline(
        registry,
        PipelineGlobals::new(4, 1, 2, 4),
        r#"
        [sink]
        type = "SlowOutput"
        message_matcher = "TRUE"
        "#,
    )
    .await;

    const FLOOD: u64 = 12;
    let pool = handle.input_pool().clone();
    let record_tx = handle.record_tx();
    let submitted = Arc::new(AtomicU64::new(0));
    let flood_task = tokio::spawn({
        let pool = pool.clone();
        let submitted = Arc::clone(&submitted);
        async move {
            for _ in 0..FLOOD {
                // Pool acquisition is where overload parks the producer.
                let mut lease = pool.acquire().await;
                lease.message.msg_type.push_str("flood");
                if record_tx.send(lease).await.is_err() {
                    return;
                }
                submitted.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    // With the output gated shut, the whole pipeline backs up: every pack
    // is in flight, the producer is blocked, and nothing was processed.
    wait_for("the pool to empty", || pool.idle() == 0).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 0);
    assert!(!flood_task.is_finished(), "producer should be blocked on the pool");
    let stalled_at = submitted.load(Ordering::SeqCst);
    assert!(
        stalled_at < FLOOD,
        "submission should stall under backpressure, got {stalled_at}"
    );

    // Open the gate: everything flows through, nothing was dropped.
    gate.add_permits(usize::try_from(FLOOD).unwrap());
    timeout(Duration::from_secs(5), flood_task).await.expect("flood hung").unwrap();
    let processed_ref = Arc::clone(&processed);
    wait_for("all records to be processed", || {
        processed_ref.load(Ordering::SeqCst) == FLOOD
    })
    .await;
    wait_for("the pool to refill", || pool.idle() == 4).await;

    timeout(Duration::from_secs(5), handle.shutdown()).await.expect("shutdown hung");
}
