// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pack pooling and the record recycling protocol.
//!
//! A [`PipelinePack`] is the unit of flow: a [`Message`] plus routing
//! metadata. Packs are never allocated on the hot path; they circulate
//! through bounded pools and return to their origin pool when the last
//! holder lets go.
//!
//! Two handle types enforce the sharing rules in the type system:
//! - [`PackLease`]: exclusive, mutable. Held from acquisition until the
//!   router fans the pack out. Dropping an unrouted lease recycles the pack.
//! - [`SharedPack`]: read-only, cloned once per matched downstream. Each
//!   clone is a ref-count bump; the final drop recovers the pack and returns
//!   it to its origin pool.
//!
//! There are two independent pools per runtime: one for input-originated
//! packs and one for injection-originated packs. Filters inject from inside
//! the router's downstream path, so drawing injections from the input pool
//! could wedge the whole pipeline once every input pack is queued
//! downstream. Keep them separate.

use crate::message::Message;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// The in-flight record carrier: a message plus routing metadata.
#[derive(Debug)]
pub struct PipelinePack {
    pub message: Message,
    /// How many times this record's lineage has been re-injected.
    pub msg_loop_count: u32,
    /// Restock handle of the pool this pack belongs to for its entire life.
    origin: mpsc::Sender<PipelinePack>,
}

impl PipelinePack {
    fn new(origin: mpsc::Sender<PipelinePack>) -> Self {
        Self { message: Message::new(), msg_loop_count: 0, origin }
    }

    fn reset(&mut self) {
        self.message.clear();
        self.msg_loop_count = 0;
    }
}

fn recycle(mut pack: PipelinePack) {
    let origin = pack.origin.clone();
    pack.reset();
    // The pool channel capacity equals the number of packs ever created for
    // it, so a full channel here means a pack was recycled twice.
    assert!(origin.try_send(pack).is_ok(), "pack pool overflow on recycle");
}

/// Exclusive handle to a pack: mutable access, not yet on any channel.
#[derive(Debug)]
pub struct PackLease {
    pack: Option<PipelinePack>,
}

impl PackLease {
    /// Freezes the pack for fan-out. The returned handle is read-only and
    /// cheaply cloneable; the pack returns to its pool when the last clone
    /// is dropped.
    pub fn into_shared(mut self) -> SharedPack {
        SharedPack { inner: self.pack.take().map(Arc::new) }
    }
}

impl Deref for PackLease {
    type Target = PipelinePack;

    fn deref(&self) -> &PipelinePack {
        match &self.pack {
            Some(pack) => pack,
            None => unreachable!("pack lease accessed after consumption"),
        }
    }
}

impl DerefMut for PackLease {
    fn deref_mut(&mut self) -> &mut PipelinePack {
        match &mut self.pack {
            Some(pack) => pack,
            None => unreachable!("pack lease accessed after consumption"),
        }
    }
}

impl Drop for PackLease {
    fn drop(&mut self) {
        if let Some(pack) = self.pack.take() {
            recycle(pack);
        }
    }
}

/// Shared read-only handle to a routed pack.
///
/// Cloning bumps the ref count; every holder must eventually drop its clone.
/// The drop that brings the count to zero recovers the pack and restocks the
/// origin pool.
#[derive(Debug, Clone)]
pub struct SharedPack {
    inner: Option<Arc<PipelinePack>>,
}

impl Deref for SharedPack {
    type Target = PipelinePack;

    fn deref(&self) -> &PipelinePack {
        match &self.inner {
            Some(pack) => pack,
            None => unreachable!("shared pack accessed after drop"),
        }
    }
}

impl Drop for SharedPack {
    fn drop(&mut self) {
        let Some(arc) = self.inner.take() else { return };
        if let Ok(pack) = Arc::try_unwrap(arc) {
            recycle(pack);
        }
    }
}

/// A matched pack and the bindings its match expression extracted.
#[derive(Debug, Clone)]
pub struct PackCapture {
    pub pack: SharedPack,
    pub captures: crate::matcher::Captures,
}

/// Bounded pool of recyclable packs.
///
/// The pool is a channel: acquisition is a receive (blocking when every pack
/// is in flight, which is how overload propagates back to inputs), recycling
/// is a send performed by the handle drops above.
#[derive(Debug, Clone)]
pub struct PackPool {
    tx: mpsc::Sender<PipelinePack>,
    rx: Arc<Mutex<mpsc::Receiver<PipelinePack>>>,
    hostname: Arc<str>,
    pid: u32,
    max_msg_loops: u32,
}

impl PackPool {
    /// Creates a pool pre-filled with `capacity` packs.
    pub fn new(capacity: usize, max_msg_loops: u32) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel was sized for exactly these sends.
            assert!(tx.try_send(PipelinePack::new(tx.clone())).is_ok(), "pack pool prefill overflow");
        }
        let host = hostname::get().map_or_else(|_| String::new(), |h| h.to_string_lossy().into_owned());
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            hostname: Arc::from(host),
            pid: std::process::id(),
            max_msg_loops,
        }
    }

    /// Acquires a cleared pack, waiting until one is recycled if the pool is
    /// empty. The returned lease has loop count 0 and an empty message.
    pub async fn acquire(&self) -> PackLease {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(pack) => PackLease { pack: Some(pack) },
            // The pool itself holds a sender, so the channel cannot close.
            None => unreachable!("pack pool channel closed"),
        }
    }

    /// Acquires a pack for injection, stamping identity and bumping the loop
    /// count. Returns `None` when the new loop count would exceed the cap;
    /// the caller must log and drop.
    pub async fn acquire_inject(&self, parent_loop_count: u32) -> Option<PackLease> {
        let loop_count = parent_loop_count + 1;
        if loop_count > self.max_msg_loops {
            return None;
        }
        let mut lease = self.acquire().await;
        lease.msg_loop_count = loop_count;
        lease.message.stamp(&self.hostname, self.pid);
        Some(lease)
    }

    /// Number of packs currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn max_msg_loops(&self) -> u32 {
        self.max_msg_loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_returns_to_pool_on_drop() {
        let pool = PackPool::new(2, 4);
        assert_eq!(pool.idle(), 2);

        let lease = pool.acquire().await;
        assert_eq!(pool.idle(), 1);
        drop(lease);
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn shared_pack_recycles_after_last_clone() {
        let pool = PackPool::new(1, 4);
        let mut lease = pool.acquire().await;
        lease.message.msg_type.push_str("X");

        let shared = lease.into_shared();
        let a = shared.clone();
        let b = shared.clone();
        drop(shared);
        assert_eq!(pool.idle(), 0);
        drop(a);
        assert_eq!(pool.idle(), 0);
        drop(b);
        assert_eq!(pool.idle(), 1);

        // The recycled pack comes back cleared.
        let lease = pool.acquire().await;
        assert!(lease.message.msg_type.is_empty());
        assert_eq!(lease.msg_loop_count, 0);
    }

    #[tokio::test]
    async fn acquire_blocks_until_recycle() {
        let pool = PackPool::new(1, 4);
        let lease = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(lease);
        let lease = waiter.await.expect("acquire task panicked");
        assert_eq!(lease.msg_loop_count, 0);
    }

    #[tokio::test]
    async fn inject_acquire_enforces_loop_cap() {
        let pool = PackPool::new(2, 2);

        let first = pool.acquire_inject(0).await.expect("loop count 1 is under the cap");
        assert_eq!(first.msg_loop_count, 1);
        assert_ne!(first.message.uuid, uuid::Uuid::nil());
        assert!(first.message.timestamp_ns > 0);

        let second = pool.acquire_inject(first.msg_loop_count).await.expect("at the cap");
        assert_eq!(second.msg_loop_count, 2);

        // Exceeding the cap yields nothing and leaks nothing.
        drop(first);
        drop(second);
        assert!(pool.acquire_inject(2).await.is_none());
        assert_eq!(pool.idle(), 2);
    }
}
