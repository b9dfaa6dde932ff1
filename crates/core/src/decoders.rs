// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Decoder sets and their circulation pool.
//!
//! A [`DecoderSet`] is one complete collection of decoder instances, one per
//! registered decoder plugin, addressable by wire-encoding tag or by name.
//! Sets have independent per-decoder state (framing scratch, counters), so
//! `decoder_pool_size` of them circulate through a bounded channel: an input
//! leases one per message, uses it synchronously, and the lease returns it
//! on drop.

use crate::error::{PipelineError, Result};
use crate::message::Message;
use crate::plugin::Decoder;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One decoder instance plus its identity, as held inside a set.
pub struct DecoderRunner {
    name: Arc<str>,
    decoder: Box<dyn Decoder>,
}

impl DecoderRunner {
    pub fn new(name: Arc<str>, decoder: Box<dyn Decoder>) -> Self {
        Self { name, decoder }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decodes `raw` into `msg`, tagging failures with the decoder name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Flow`]; the caller releases the pack and
    /// continues.
    pub fn decode(&mut self, raw: &[u8], msg: &mut Message) -> Result<()> {
        self.decoder
            .decode(raw, msg)
            .map_err(|e| PipelineError::Flow(format!("decoder '{}': {e}", self.name)))
    }
}

impl std::fmt::Debug for DecoderRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRunner").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A leased collection of decoders indexed by encoding tag and by name.
#[derive(Debug)]
pub struct DecoderSet {
    runners: Vec<DecoderRunner>,
    by_tag: Vec<Option<usize>>,
    by_name: HashMap<String, usize>,
}

impl DecoderSet {
    /// Assembles a set from runners and the encoding-tag → decoder-name map.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when a binding names a decoder that
    /// is not part of the set.
    pub fn new(runners: Vec<DecoderRunner>, bindings: &HashMap<u8, String>) -> Result<Self> {
        let by_name: HashMap<String, usize> = runners
            .iter()
            .enumerate()
            .map(|(idx, runner)| (runner.name().to_string(), idx))
            .collect();

        let mut by_tag = vec![None; usize::from(u8::MAX) + 1];
        for (&tag, decoder_name) in bindings {
            let idx = by_name.get(decoder_name).copied().ok_or_else(|| {
                PipelineError::Config(format!(
                    "encoding tag {tag} bound to unknown decoder '{decoder_name}'"
                ))
            })?;
            by_tag[usize::from(tag)] = Some(idx);
        }

        Ok(Self { runners, by_tag, by_name })
    }

    /// The decoder registered for a wire-encoding tag.
    pub fn by_encoding(&mut self, tag: u8) -> Option<&mut DecoderRunner> {
        let idx = self.by_tag[usize::from(tag)]?;
        self.runners.get_mut(idx)
    }

    pub fn by_name(&mut self, name: &str) -> Option<&mut DecoderRunner> {
        let idx = *self.by_name.get(name)?;
        self.runners.get_mut(idx)
    }

    pub fn decoder_names(&self) -> impl Iterator<Item = &str> {
        self.runners.iter().map(DecoderRunner::name)
    }
}

/// Bounded pool of decoder sets. Lease by receive, return by send.
#[derive(Debug, Clone)]
pub struct DecoderSetPool {
    tx: mpsc::Sender<DecoderSet>,
    rx: Arc<Mutex<mpsc::Receiver<DecoderSet>>>,
}

impl DecoderSetPool {
    /// Creates a pool holding the given sets. The channel is sized exactly,
    /// so every set can always be returned.
    pub fn new(sets: Vec<DecoderSet>) -> Self {
        let capacity = sets.len().max(1);
        let (tx, rx) = mpsc::channel(capacity);
        for set in sets {
            assert!(tx.try_send(set).is_ok(), "decoder pool prefill overflow");
        }
        Self { tx, rx: Arc::new(Mutex::new(rx)) }
    }

    /// Leases a set, waiting until one is returned if all are in use.
    pub async fn lease(&self) -> DecoderSetLease {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(set) => DecoderSetLease { set: Some(set), tx: self.tx.clone() },
            // The pool itself holds a sender, so the channel cannot close.
            None => unreachable!("decoder pool channel closed"),
        }
    }
}

/// A leased decoder set; returns to the pool on drop.
#[derive(Debug)]
pub struct DecoderSetLease {
    set: Option<DecoderSet>,
    tx: mpsc::Sender<DecoderSet>,
}

impl Deref for DecoderSetLease {
    type Target = DecoderSet;

    fn deref(&self) -> &DecoderSet {
        match &self.set {
            Some(set) => set,
            None => unreachable!("decoder set lease accessed after drop"),
        }
    }
}

impl DerefMut for DecoderSetLease {
    fn deref_mut(&mut self) -> &mut DecoderSet {
        match &mut self.set {
            Some(set) => set,
            None => unreachable!("decoder set lease accessed after drop"),
        }
    }
}

impl Drop for DecoderSetLease {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            assert!(self.tx.try_send(set).is_ok(), "decoder pool overflow on return");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct TagDecoder(&'static str);

    impl Decoder for TagDecoder {
        fn decode(&mut self, _raw: &[u8], msg: &mut Message) -> Result<()> {
            msg.msg_type.push_str(self.0);
            Ok(())
        }
    }

    fn test_set() -> DecoderSet {
        let runners = vec![
            DecoderRunner::new(Arc::from("AlphaDecoder"), Box::new(TagDecoder("alpha"))),
            DecoderRunner::new(Arc::from("BetaDecoder"), Box::new(TagDecoder("beta"))),
        ];
        let mut bindings = HashMap::new();
        bindings.insert(0u8, "AlphaDecoder".to_string());
        bindings.insert(7u8, "BetaDecoder".to_string());
        DecoderSet::new(runners, &bindings).unwrap()
    }

    #[test]
    fn set_resolves_by_tag_and_name() {
        let mut set = test_set();
        let mut msg = Message::new();
        set.by_encoding(7).unwrap().decode(b"", &mut msg).unwrap();
        assert_eq!(msg.msg_type, "beta");
        assert!(set.by_encoding(1).is_none());
        assert!(set.by_name("AlphaDecoder").is_some());
        assert!(set.by_name("GammaDecoder").is_none());
        assert_eq!(set.decoder_names().collect::<Vec<_>>(), ["AlphaDecoder", "BetaDecoder"]);
    }

    #[test]
    fn unknown_binding_is_rejected() {
        let err = DecoderSet::new(Vec::new(), &HashMap::from([(0u8, "Ghost".to_string())]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn lease_circulates_through_pool() {
        let pool = DecoderSetPool::new(vec![test_set()]);

        let lease = pool.lease().await;
        // The single set is out; a second lease must wait.
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.lease().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(lease);
        let mut lease = waiter.await.expect("lease task panicked");
        assert!(lease.by_name("BetaDecoder").is_some());
    }
}
