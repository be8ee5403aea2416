//! Deferred node teardown.
//!
//! Disconnecting a node while its tail is still audible clicks. Instruments
//! queue doomed nodes here with the render time they become silent, and the
//! engine drains the queue from its own tick loop once that time plus a
//! safety margin has passed.

use tracing::trace;

use crate::backend::{AudioBackend, NodeId};

/// Margin after the silent time before nodes are actually disconnected.
pub const DISPOSAL_DELAY: f64 = 0.1;

/// FIFO of (silent-at time, nodes) batches awaiting disconnection.
#[derive(Debug, Default)]
pub struct DisposalQueue {
    pending: Vec<(f64, Vec<NodeId>)>,
}

impl DisposalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `nodes` for disconnection once `silent_at + DISPOSAL_DELAY` has
    /// passed on the render clock.
    pub fn defer(&mut self, silent_at: f64, nodes: Vec<NodeId>) {
        if nodes.is_empty() {
            return;
        }
        self.pending.push((silent_at, nodes));
    }

    /// Disconnect every batch whose time has come. Called from the engine
    /// tick.
    pub fn process(&mut self, backend: &mut dyn AudioBackend, now: f64) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 + DISPOSAL_DELAY <= now {
                let (_, nodes) = self.pending.swap_remove(i);
                trace!(count = nodes.len(), now, "disposing nodes");
                for node in nodes {
                    backend.disconnect(node);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Number of batches still waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::OfflineBackend;

    #[test]
    fn test_nodes_survive_until_delay_passes() {
        let mut backend = OfflineBackend::new();
        let node = backend.create_gain(1.0);
        let dest = backend.destination();
        backend.connect(node, dest);

        let mut queue = DisposalQueue::new();
        queue.defer(1.0, vec![node]);

        queue.process(&mut backend, 1.05);
        assert_eq!(queue.len(), 1, "too early, batch still pending");
        assert!(backend.is_connected(node, dest));

        queue.process(&mut backend, 1.0 + DISPOSAL_DELAY);
        assert!(queue.is_empty());
        assert!(!backend.is_connected(node, dest));
    }

    #[test]
    fn test_batches_drain_independently() {
        let mut backend = OfflineBackend::new();
        let a = backend.create_gain(1.0);
        let b = backend.create_gain(1.0);

        let mut queue = DisposalQueue::new();
        queue.defer(0.0, vec![a]);
        queue.defer(5.0, vec![b]);

        queue.process(&mut backend, 1.0);
        assert_eq!(queue.len(), 1);
        queue.process(&mut backend, 10.0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_batch_ignored() {
        let mut queue = DisposalQueue::new();
        queue.defer(0.0, vec![]);
        assert!(queue.is_empty());
    }
}
