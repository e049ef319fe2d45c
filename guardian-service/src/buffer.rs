//! Verdict Buffer & Push Fanout
//!
//! Bounded ring of recently committed verdicts (commit order preserved,
//! oldest evicted) plus a broadcast channel feeding the push endpoint.
//! Each subscriber gets a bounded queue; a lagging subscriber loses the
//! oldest messages with a counter increment and the publisher never blocks.

use guardian_engine::Verdict;
use parking_lot::RwLock;
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Committed verdicts retained for `/history`
pub const BUFFER_CAPACITY: usize = 200;
/// Per-subscriber push queue depth
pub const SUBSCRIBER_QUEUE: usize = 32;

/// Ring buffer of committed verdicts with push fanout.
pub struct VerdictBuffer {
    ring: RwLock<VecDeque<Verdict>>,
    manual: RwLock<VecDeque<Verdict>>,
    tx: broadcast::Sender<Verdict>,
    capacity: usize,
}

impl VerdictBuffer {
    /// Buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }

    /// Buffer with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity.min(BUFFER_CAPACITY))),
            manual: RwLock::new(VecDeque::with_capacity(64)),
            tx,
            capacity: capacity.max(1),
        }
    }

    /// Record a committed verdict and push it to subscribers. `manual`
    /// additionally records it in the manual-session ring.
    pub fn commit(&self, verdict: &Verdict, manual: bool) {
        {
            let mut ring = self.ring.write();
            ring.push_back(verdict.clone());
            if ring.len() > self.capacity {
                ring.pop_front();
            }
        }
        if manual {
            let mut ring = self.manual.write();
            ring.push_back(verdict.clone());
            if ring.len() > self.capacity {
                ring.pop_front();
            }
        }
        // no receivers is fine
        let _ = self.tx.send(verdict.clone());
    }

    /// Most recent verdicts, newest first, up to `limit`.
    pub fn recent(&self, limit: usize) -> Vec<Verdict> {
        self.ring.read().iter().rev().take(limit).cloned().collect()
    }

    /// Most recent manual-session verdicts, newest first, up to `limit`.
    pub fn manual_recent(&self, limit: usize) -> Vec<Verdict> {
        self.manual.read().iter().rev().take(limit).cloned().collect()
    }

    /// Verdicts currently retained.
    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    /// Whether no verdict has committed yet.
    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    /// Subscribe to the push channel. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Verdict> {
        self.tx.subscribe()
    }

    /// Connected push subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for VerdictBuffer {
    fn default() -> Self {
        Self::new()
    }
}
