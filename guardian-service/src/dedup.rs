//! Deduplicator
//!
//! Keeps a domain from being analyzed twice at once. The admission gate is
//! the in-flight set here plus the live-cache check the orchestrator runs
//! first; once a verdict commits, re-analysis is suppressed by the cache
//! TTL. The recent window only records decided domains for the health and
//! stats surfaces; it takes no part in admission.

use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// In-flight tracking plus a bounded window of recently decided names.
pub struct Deduplicator {
    in_flight: DashSet<String>,
    window: Mutex<Window>,
}

struct Window {
    order: VecDeque<String>,
    capacity: usize,
}

impl Deduplicator {
    /// Deduplicator with the given recent-window capacity.
    pub fn new(window_capacity: usize) -> Self {
        Self {
            in_flight: DashSet::new(),
            window: Mutex::new(Window {
                order: VecDeque::with_capacity(window_capacity.min(1024)),
                capacity: window_capacity.max(1),
            }),
        }
    }

    /// Try to claim a domain for analysis. Returns `false` when it is
    /// already in flight.
    pub fn admit(&self, domain: &str) -> bool {
        self.in_flight.insert(domain.to_string())
    }

    /// Release a domain after its verdict committed and note it in the
    /// recent window (FIFO eviction at capacity).
    pub fn complete(&self, domain: &str) {
        self.in_flight.remove(domain);

        let mut w = self.window.lock();
        w.order.push_back(domain.to_string());
        if w.order.len() > w.capacity {
            w.order.pop_front();
        }
    }

    /// Whether the domain is currently being analyzed.
    pub fn is_in_flight(&self, domain: &str) -> bool {
        self.in_flight.contains(domain)
    }

    /// Domains currently in flight.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Recently decided domains on record.
    pub fn recent_len(&self) -> usize {
        self.window.lock().order.len()
    }
}
