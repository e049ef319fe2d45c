//! System Counters
//!
//! Decision tracking for the autonomy score plus drop counters surfaced on
//! `/api/stats/system`.

use guardian_engine::Source;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters. All methods are lock-free.
#[derive(Debug, Default)]
pub struct SystemStats {
    local_decisions: AtomicU64,
    cloud_decisions: AtomicU64,
    poll_dropped: AtomicU64,
    push_lagged: AtomicU64,
    anomaly_fit_dropped: AtomicU64,
    validation_rejected: AtomicU64,
}

/// Snapshot of the decision counters with the derived autonomy score.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionSnapshot {
    /// Verdicts decided without the reasoning service
    pub local_decisions: u64,
    /// Verdicts decided by the reasoning service
    pub cloud_decisions: u64,
    /// All committed verdicts
    pub total_decisions: u64,
    /// Percentage of decisions made locally, one decimal
    pub autonomy_score: f64,
}

/// Drop/overflow counters.
#[derive(Debug, Clone, Serialize)]
pub struct DropSnapshot {
    /// Upstream events skipped because the worker queue was full
    pub poll_dropped: u64,
    /// Push messages dropped for lagging subscribers
    pub push_lagged: u64,
    /// Anomaly samples dropped because the fit queue was full
    pub anomaly_fit_dropped: u64,
    /// Manual requests rejected by domain validation
    pub validation_rejected: u64,
}

impl SystemStats {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a committed verdict. Reasoning verdicts count as cloud
    /// decisions, everything else as local.
    pub fn record_decision(&self, source: Source) {
        if source == Source::Reasoning {
            self.cloud_decisions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.local_decisions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count an upstream event dropped under backpressure.
    pub fn record_poll_dropped(&self) {
        self.poll_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count push messages dropped for a lagging subscriber.
    pub fn record_push_lagged(&self, n: u64) {
        self.push_lagged.fetch_add(n, Ordering::Relaxed);
    }

    /// Count an anomaly sample dropped because the fit queue was full.
    pub fn record_anomaly_fit_dropped(&self) {
        self.anomaly_fit_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejected manual request.
    pub fn record_validation_rejected(&self) {
        self.validation_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Decision counters with the derived autonomy score.
    pub fn decisions(&self) -> DecisionSnapshot {
        let local = self.local_decisions.load(Ordering::Relaxed);
        let cloud = self.cloud_decisions.load(Ordering::Relaxed);
        let total = local + cloud;
        let autonomy_score = if total == 0 {
            0.0
        } else {
            (local as f64 / total as f64 * 1000.0).round() / 10.0
        };
        DecisionSnapshot {
            local_decisions: local,
            cloud_decisions: cloud,
            total_decisions: total,
            autonomy_score,
        }
    }

    /// Drop counters.
    pub fn drops(&self) -> DropSnapshot {
        DropSnapshot {
            poll_dropped: self.poll_dropped.load(Ordering::Relaxed),
            push_lagged: self.push_lagged.load(Ordering::Relaxed),
            anomaly_fit_dropped: self.anomaly_fit_dropped.load(Ordering::Relaxed),
            validation_rejected: self.validation_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autonomy_score() {
        let stats = SystemStats::new();
        assert_eq!(stats.decisions().autonomy_score, 0.0);

        stats.record_decision(Source::Heuristic);
        stats.record_decision(Source::Cache);
        stats.record_decision(Source::Metadata);
        stats.record_decision(Source::Reasoning);

        let snap = stats.decisions();
        assert_eq!(snap.local_decisions, 3);
        assert_eq!(snap.cloud_decisions, 1);
        assert_eq!(snap.total_decisions, 4);
        assert_eq!(snap.autonomy_score, 75.0);
    }

    #[test]
    fn test_fallback_counts_as_local() {
        let stats = SystemStats::new();
        stats.record_decision(Source::Fallback);
        assert_eq!(stats.decisions().local_decisions, 1);
    }

    #[test]
    fn test_drop_counters() {
        let stats = SystemStats::new();
        stats.record_poll_dropped();
        stats.record_push_lagged(3);
        stats.record_anomaly_fit_dropped();
        stats.record_anomaly_fit_dropped();

        let drops = stats.drops();
        assert_eq!(drops.poll_dropped, 1);
        assert_eq!(drops.push_lagged, 3);
        assert_eq!(drops.anomaly_fit_dropped, 2);
        assert_eq!(drops.validation_rejected, 0);
    }
}
