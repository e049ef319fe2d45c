//! Heuristic Engine
//!
//! Fast statistical verdicts over bare domain names, with an entropy
//! threshold that adapts to the network's observed traffic.

use crate::features::DomainFeatures;
use crate::verdict::{category, Risk};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Starting entropy threshold before any adaptation
pub const DEFAULT_ENTROPY_THRESHOLD: f64 = 3.8;
/// Adaptive threshold never leaves this range
pub const THRESHOLD_CLAMP: (f64, f64) = (3.0, 4.5);
/// Digit-ratio cutoff for the DGA rule
pub const DGA_DIGIT_RATIO: f64 = 0.3;

/// Re-derive the threshold after this many analyzed domains
const ADAPT_EVERY: usize = 500;
/// Entropy observations kept for the percentile calculation
const HISTORY_WINDOW: usize = 1000;
/// Percentile the threshold tracks
const PERCENTILE: f64 = 90.0;

/// Conclusive heuristic result.
#[derive(Debug, Clone)]
pub struct HeuristicFinding {
    /// Assessed risk
    pub risk: Risk,
    /// Category label
    pub category: String,
    /// One-line explanation
    pub summary: String,
}

struct ThresholdState {
    threshold: f64,
    history: VecDeque<f64>,
    since_adapt: usize,
}

/// Entropy / digit-ratio classifier with a self-calibrating threshold.
pub struct HeuristicEngine {
    state: Mutex<ThresholdState>,
}

impl HeuristicEngine {
    /// Engine with the default starting threshold.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_ENTROPY_THRESHOLD)
    }

    /// Engine with an explicit starting threshold.
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            state: Mutex::new(ThresholdState {
                threshold,
                history: VecDeque::with_capacity(HISTORY_WINDOW),
                since_adapt: 0,
            }),
        }
    }

    /// Current entropy threshold.
    pub fn threshold(&self) -> f64 {
        self.state.lock().threshold
    }

    /// Number of entropy observations recorded so far (bounded window).
    pub fn observations(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Record the observed entropy and evaluate the verdict rule.
    /// Returns `None` when inconclusive.
    pub fn evaluate(&self, features: &DomainFeatures) -> Option<HeuristicFinding> {
        let threshold = self.record(features.entropy);

        if features.entropy < threshold {
            return None;
        }

        if features.digit_ratio >= DGA_DIGIT_RATIO {
            return Some(HeuristicFinding {
                risk: Risk::High,
                category: category::MALWARE.into(),
                summary: format!(
                    "DGA-like name: entropy {:.2} >= {:.2}, digit ratio {:.2}",
                    features.entropy, threshold, features.digit_ratio
                ),
            });
        }

        Some(HeuristicFinding {
            risk: Risk::Medium,
            category: category::UNKNOWN.into(),
            summary: format!(
                "High-entropy name: {:.2} >= {:.2}",
                features.entropy, threshold
            ),
        })
    }

    fn record(&self, entropy: f64) -> f64 {
        let mut state = self.state.lock();
        if state.history.len() == HISTORY_WINDOW {
            state.history.pop_front();
        }
        state.history.push_back(entropy);
        state.since_adapt += 1;

        if state.since_adapt >= ADAPT_EVERY {
            state.since_adapt = 0;
            let mut sorted: Vec<f64> = state.history.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            let p90 = percentile(&sorted, PERCENTILE);
            let old = state.threshold;
            state.threshold = p90.clamp(THRESHOLD_CLAMP.0, THRESHOLD_CLAMP.1);
            if (state.threshold - old).abs() > f64::EPSILON {
                tracing::info!(
                    old = old,
                    new = state.threshold,
                    samples = sorted.len(),
                    "entropy threshold adapted"
                );
            }
        }

        state.threshold
    }
}

impl Default for HeuristicEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile over a pre-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * p / 100.0) as usize).min(sorted.len() - 1);
    sorted[index]
}
