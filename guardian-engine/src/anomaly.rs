//! Anomaly Engine
//!
//! Incremental isolation-forest-style outlier detector over domain feature
//! vectors. Scores are signed, sklearn-style: lower = more anomalous.
//! Fits are serialized by the caller; scoring reads the most recently fit
//! model snapshot and never blocks a fit.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Feature vector: length, entropy, digit_ratio, vowel_ratio, tld_weight
pub type Sample = [f64; 5];

/// Samples required before the first fit
pub const MIN_SAMPLES: usize = 10;
/// Ring buffer capacity
pub const MAX_SAMPLES: usize = 10_000;
/// Scores below the threshold flag an anomaly
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = -0.1;
/// Adaptive threshold never leaves this range
pub const THRESHOLD_CLAMP: (f64, f64) = (-0.3, 0.0);

const TREES: usize = 64;
const SUBSAMPLE: usize = 256;
/// Refit at each doubling of the sample count up to here, then linearly
const DOUBLING_CAP: u64 = 8192;
const LATE_REFIT_EVERY: u64 = 1000;

const SCORE_WINDOW: usize = 1000;
const THRESHOLD_ADAPT_EVERY: usize = 100;
const THRESHOLD_PERCENTILE: f64 = 5.0;

enum Tree {
    Leaf { size: usize },
    Split { feature: usize, value: f64, left: Box<Tree>, right: Box<Tree> },
}

impl Tree {
    fn build(samples: &[Sample], depth: usize, limit: usize, rng: &mut StdRng) -> Tree {
        if depth >= limit || samples.len() <= 1 {
            return Tree::Leaf { size: samples.len() };
        }

        // features with any spread in this partition
        let mut splittable = [false; 5];
        let mut any = false;
        for feature in 0..5 {
            let min = samples.iter().map(|s| s[feature]).fold(f64::INFINITY, f64::min);
            let max = samples.iter().map(|s| s[feature]).fold(f64::NEG_INFINITY, f64::max);
            if max > min {
                splittable[feature] = true;
                any = true;
            }
        }
        if !any {
            return Tree::Leaf { size: samples.len() };
        }

        let feature = loop {
            let f = rng.gen_range(0..5);
            if splittable[f] {
                break f;
            }
        };
        let min = samples.iter().map(|s| s[feature]).fold(f64::INFINITY, f64::min);
        let max = samples.iter().map(|s| s[feature]).fold(f64::NEG_INFINITY, f64::max);
        let value = rng.gen_range(min..max);

        let mut left: Vec<Sample> = Vec::new();
        let mut right: Vec<Sample> = Vec::new();
        for s in samples.iter() {
            if s[feature] <= value {
                left.push(*s);
            } else {
                right.push(*s);
            }
        }

        Tree::Split {
            feature,
            value,
            left: Box::new(Tree::build(&left, depth + 1, limit, rng)),
            right: Box::new(Tree::build(&right, depth + 1, limit, rng)),
        }
    }

    fn path_length(&self, x: &Sample, depth: f64) -> f64 {
        match self {
            Tree::Leaf { size } => depth + average_path_length(*size),
            Tree::Split { feature, value, left, right } => {
                if x[*feature] <= *value {
                    left.path_length(x, depth + 1.0)
                } else {
                    right.path_length(x, depth + 1.0)
                }
            }
        }
    }
}

struct Forest {
    trees: Vec<Tree>,
    sample_size: usize,
}

impl Forest {
    fn fit(history: &[Sample], rng: &mut StdRng) -> Self {
        let sample_size = history.len().min(SUBSAMPLE);
        let limit = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let trees = (0..TREES)
            .map(|_| {
                let subsample: Vec<Sample> = (0..sample_size)
                    .map(|_| history[rng.gen_range(0..history.len())])
                    .collect();
                Tree::build(&subsample, 0, limit, rng)
            })
            .collect();

        Self { trees, sample_size }
    }

    /// Signed decision score: `0.5 - 2^(-E[h]/c)`. Negative = anomalous.
    fn score(&self, x: &Sample) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(x, 0.0)).sum();
        let mean = total / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size).max(1.0);
        0.5 - 2f64.powf(-mean / norm)
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            let harmonic = (n - 1.0).ln() + 0.577_215_664_9;
            2.0 * harmonic - 2.0 * (n - 1.0) / n
        }
    }
}

struct History {
    ring: VecDeque<Sample>,
    total_seen: u64,
    next_fit_at: u64,
    refits: u64,
    rng: StdRng,
}

struct ThresholdState {
    value: f64,
    recent: VecDeque<f64>,
    since_adapt: usize,
}

/// Point-in-time engine counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyStats {
    /// Samples currently retained
    pub samples: usize,
    /// Samples observed over the process lifetime
    pub total_seen: u64,
    /// Whether a model has been fit
    pub fitted: bool,
    /// Completed refits
    pub refits: u64,
    /// Current anomaly threshold
    pub threshold: f64,
}

/// Incremental outlier detector. `fit_incremental` appends and refits on a
/// geometric schedule; `score`/`is_anomaly` are defined after the first fit
/// and return `(0.0, false)` during cold start.
pub struct AnomalyEngine {
    history: Mutex<History>,
    model: ArcSwapOption<Forest>,
    threshold: Mutex<ThresholdState>,
}

impl AnomalyEngine {
    /// Empty engine; first fit happens after [`MIN_SAMPLES`] samples.
    pub fn new() -> Self {
        Self {
            history: Mutex::new(History {
                ring: VecDeque::with_capacity(MIN_SAMPLES * 2),
                total_seen: 0,
                next_fit_at: MIN_SAMPLES as u64,
                refits: 0,
                rng: StdRng::seed_from_u64(42),
            }),
            model: ArcSwapOption::empty(),
            threshold: Mutex::new(ThresholdState {
                value: DEFAULT_ANOMALY_THRESHOLD,
                recent: VecDeque::with_capacity(SCORE_WINDOW),
                since_adapt: 0,
            }),
        }
    }

    /// Append a sample; refit the model when the schedule says so.
    pub fn fit_incremental(&self, sample: Sample) {
        let mut h = self.history.lock();
        if h.ring.len() == MAX_SAMPLES {
            h.ring.pop_front();
        }
        h.ring.push_back(sample);
        h.total_seen += 1;

        if h.total_seen < h.next_fit_at {
            return;
        }

        let samples: Vec<Sample> = h.ring.iter().copied().collect();
        let forest = Forest::fit(&samples, &mut h.rng);
        self.model.store(Some(Arc::new(forest)));
        h.refits += 1;

        h.next_fit_at = if h.total_seen * 2 <= DOUBLING_CAP {
            h.total_seen * 2
        } else {
            h.total_seen + LATE_REFIT_EVERY
        };
        tracing::debug!(
            samples = samples.len(),
            refits = h.refits,
            next_fit_at = h.next_fit_at,
            "anomaly model refit"
        );
    }

    /// Signed score for a sample; 0.0 before the first fit.
    pub fn score(&self, sample: &Sample) -> f64 {
        match self.model.load_full() {
            Some(forest) => forest.score(sample),
            None => 0.0,
        }
    }

    /// Whether a sample scores below the current threshold.
    pub fn is_anomaly(&self, sample: &Sample) -> bool {
        match self.model.load_full() {
            Some(forest) => forest.score(sample) < self.threshold.lock().value,
            None => false,
        }
    }

    /// Score a sample, feed the adaptive threshold, and flag it.
    /// `(0.0, false)` during cold start.
    pub fn evaluate(&self, sample: &Sample) -> (f64, bool) {
        let forest = match self.model.load_full() {
            Some(f) => f,
            None => return (0.0, false),
        };
        let score = forest.score(sample);
        let threshold = self.record_score(score);
        (score, score < threshold)
    }

    /// Current anomaly threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold.lock().value
    }

    /// Counters for the stats surface.
    pub fn stats(&self) -> AnomalyStats {
        let h = self.history.lock();
        AnomalyStats {
            samples: h.ring.len(),
            total_seen: h.total_seen,
            fitted: self.model.load().is_some(),
            refits: h.refits,
            threshold: self.threshold.lock().value,
        }
    }

    fn record_score(&self, score: f64) -> f64 {
        let mut t = self.threshold.lock();
        if t.recent.len() == SCORE_WINDOW {
            t.recent.pop_front();
        }
        t.recent.push_back(score);
        t.since_adapt += 1;

        if t.since_adapt >= THRESHOLD_ADAPT_EVERY {
            t.since_adapt = 0;
            let mut sorted: Vec<f64> = t.recent.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            let index =
                ((sorted.len() as f64 * THRESHOLD_PERCENTILE / 100.0) as usize).min(sorted.len() - 1);
            t.value = sorted[index].clamp(THRESHOLD_CLAMP.0, THRESHOLD_CLAMP.1);
        }

        t.value
    }
}

impl Default for AnomalyEngine {
    fn default() -> Self {
        Self::new()
    }
}
