//! Reasoning Circuit Breaker
//!
//! Closed → Open after 5 failures in the last 20 outcomes; Open fails fast
//! for 30 s × 2^cycles (capped at 300 s); Half-Open admits exactly one probe.
//! Transitions are atomic behind a single mutex.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcomes tracked in the rolling window
pub const WINDOW: usize = 20;
/// Failures within the window that trip the breaker
pub const FAILURE_THRESHOLD: usize = 5;
/// First open duration
pub const BASE_OPEN: Duration = Duration::from_secs(30);
/// Open duration never exceeds this
pub const MAX_OPEN: Duration = Duration::from_secs(300);

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls allowed; outcomes tracked
    Closed,
    /// Calls fail fast until the timer expires
    Open,
    /// One probe allowed
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    window: VecDeque<bool>, // true = failure
    open_until: Instant,
    open_cycles: u32,
    probe_taken: bool,
}

/// Three-state circuit breaker guarding the reasoning service.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    base_open: Duration,
    max_open: Duration,
}

impl CircuitBreaker {
    /// Breaker with production timing.
    pub fn new() -> Self {
        Self::with_timing(BASE_OPEN, MAX_OPEN)
    }

    /// Breaker with explicit open durations (tests use short ones).
    pub fn with_timing(base_open: Duration, max_open: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(WINDOW),
                open_until: Instant::now(),
                open_cycles: 0,
                probe_taken: false,
            }),
            base_open,
            max_open,
        }
    }

    /// Whether a call may go out right now. Expiry of the open timer moves
    /// the breaker to Half-Open and grants the single probe to the caller.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if Instant::now() >= inner.open_until {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_taken = true;
                    tracing::info!("circuit breaker half-open, sending probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_taken {
                    false
                } else {
                    inner.probe_taken = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.open_cycles = 0;
                inner.probe_taken = false;
                tracing::info!("circuit breaker closed after successful probe");
            }
            BreakerState::Closed => push_outcome(&mut inner, false),
            BreakerState::Open => {}
        }
    }

    /// Record a failed call (429, 5xx, timeout, schema violation).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                self.trip(&mut inner);
            }
            BreakerState::Closed => {
                push_outcome(&mut inner, true);
                let failures = inner.window.iter().filter(|f| **f).count();
                if failures >= FAILURE_THRESHOLD {
                    self.trip(&mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state. Pure read; does not consume the half-open probe.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open if Instant::now() >= inner.open_until => BreakerState::HalfOpen,
            s => s,
        }
    }

    /// Whether calls are currently rejected.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == BreakerState::Open && Instant::now() < inner.open_until
            || (inner.state == BreakerState::HalfOpen && inner.probe_taken)
    }

    fn trip(&self, inner: &mut Inner) {
        let exp = inner.open_cycles.min(16);
        let duration = self
            .base_open
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_open)
            .min(self.max_open);
        inner.open_cycles += 1;
        inner.state = BreakerState::Open;
        inner.open_until = Instant::now() + duration;
        inner.probe_taken = false;
        inner.window.clear();
        tracing::warn!(
            cycles = inner.open_cycles,
            open_for_secs = duration.as_secs_f64(),
            "circuit breaker opened"
        );
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_outcome(inner: &mut Inner, failure: bool) {
    if inner.window.len() == WINDOW {
        inner.window.pop_front();
    }
    inner.window.push_back(failure);
}
