//! Upstream Log Poller
//!
//! Pulls recent query-log entries from the DNS filter on a fixed interval.
//! Tries a prioritized candidate URL list and remembers the last one that
//! worked. Failures are logged and absorbed; an empty tick is a valid
//! outcome and the pipeline is never blocked.

use crate::orchestrator::{AnalysisJob, JobQueues};
use crate::stats::SystemStats;
use chrono::{DateTime, Utc};
use guardian_engine::{validate, UpstreamEvent};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll failure for one candidate URL.
#[derive(Debug, Error)]
pub enum PollError {
    /// Connection-level failure
    #[error("transport error: {0}")]
    Transport(String),
    /// Credentials rejected
    #[error("authentication failed")]
    Auth,
    /// Non-success HTTP status
    #[error("http status {0}")]
    Status(u16),
    /// Body was not the expected JSON shape
    #[error("malformed payload: {0}")]
    Payload(String),
}

#[derive(Debug, Deserialize)]
struct QueryLogPage {
    #[serde(default)]
    data: Vec<QueryLogEntry>,
}

#[derive(Debug, Deserialize)]
struct QueryLogEntry {
    question: Option<Question>,
    time: Option<DateTime<Utc>>,
    reason: Option<String>,
    rule: Option<String>,
    filter_id: Option<i64>,
    client: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Question {
    name: Option<String>,
}

/// Query-log poller with URL failover and a monotonic high-water mark.
pub struct Poller {
    client: reqwest::Client,
    candidates: Vec<String>,
    user: String,
    pass: String,
    batch_limit: usize,
    last_good: AtomicUsize,
    high_water: Mutex<Option<DateTime<Utc>>>,
}

impl Poller {
    /// Poller over a prioritized candidate list.
    pub fn new(candidates: Vec<String>, user: String, pass: String, batch_limit: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            candidates,
            user,
            pass,
            batch_limit,
            last_good: AtomicUsize::new(0),
            high_water: Mutex::new(None),
        }
    }

    /// One polling pass: first candidate URL that answers wins. Returns the
    /// new events past the high-water mark; empty on total failure.
    pub async fn poll_once(&self) -> Vec<UpstreamEvent> {
        let start = self.last_good.load(Ordering::Relaxed);
        for offset in 0..self.candidates.len() {
            let index = (start + offset) % self.candidates.len();
            let base = &self.candidates[index];
            match self.fetch(base).await {
                Ok(page) => {
                    self.last_good.store(index, Ordering::Relaxed);
                    return self.convert(page);
                }
                Err(PollError::Auth) => {
                    tracing::error!(url = %base, "upstream rejected credentials; check configuration");
                }
                Err(e) => {
                    tracing::warn!(url = %base, error = %e, "query log fetch failed, trying next candidate");
                }
            }
        }
        Vec::new()
    }

    async fn fetch(&self, base: &str) -> Result<QueryLogPage, PollError> {
        let url = format!(
            "{}/control/querylog?limit={}",
            base.trim_end_matches('/'),
            self.batch_limit
        );

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.pass))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(PollError::Auth);
        }
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| PollError::Payload(e.to_string()))
    }

    /// Convert a page into events, dropping reserved names and anything at
    /// or below the high-water mark, then advance the mark.
    fn convert(&self, page: QueryLogPage) -> Vec<UpstreamEvent> {
        let mut mark = self.high_water.lock();
        let floor = *mark;
        let mut newest = floor;
        let mut events = Vec::new();

        for entry in page.data {
            let name = match entry.question.and_then(|q| q.name) {
                Some(n) if !n.is_empty() => n,
                _ => continue,
            };
            if validate::is_reserved(&name) {
                continue;
            }
            let answered_at = entry.time.unwrap_or_else(Utc::now);
            if let Some(floor) = floor {
                if answered_at <= floor {
                    continue;
                }
            }
            if newest.map(|n| answered_at > n).unwrap_or(true) {
                newest = Some(answered_at);
            }
            events.push(UpstreamEvent {
                domain: name,
                answered_at,
                filter_reason: entry.reason.unwrap_or_else(|| "Unknown".into()),
                filter_rule: entry.rule,
                filter_id: entry.filter_id,
                client: entry.client,
            });
        }

        *mark = newest;
        events
    }

    /// Current high-water mark.
    pub fn high_water(&self) -> Option<DateTime<Utc>> {
        *self.high_water.lock()
    }

    /// Poll loop: one logical ticker; a tick that overruns the interval is
    /// skipped, never stacked. Saturated worker queues drop events with a
    /// counter rather than blocking the poller.
    pub async fn run(self: Arc<Self>, interval: Duration, queues: JobQueues, stats: Arc<SystemStats>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "upstream poller started");

        loop {
            ticker.tick().await;
            let events = self.poll_once().await;
            if events.is_empty() {
                continue;
            }
            tracing::debug!(count = events.len(), "upstream events fetched");
            for event in events {
                if queues.polled_tx.try_send(AnalysisJob::polled(event)).is_err() {
                    stats.record_poll_dropped();
                    tracing::warn!("poll_dropped: worker queue saturated");
                }
            }
        }
    }
}
