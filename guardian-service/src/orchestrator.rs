//! Analysis Orchestrator
//!
//! Runs each admitted domain through the tier sequence (cache → metadata →
//! heuristic → anomaly → reasoning) and commits exactly one verdict, or
//! rejects the input with a validation error. Degrades to a fallback
//! verdict whenever the reasoning tier is unreachable; the pipeline never
//! stalls on it.

use crate::breaker::CircuitBreaker;
use crate::buffer::VerdictBuffer;
use crate::cache::VerdictCache;
use crate::dedup::Deduplicator;
use crate::ledger::LedgerSink;
use crate::reasoning::{FeatureBundle, ReasoningClient, ReasoningError};
use crate::stats::SystemStats;
use chrono::Utc;
use guardian_engine::verdict::category;
use guardian_engine::{
    validate, AnomalyEngine, DomainFeatures, HeuristicEngine, MetaOutcome, MetadataClassifier,
    Risk, Sample, SignatureKey, SignatureStore, Source, UpstreamEvent, ValidateError, Verdict,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Wall-clock budget for one domain's local tiers
pub const DOMAIN_BUDGET: Duration = Duration::from_secs(5);
/// Deadline granted to the reasoning call when budget remains
pub const REASONING_BUDGET: Duration = Duration::from_secs(10);
/// Manual jobs served per polled job under contention
pub const FAIRNESS_RATIO: u32 = 4;

const MANUAL_QUEUE: usize = 64;
const POLLED_QUEUE: usize = 256;
const FIT_QUEUE: usize = 1024;

/// Request priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Ad-hoc request from the manual endpoint
    Manual,
    /// Event from the upstream poller
    Polled,
}

/// One unit of analysis work.
pub struct AnalysisJob {
    /// Raw domain as submitted
    pub domain: String,
    /// Upstream log entry, when the poller produced the job
    pub upstream: Option<UpstreamEvent>,
    /// Manual caller's free text, used for the JIT-context check
    pub request_text: Option<String>,
    /// Reply channel for synchronous callers
    pub reply: Option<oneshot::Sender<Result<Verdict, ValidateError>>>,
    /// Priority class
    pub priority: Priority,
}

impl AnalysisJob {
    /// Job for a manual request.
    pub fn manual(
        domain: String,
        request_text: Option<String>,
        reply: oneshot::Sender<Result<Verdict, ValidateError>>,
    ) -> Self {
        Self {
            domain,
            upstream: None,
            request_text,
            reply: Some(reply),
            priority: Priority::Manual,
        }
    }

    /// Job for a polled upstream event.
    pub fn polled(event: UpstreamEvent) -> Self {
        Self {
            domain: event.domain.clone(),
            upstream: Some(event),
            request_text: None,
            reply: None,
            priority: Priority::Polled,
        }
    }
}

/// Best lower-tier result carried toward a fallback commit.
#[derive(Debug, Clone)]
struct TierFinding {
    risk: Risk,
    category: String,
    summary: String,
}

fn merge_best(best: &mut Option<TierFinding>, candidate: TierFinding) {
    match best {
        Some(current) if current.risk >= candidate.risk => {}
        _ => *best = Some(candidate),
    }
}

/// Serializes anomaly-model fits behind a dedicated task; scoring reads the
/// latest snapshot without waiting on this queue.
pub struct AnomalyUpdater {
    rx: mpsc::Receiver<Sample>,
    engine: Arc<AnomalyEngine>,
}

impl AnomalyUpdater {
    /// Drain fit requests until the orchestrator is dropped.
    pub async fn run(mut self) {
        while let Some(sample) = self.rx.recv().await {
            self.engine.fit_incremental(sample);
        }
    }
}

/// The tier state machine plus everything a commit touches.
pub struct Orchestrator {
    /// Two-tier verdict cache
    pub cache: Arc<VerdictCache>,
    /// In-flight tracking
    pub dedup: Arc<Deduplicator>,
    /// Learned signature store (written by the pattern-learner path)
    pub signatures: Arc<SignatureStore>,
    /// Metadata tier
    pub classifier: MetadataClassifier,
    /// Heuristic tier
    pub heuristics: Arc<HeuristicEngine>,
    /// Anomaly tier
    pub anomaly: Arc<AnomalyEngine>,
    /// Reasoning tier, absent when not configured
    pub reasoning: Option<Arc<ReasoningClient>>,
    /// Breaker guarding the reasoning tier
    pub breaker: Arc<CircuitBreaker>,
    /// Verdict ring + push fanout
    pub buffer: Arc<VerdictBuffer>,
    /// External ledger, absent when not configured
    pub ledger: Option<Arc<LedgerSink>>,
    /// Decision counters
    pub stats: Arc<SystemStats>,
    fit_tx: mpsc::Sender<Sample>,
}

impl Orchestrator {
    /// Wire the orchestrator. The returned updater must be spawned; it owns
    /// all anomaly-model fits.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<VerdictCache>,
        dedup: Arc<Deduplicator>,
        signatures: Arc<SignatureStore>,
        heuristics: Arc<HeuristicEngine>,
        anomaly: Arc<AnomalyEngine>,
        reasoning: Option<Arc<ReasoningClient>>,
        breaker: Arc<CircuitBreaker>,
        buffer: Arc<VerdictBuffer>,
        ledger: Option<Arc<LedgerSink>>,
        stats: Arc<SystemStats>,
    ) -> (Arc<Self>, AnomalyUpdater) {
        let (fit_tx, fit_rx) = mpsc::channel(FIT_QUEUE);
        let updater = AnomalyUpdater {
            rx: fit_rx,
            engine: anomaly.clone(),
        };
        let orchestrator = Arc::new(Self {
            cache,
            dedup,
            classifier: MetadataClassifier::new(signatures.clone()),
            signatures,
            heuristics,
            anomaly,
            reasoning,
            breaker,
            buffer,
            ledger,
            stats,
            fit_tx,
        });
        (orchestrator, updater)
    }

    /// Process one job, answering the reply channel when present.
    pub async fn process(&self, job: AnalysisJob) {
        let AnalysisJob {
            domain,
            upstream,
            request_text,
            reply,
            priority,
        } = job;

        let result = self
            .analyze(&domain, upstream, request_text.as_deref(), priority)
            .await;

        if let Some(reply) = reply {
            let answer = match result {
                Ok(Some(verdict)) => Ok(verdict),
                Ok(None) => Ok(stub_verdict(&domain, "request dropped under load")),
                Err(e) => Err(e),
            };
            let _ = reply.send(answer);
        }
    }

    /// Run the tier state machine for one domain.
    ///
    /// `Ok(None)` means a polled duplicate was dropped silently. Manual
    /// callers always get `Ok(Some(_))` or a validation error.
    pub async fn analyze(
        &self,
        raw_domain: &str,
        upstream: Option<UpstreamEvent>,
        request_text: Option<&str>,
        priority: Priority,
    ) -> Result<Option<Verdict>, ValidateError> {
        let domain = match validate::normalize(raw_domain) {
            Ok(d) => d,
            Err(e) => {
                self.stats.record_validation_rejected();
                return Err(e);
            }
        };
        let manual = priority == Priority::Manual;

        if let Some(cached) = self.cache.lookup(&domain) {
            let verdict = Verdict {
                source: Source::Cache,
                decided_at: Utc::now(),
                ..cached
            };
            self.commit(&verdict, manual, None, true).await;
            return Ok(Some(verdict));
        }

        if !self.dedup.admit(&domain) {
            if manual {
                return Ok(Some(stub_verdict(&domain, "analysis already in flight")));
            }
            return Ok(None);
        }

        let started = Instant::now();
        let (verdict, learn_confidence) = self
            .run_tiers(&domain, upstream, request_text, started)
            .await;
        self.commit(&verdict, manual, learn_confidence, false).await;
        Ok(Some(verdict))
    }

    async fn run_tiers(
        &self,
        domain: &str,
        upstream: Option<UpstreamEvent>,
        request_text: Option<&str>,
        started: Instant,
    ) -> (Verdict, Option<f64>) {
        let features = DomainFeatures::from_domain(domain);
        let sample = features.to_vector();
        let mut best: Option<TierFinding> = None;
        let mut privacy_escalation = false;

        // ── Metadata tier ───────────────────────────────────────────────
        match self.classifier.classify(domain, upstream.as_ref()) {
            MetaOutcome::Conclusive(finding) => {
                if finding.escalate {
                    privacy_escalation = true;
                    merge_best(
                        &mut best,
                        TierFinding {
                            risk: finding.risk,
                            category: finding.category,
                            summary: finding.summary,
                        },
                    );
                } else {
                    let verdict = self.make_verdict(
                        domain,
                        &upstream,
                        Source::Metadata,
                        finding.risk,
                        finding.category,
                        finding.summary,
                        features.entropy,
                        0.0,
                        false,
                    );
                    return (verdict, Some(finding.confidence));
                }
            }
            MetaOutcome::Inconclusive => {}
        }

        // ── Heuristic tier ──────────────────────────────────────────────
        let heuristic = self.heuristics.evaluate(&features);

        // ── Anomaly tier ────────────────────────────────────────────────
        // fits go through the updater task; scoring reads the snapshot
        if self.fit_tx.try_send(sample).is_err() {
            self.stats.record_anomaly_fit_dropped();
            tracing::warn!(domain, "anomaly fit queue saturated, sample dropped");
        }
        let (anomaly_score, is_anomaly) = self.anomaly.evaluate(&sample);

        if let Some(h) = &heuristic {
            if !privacy_escalation && !is_anomaly {
                let verdict = self.make_verdict(
                    domain,
                    &upstream,
                    Source::Heuristic,
                    h.risk,
                    h.category.clone(),
                    h.summary.clone(),
                    features.entropy,
                    anomaly_score,
                    false,
                );
                return (verdict, None);
            }
            merge_best(
                &mut best,
                TierFinding {
                    risk: h.risk,
                    category: h.category.clone(),
                    summary: h.summary.clone(),
                },
            );
        }

        if is_anomaly {
            merge_best(
                &mut best,
                TierFinding {
                    risk: Risk::High,
                    category: category::ZERO_DAY.into(),
                    summary: format!("Outlier feature vector (score {anomaly_score:.3})"),
                },
            );
        }

        // ── Reasoning tier ──────────────────────────────────────────────
        let remaining = DOMAIN_BUDGET.checked_sub(started.elapsed());
        let mut degraded_note = "reasoning unavailable";

        if remaining.is_none() {
            degraded_note = "analysis budget exhausted";
        } else if let Some(client) = &self.reasoning {
            let bundle = FeatureBundle {
                entropy: features.entropy,
                digit_ratio: features.digit_ratio,
                anomaly_score,
                upstream_reason: upstream.as_ref().map(|e| e.filter_reason.clone()),
                upstream_rule: upstream.as_ref().and_then(|e| e.filter_rule.clone()),
            };
            match tokio::time::timeout(
                REASONING_BUDGET,
                client.analyze(domain, &bundle, request_text),
            )
            .await
            {
                Ok(Ok(rv)) => {
                    let verdict = self.make_verdict(
                        domain,
                        &upstream,
                        Source::Reasoning,
                        rv.risk,
                        rv.category,
                        rv.summary,
                        features.entropy,
                        anomaly_score,
                        is_anomaly,
                    );
                    return (verdict, Some(0.9));
                }
                Ok(Err(ReasoningError::Open)) | Ok(Err(ReasoningError::Disabled)) => {
                    degraded_note = "reasoning circuit open";
                }
                Ok(Err(e)) => {
                    tracing::warn!(domain, error = %e, "reasoning call failed, committing fallback");
                    let verdict = self.fallback_verdict(
                        domain,
                        &upstream,
                        best,
                        &features,
                        anomaly_score,
                        is_anomaly,
                        "reasoning call failed",
                    );
                    return (verdict, None);
                }
                Err(_) => {
                    self.breaker.record_failure();
                    let verdict = self.fallback_verdict(
                        domain,
                        &upstream,
                        best,
                        &features,
                        anomaly_score,
                        is_anomaly,
                        "reasoning deadline exceeded",
                    );
                    return (verdict, None);
                }
            }
        }

        // ── Reasoning unavailable ───────────────────────────────────────
        if is_anomaly && heuristic.is_none() && !privacy_escalation {
            let verdict = self.make_verdict(
                domain,
                &upstream,
                Source::Anomaly,
                Risk::High,
                category::ZERO_DAY.into(),
                format!(
                    "Outlier feature vector (score {anomaly_score:.3}); {degraded_note} (degraded mode)"
                ),
                features.entropy,
                anomaly_score,
                true,
            );
            return (verdict, None);
        }

        if let Some(h) = heuristic {
            if !privacy_escalation {
                let verdict = self.make_verdict(
                    domain,
                    &upstream,
                    Source::Heuristic,
                    h.risk,
                    h.category,
                    format!("{}; {degraded_note} (degraded mode)", h.summary),
                    features.entropy,
                    anomaly_score,
                    is_anomaly,
                );
                return (verdict, None);
            }
        }

        let verdict = self.fallback_verdict(
            domain,
            &upstream,
            best,
            &features,
            anomaly_score,
            is_anomaly,
            degraded_note,
        );
        (verdict, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn make_verdict(
        &self,
        domain: &str,
        upstream: &Option<UpstreamEvent>,
        source: Source,
        risk: Risk,
        category: String,
        summary: String,
        entropy: f64,
        anomaly_score: f64,
        is_anomaly: bool,
    ) -> Verdict {
        Verdict {
            domain: domain.to_string(),
            risk,
            category,
            summary,
            is_anomaly,
            anomaly_score,
            entropy,
            source,
            upstream: upstream.clone(),
            decided_at: Utc::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fallback_verdict(
        &self,
        domain: &str,
        upstream: &Option<UpstreamEvent>,
        best: Option<TierFinding>,
        features: &DomainFeatures,
        anomaly_score: f64,
        is_anomaly: bool,
        note: &str,
    ) -> Verdict {
        let (risk, category, summary) = match best {
            Some(f) => (
                f.risk,
                f.category,
                format!("{}; {note} (degraded mode)", f.summary),
            ),
            None => (
                Risk::Low,
                category::UNKNOWN.to_string(),
                format!("No conclusive local signal; {note} (degraded mode)"),
            ),
        };
        self.make_verdict(
            domain,
            upstream,
            Source::Fallback,
            risk,
            category,
            summary,
            features.entropy,
            anomaly_score,
            is_anomaly,
        )
    }

    /// Commit effects: cache store, buffer append, push, ledger write,
    /// pattern learning, in-flight release, decision counters.
    async fn commit(
        &self,
        verdict: &Verdict,
        manual: bool,
        learn_confidence: Option<f64>,
        from_cache: bool,
    ) {
        if !from_cache {
            self.cache.store(verdict.clone());
        }

        self.buffer.commit(verdict, manual);

        if let Some(ledger) = &self.ledger {
            let ledger = ledger.clone();
            let v = verdict.clone();
            tokio::spawn(async move {
                ledger.append(&v).await;
            });
        }

        if let Some(confidence) = learn_confidence {
            let eligible = verdict.source == Source::Reasoning
                || (verdict.source == Source::Metadata && confidence >= 0.9);
            if eligible {
                if let Some(event) = &verdict.upstream {
                    self.signatures.observe(
                        SignatureKey::from_event(event),
                        &verdict.category,
                        verdict.risk,
                        confidence,
                    );
                }
            }
        }

        if !from_cache {
            self.dedup.complete(&verdict.domain);
        }
        self.stats.record_decision(verdict.source);
        tracing::info!(
            domain = %verdict.domain,
            risk = %verdict.risk,
            category = %verdict.category,
            source = %verdict.source,
            "verdict committed"
        );
    }
}

/// Degraded answer for a manual request that could not enter the pipeline.
fn stub_verdict(domain: &str, note: &str) -> Verdict {
    Verdict {
        domain: domain.to_string(),
        risk: Risk::Unknown,
        category: category::UNKNOWN.into(),
        summary: format!("{note} (degraded mode)"),
        is_anomaly: false,
        anomaly_score: 0.0,
        entropy: 0.0,
        source: Source::Fallback,
        upstream: None,
        decided_at: Utc::now(),
    }
}

/// Handles to the worker pool's two priority queues.
#[derive(Clone)]
pub struct JobQueues {
    /// Manual request queue (drained first, 4:1)
    pub manual_tx: mpsc::Sender<AnalysisJob>,
    /// Polled event queue
    pub polled_tx: mpsc::Sender<AnalysisJob>,
}

/// Spawn the dispatcher and worker tasks, returning the queue handles.
pub fn spawn_workers(orchestrator: Arc<Orchestrator>, workers: usize) -> JobQueues {
    let (manual_tx, manual_rx) = mpsc::channel(MANUAL_QUEUE);
    let (polled_tx, polled_rx) = mpsc::channel(POLLED_QUEUE);
    let (work_tx, work_rx) = mpsc::channel(workers.max(1));

    tokio::spawn(dispatch(manual_rx, polled_rx, work_tx));

    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    for id in 0..workers.max(1) {
        let orchestrator = orchestrator.clone();
        let work_rx = work_rx.clone();
        tokio::spawn(async move {
            loop {
                let job = { work_rx.lock().await.recv().await };
                match job {
                    Some(job) => orchestrator.process(job).await,
                    None => break,
                }
            }
            tracing::debug!(worker = id, "analysis worker stopped");
        });
    }

    JobQueues {
        manual_tx,
        polled_tx,
    }
}

/// Merge the two queues into the worker feed, manual first at [`FAIRNESS_RATIO`]:1.
async fn dispatch(
    mut manual_rx: mpsc::Receiver<AnalysisJob>,
    mut polled_rx: mpsc::Receiver<AnalysisJob>,
    work_tx: mpsc::Sender<AnalysisJob>,
) {
    use tokio::sync::mpsc::error::TryRecvError;

    let mut manual_streak = 0u32;
    loop {
        let mut next = None;

        if manual_streak < FAIRNESS_RATIO {
            match manual_rx.try_recv() {
                Ok(job) => {
                    manual_streak += 1;
                    next = Some(job);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }
        }

        let job = match next {
            Some(job) => job,
            None => match polled_rx.try_recv() {
                Ok(job) => {
                    manual_streak = 0;
                    job
                }
                Err(TryRecvError::Empty) => {
                    manual_streak = 0;
                    tokio::select! {
                        biased;
                        m = manual_rx.recv() => match m {
                            Some(job) => { manual_streak = 1; job }
                            None => return,
                        },
                        p = polled_rx.recv() => match p {
                            Some(job) => job,
                            None => return,
                        },
                    }
                }
                Err(TryRecvError::Disconnected) => match manual_rx.recv().await {
                    Some(job) => job,
                    None => return,
                },
            },
        };

        if work_tx.send(job).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_best_keeps_highest_risk() {
        let mut best = None;
        merge_best(
            &mut best,
            TierFinding {
                risk: Risk::Medium,
                category: "Tracker".into(),
                summary: "a".into(),
            },
        );
        merge_best(
            &mut best,
            TierFinding {
                risk: Risk::High,
                category: "Malware".into(),
                summary: "b".into(),
            },
        );
        merge_best(
            &mut best,
            TierFinding {
                risk: Risk::Low,
                category: "System".into(),
                summary: "c".into(),
            },
        );
        let best = best.unwrap();
        assert_eq!(best.risk, Risk::High);
        assert_eq!(best.category, "Malware");
    }

    #[test]
    fn test_merge_best_ties_keep_earlier_tier() {
        let mut best = None;
        merge_best(
            &mut best,
            TierFinding {
                risk: Risk::High,
                category: "Privacy".into(),
                summary: "first".into(),
            },
        );
        merge_best(
            &mut best,
            TierFinding {
                risk: Risk::High,
                category: "Zero-Day Suspect".into(),
                summary: "second".into(),
            },
        );
        assert_eq!(best.unwrap().category, "Privacy");
    }

    #[test]
    fn test_stub_verdict_is_degraded_fallback() {
        let v = stub_verdict("busy.example", "analysis already in flight");
        assert_eq!(v.source, Source::Fallback);
        assert_eq!(v.risk, Risk::Unknown);
        assert!(v.summary.contains("degraded"));
    }
}
