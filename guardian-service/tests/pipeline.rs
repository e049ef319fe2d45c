//! End-to-end pipeline scenarios against the orchestrator.

use chrono::Utc;
use guardian_engine::verdict::category;
use guardian_engine::{
    AnomalyEngine, HeuristicEngine, Risk, SignatureStore, Source, UpstreamEvent, Verdict,
};
use guardian_service::breaker::CircuitBreaker;
use guardian_service::buffer::VerdictBuffer;
use guardian_service::cache::VerdictCache;
use guardian_service::dedup::Deduplicator;
use guardian_service::orchestrator::{AnomalyUpdater, Orchestrator, Priority};
use guardian_service::reasoning::ReasoningClient;
use guardian_service::stats::SystemStats;
use std::sync::Arc;

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    // kept alive so the fit queue stays open
    _updater: AnomalyUpdater,
}

fn fixture(with_reasoning: bool) -> Fixture {
    let breaker = Arc::new(CircuitBreaker::new());
    let reasoning = if with_reasoning {
        // unroutable: any attempted call fails at the transport layer
        Some(Arc::new(ReasoningClient::new(
            "http://127.0.0.1:9/analyze".into(),
            "test-key".into(),
            breaker.clone(),
        )))
    } else {
        None
    };

    let (orchestrator, updater) = Orchestrator::new(
        Arc::new(VerdictCache::new(1000)),
        Arc::new(Deduplicator::new(1000)),
        Arc::new(SignatureStore::new()),
        Arc::new(HeuristicEngine::new()),
        Arc::new(AnomalyEngine::new()),
        reasoning,
        breaker,
        Arc::new(VerdictBuffer::new()),
        None,
        Arc::new(SystemStats::new()),
    );

    Fixture {
        orchestrator,
        _updater: updater,
    }
}

fn seeded_verdict(domain: &str) -> Verdict {
    Verdict {
        domain: domain.into(),
        risk: Risk::Low,
        category: category::SYSTEM.into(),
        summary: "Routine platform traffic".into(),
        is_anomaly: false,
        anomaly_score: 0.0,
        entropy: 2.6,
        source: Source::Metadata,
        upstream: None,
        decided_at: Utc::now(),
    }
}

#[tokio::test]
async fn cached_domain_returns_cache_verdict_without_reanalysis() {
    let f = fixture(false);
    assert!(f.orchestrator.cache.store(seeded_verdict("google.com")));

    let verdict = f
        .orchestrator
        .analyze("google.com", None, None, Priority::Manual)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(verdict.source, Source::Cache);
    assert_eq!(verdict.risk, Risk::Low);
    assert_eq!(verdict.category, category::SYSTEM);
    // the cache hit was still committed to the stream
    assert_eq!(f.orchestrator.buffer.len(), 1);
    assert_eq!(f.orchestrator.stats.decisions().local_decisions, 1);
}

#[tokio::test]
async fn dga_domain_commits_heuristic_when_reasoning_absent() {
    let f = fixture(false);

    let verdict = f
        .orchestrator
        .analyze("x7f3q9zk2m8w4hj6.ru", None, None, Priority::Manual)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(verdict.source, Source::Heuristic);
    assert_eq!(verdict.risk, Risk::High);
    assert_eq!(verdict.category, category::MALWARE);
    assert!(verdict.entropy >= 3.8);
}

#[tokio::test]
async fn privacy_domain_escalates_and_degrades_when_circuit_open() {
    let f = fixture(true);
    // trip the breaker: five straight failures
    for _ in 0..5 {
        f.orchestrator.breaker.record_failure();
    }

    let verdict = f
        .orchestrator
        .analyze("geo-ping.example.com", None, None, Priority::Manual)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(verdict.source, Source::Fallback);
    assert_eq!(verdict.category, category::PRIVACY);
    assert!(verdict.risk >= Risk::High);
    assert!(verdict.summary.contains("degraded"));
    assert!(verdict.summary.contains("circuit open"));
}

#[tokio::test]
async fn privacy_domain_degrades_on_reasoning_call_failure() {
    let f = fixture(true);

    let verdict = f
        .orchestrator
        .analyze("gps-trace.example.com", None, None, Priority::Manual)
        .await
        .unwrap()
        .unwrap();

    // the unroutable endpoint fails at the transport layer
    assert_eq!(verdict.source, Source::Fallback);
    assert_eq!(verdict.category, category::PRIVACY);
    assert!(verdict.risk >= Risk::High);
    assert!(verdict.summary.contains("degraded"));
}

#[tokio::test]
async fn duplicate_submissions_served_from_cache() {
    let f = fixture(false);

    let first = f
        .orchestrator
        .analyze("pixel.tracker-cdn.example.com", None, None, Priority::Manual)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.source, Source::Metadata);
    assert_eq!(first.category, category::TRACKER);

    for _ in 0..2 {
        let repeat = f
            .orchestrator
            .analyze("pixel.tracker-cdn.example.com", None, None, Priority::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repeat.source, Source::Cache);
    }

    // one full analysis, two cache hits
    assert_eq!(f.orchestrator.cache.stats().hits, 2);
    assert_eq!(f.orchestrator.buffer.len(), 3);
}

#[tokio::test]
async fn every_valid_submission_commits_exactly_one_verdict() {
    let f = fixture(false);
    let domains = [
        "alpha.example.com",
        "collect.metrics.example.net",
        "qx9z7k2v4m1w.top",
    ];

    for (i, domain) in domains.iter().enumerate() {
        let verdict = f
            .orchestrator
            .analyze(domain, None, None, Priority::Polled)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            verdict.source,
            Source::Metadata | Source::Heuristic | Source::Anomaly | Source::Fallback
        ));
        assert_eq!(f.orchestrator.buffer.len(), i + 1);
    }
}

#[tokio::test]
async fn invalid_domains_are_rejected_not_committed() {
    let f = fixture(false);

    for bad in ["", "no-dot", "has space.example", &"x".repeat(260)] {
        let result = f
            .orchestrator
            .analyze(bad, None, None, Priority::Manual)
            .await;
        assert!(result.is_err(), "{bad:?} should be rejected");
    }

    assert_eq!(f.orchestrator.buffer.len(), 0);
    assert_eq!(f.orchestrator.stats.drops().validation_rejected, 4);
}

#[tokio::test]
async fn in_flight_domain_gets_degraded_answer() {
    let f = fixture(false);
    // simulate another worker holding the domain
    assert!(f.orchestrator.dedup.admit("busy.example.com"));

    let verdict = f
        .orchestrator
        .analyze("busy.example.com", None, None, Priority::Manual)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict.source, Source::Fallback);
    assert!(verdict.summary.contains("in flight"));

    // polled duplicates are dropped silently
    let dropped = f
        .orchestrator
        .analyze("busy.example.com", None, None, Priority::Polled)
        .await
        .unwrap();
    assert!(dropped.is_none());
}

#[tokio::test]
async fn high_confidence_metadata_verdict_feeds_the_learner() {
    let f = fixture(false);
    let event = UpstreamEvent {
        domain: "settings-win.data.microsoft.com".into(),
        answered_at: Utc::now(),
        filter_reason: "FilteredBlackList".into(),
        filter_rule: Some("||settings-win.data.microsoft.com^".into()),
        filter_id: Some(2),
        client: None,
    };

    let before = f.orchestrator.signatures.lookup(&event).unwrap().hits;

    let verdict = f
        .orchestrator
        .analyze(
            "settings-win.data.microsoft.com",
            Some(event.clone()),
            None,
            Priority::Polled,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict.source, Source::Metadata);

    let after = f.orchestrator.signatures.lookup(&event).unwrap().hits;
    assert_eq!(after, before + 1);
}

#[tokio::test]
async fn committed_verdicts_reach_push_subscribers_in_order() {
    let f = fixture(false);
    let mut rx = f.orchestrator.buffer.subscribe();

    for domain in ["one.example.com", "two.example.com"] {
        f.orchestrator
            .analyze(domain, None, None, Priority::Polled)
            .await
            .unwrap();
    }

    assert_eq!(rx.recv().await.unwrap().domain, "one.example.com");
    assert_eq!(rx.recv().await.unwrap().domain, "two.example.com");
}
