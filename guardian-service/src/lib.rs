//! Network Guardian Service
//!
//! Local network-observability daemon that turns a DNS filter's query log
//! into enriched, classified threat verdicts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         NETWORK GUARDIAN SERVICE                        │
//! │                                                                         │
//! │  ┌──────────────┐      ┌──────────────┐      ┌────────────────────────┐ │
//! │  │   Upstream   │──────▶ Deduplicator │──────▶   Worker Pool (8)      │ │
//! │  │    Poller    │      │  (in-flight) │      │  manual : polled 4:1   │ │
//! │  └──────────────┘      └──────────────┘      └───────────┬────────────┘ │
//! │                                                          │              │
//! │  ┌───────────────────────────────────────────────────────▼────────────┐ │
//! │  │                          ORCHESTRATOR                              │ │
//! │  │   Cache → Metadata → Heuristic → Anomaly → Reasoning → Fallback    │ │
//! │  │             (circuit breaker guards the reasoning tier)            │ │
//! │  └───────────────────────────────┬────────────────────────────────────┘ │
//! │                                  │ commit                               │
//! │  ┌──────────────┐  ┌─────────────▼──────────┐  ┌──────────────────────┐ │
//! │  │   Pattern    │◀─│ Verdict Buffer (ring)  │─▶│  Ledger Sink (HTTP,  │ │
//! │  │   Learner    │  │   + WebSocket fanout   │  │   bounded retry)     │ │
//! │  └──────────────┘  └────────────────────────┘  └──────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod breaker;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod ledger;
pub mod orchestrator;
pub mod poller;
pub mod reasoning;
pub mod stats;

use crate::api::ApiContext;
use crate::breaker::CircuitBreaker;
use crate::buffer::VerdictBuffer;
use crate::cache::{DiskWriter, VerdictCache};
use crate::config::GuardianConfig;
use crate::ledger::LedgerSink;
use crate::orchestrator::{spawn_workers, AnomalyUpdater, Orchestrator};
use crate::poller::Poller;
use crate::reasoning::ReasoningClient;
use crate::stats::SystemStats;
use guardian_engine::{AnomalyEngine, HeuristicEngine, SignatureStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Background maintenance cadence (cache sweep, signature snapshot)
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Service error types
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Listener / transport failure
    #[error("network error: {0}")]
    Network(String),
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The assembled service: construct with [`Guardian::new`], then [`run`].
///
/// [`run`]: Guardian::run
pub struct Guardian {
    /// Effective configuration
    pub config: GuardianConfig,
    /// The pipeline and everything a commit touches
    pub orchestrator: Arc<Orchestrator>,
    disk_writer: Option<DiskWriter>,
    anomaly_updater: AnomalyUpdater,
}

impl Guardian {
    /// Construct every component and wire them together. No tasks are
    /// spawned until [`Guardian::run`].
    pub fn new(config: GuardianConfig) -> Self {
        let stats = Arc::new(SystemStats::new());
        let heuristics = Arc::new(HeuristicEngine::new());
        let anomaly = Arc::new(AnomalyEngine::new());
        let breaker = Arc::new(CircuitBreaker::new());
        let buffer = Arc::new(VerdictBuffer::new());
        let dedup = Arc::new(crate::dedup::Deduplicator::new(config.dedup_window));

        let signatures = match &config.signature_path {
            Some(path) => Arc::new(SignatureStore::open(path.clone())),
            None => Arc::new(SignatureStore::new()),
        };

        let (cache, disk_writer) = match &config.cache_disk_path {
            Some(path) => {
                let (cache, writer) = VerdictCache::open(config.cache_memory_capacity, path.clone());
                (Arc::new(cache), Some(writer))
            }
            None => (Arc::new(VerdictCache::new(config.cache_memory_capacity)), None),
        };

        let reasoning = if config.has_reasoning() {
            Some(Arc::new(ReasoningClient::new(
                config.reasoning_url.clone().unwrap_or_default(),
                config.reasoning_api_key.clone().unwrap_or_default(),
                breaker.clone(),
            )))
        } else {
            tracing::warn!("reasoning credentials absent, escalations will degrade to fallback");
            None
        };

        let ledger = LedgerSink::from_config(&config);

        let (orchestrator, anomaly_updater) = Orchestrator::new(
            cache,
            dedup,
            signatures,
            heuristics,
            anomaly,
            reasoning,
            breaker,
            buffer,
            ledger,
            stats,
        );

        Self {
            config,
            orchestrator,
            disk_writer,
            anomaly_updater,
        }
    }

    /// Spawn the background tasks and serve until shutdown. On a clean
    /// shutdown the signature store is flushed.
    pub async fn run(self) -> Result<(), ServiceError> {
        let Guardian {
            config,
            orchestrator,
            disk_writer,
            anomaly_updater,
        } = self;

        if let Some(writer) = disk_writer {
            tokio::spawn(writer.run());
        }
        tokio::spawn(anomaly_updater.run());

        let queues = spawn_workers(orchestrator.clone(), config.worker_pool_size);

        // periodic cache sweep + signature snapshot
        {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
                ticker.tick().await; // skip the immediate first tick
                loop {
                    ticker.tick().await;
                    orchestrator.cache.purge_expired();
                    if let Err(e) = orchestrator.signatures.flush() {
                        tracing::warn!(error = %e, "signature snapshot failed");
                    }
                }
            });
        }

        if config.has_upstream() {
            let poller = Arc::new(Poller::new(
                config.upstream_candidates(),
                config.upstream_user.clone().unwrap_or_default(),
                config.upstream_pass.clone().unwrap_or_default(),
                config.batch_limit,
            ));
            tokio::spawn(poller.run(
                config.poll_interval(),
                queues.clone(),
                orchestrator.stats.clone(),
            ));
        } else {
            tracing::warn!("upstream credentials absent, poller disabled; manual analysis only");
        }

        let context = Arc::new(ApiContext {
            orchestrator: orchestrator.clone(),
            queues,
        });
        let app = api::router(context);

        let listener = tokio::net::TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        tracing::info!(addr = %config.listen_addr, "guardian API listening");

        tokio::select! {
            result = axum::serve(listener, app) => {
                result.map_err(|e| ServiceError::Network(e.to_string()))?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }

        if let Err(e) = orchestrator.signatures.flush() {
            tracing::warn!(error = %e, "final signature snapshot failed");
        }
        Ok(())
    }
}
