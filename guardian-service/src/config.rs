//! Service Configuration
//!
//! Environment-driven. Any absent credential disables that subsystem with a
//! logged warning; the pipeline continues with degraded capability.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Polling faster than this is refused
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
/// Default polling interval
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Full service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// HTTP listen address
    pub listen_addr: String,
    /// Upstream poll interval in seconds (>= 5)
    pub poll_interval_secs: u64,
    /// Primary upstream DNS filter URL
    pub upstream_url: Option<String>,
    /// Upstream basic-auth user
    pub upstream_user: Option<String>,
    /// Upstream basic-auth password
    pub upstream_pass: Option<String>,
    /// Maximum log entries requested per tick
    pub batch_limit: usize,
    /// Reasoning service URL
    pub reasoning_url: Option<String>,
    /// Reasoning service API key
    pub reasoning_api_key: Option<String>,
    /// Ledger append endpoint
    pub ledger_url: Option<String>,
    /// Ledger sheet/table identifier
    pub ledger_id: Option<String>,
    /// Ledger bearer token
    pub ledger_token: Option<String>,
    /// Memory cache capacity (entries)
    pub cache_memory_capacity: u64,
    /// Disk cache path; `None` disables the disk tier
    pub cache_disk_path: Option<PathBuf>,
    /// Signature snapshot path; `None` keeps signatures in memory only
    pub signature_path: Option<PathBuf>,
    /// Analysis worker count
    pub worker_pool_size: usize,
    /// Recent-domain window size for the deduplicator
    pub dedup_window: usize,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            upstream_url: None,
            upstream_user: None,
            upstream_pass: None,
            batch_limit: 100,
            reasoning_url: None,
            reasoning_api_key: None,
            ledger_url: None,
            ledger_id: None,
            ledger_token: None,
            cache_memory_capacity: 5000,
            cache_disk_path: Some(PathBuf::from("data/verdict_cache.ngc")),
            signature_path: Some(PathBuf::from("data/signatures.ngs")),
            worker_pool_size: 8,
            dedup_window: 5000,
        }
    }
}

impl GuardianConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut config = Self {
            listen_addr: env_opt("GUARDIAN_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            poll_interval_secs: env_parse("GUARDIAN_POLL_INTERVAL")
                .unwrap_or(defaults.poll_interval_secs),
            upstream_url: env_opt("UPSTREAM_URL"),
            upstream_user: env_opt("UPSTREAM_USER"),
            upstream_pass: env_opt("UPSTREAM_PASS"),
            batch_limit: env_parse("GUARDIAN_BATCH_LIMIT").unwrap_or(defaults.batch_limit),
            reasoning_url: env_opt("REASONING_URL"),
            reasoning_api_key: env_opt("REASONING_API_KEY"),
            ledger_url: env_opt("LEDGER_URL"),
            ledger_id: env_opt("LEDGER_ID"),
            ledger_token: env_opt("LEDGER_TOKEN"),
            cache_memory_capacity: env_parse("CACHE_MEMORY_CAPACITY")
                .unwrap_or(defaults.cache_memory_capacity),
            cache_disk_path: env_opt("CACHE_DISK_PATH")
                .map(PathBuf::from)
                .or(defaults.cache_disk_path),
            signature_path: env_opt("SIGNATURE_PATH")
                .map(PathBuf::from)
                .or(defaults.signature_path),
            worker_pool_size: env_parse("WORKER_POOL_SIZE").unwrap_or(defaults.worker_pool_size),
            dedup_window: env_parse("DEDUP_WINDOW").unwrap_or(defaults.dedup_window),
        };

        if config.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            tracing::warn!(
                requested = config.poll_interval_secs,
                minimum = MIN_POLL_INTERVAL_SECS,
                "poll interval below minimum, clamping"
            );
            config.poll_interval_secs = MIN_POLL_INTERVAL_SECS;
        }
        if config.worker_pool_size == 0 {
            config.worker_pool_size = 1;
        }

        config
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Whether upstream polling is fully configured.
    pub fn has_upstream(&self) -> bool {
        self.upstream_url.is_some() && self.upstream_user.is_some() && self.upstream_pass.is_some()
    }

    /// Whether the reasoning tier is configured.
    pub fn has_reasoning(&self) -> bool {
        self.reasoning_url.is_some() && self.reasoning_api_key.is_some()
    }

    /// Whether the ledger sink is configured.
    pub fn has_ledger(&self) -> bool {
        self.ledger_url.is_some() && self.ledger_id.is_some() && self.ledger_token.is_some()
    }

    /// Prioritized upstream URL candidates: configured primary, then the
    /// container host gateway, then loopback.
    pub fn upstream_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(url) = &self.upstream_url {
            candidates.push(url.trim_end_matches('/').to_string());
        }
        for fallback in ["http://host.docker.internal:3000", "http://127.0.0.1:3000"] {
            if !candidates.iter().any(|c| c == fallback) {
                candidates.push(fallback.to_string());
            }
        }
        candidates
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}
