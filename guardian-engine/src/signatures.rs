//! Signature Store
//!
//! Learned upstream-metadata → verdict mappings. The pattern learner is the
//! only writer; the metadata classifier reads consistent snapshots. A seed
//! baseline covers cold start; snapshots are rewritten atomically.

use crate::verdict::{category, Risk, UpstreamEvent};
use crate::EngineError;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot file magic
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"NGSG";
/// Snapshot format version
pub const SNAPSHOT_VERSION: u8 = 1;

/// Signatures unseen for this long are ignored by lookups
const STALE_AFTER_DAYS: i64 = 30;

/// Confidence blend factor: `conf <- 0.8*conf + 0.2*observed`
const BLEND_KEEP: f64 = 0.8;

/// Partition key over upstream metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureKey {
    /// Upstream filter outcome string
    pub reason: String,
    /// Filter list id, when present
    pub filter_id: Option<i64>,
    /// Coarse rule normalization (TRACKING, MALWARE, literal prefix, ...)
    pub rule_prefix: String,
    /// Coarse client classification (MOBILE, DESKTOP, ...)
    pub client_class: String,
}

impl SignatureKey {
    /// Build the key for an upstream event.
    pub fn from_event(event: &UpstreamEvent) -> Self {
        Self {
            reason: event.filter_reason.clone(),
            filter_id: event.filter_id,
            rule_prefix: rule_prefix(event.filter_rule.as_deref()),
            client_class: client_class(event.client.as_deref()),
        }
    }
}

/// Normalize a filter rule into a coarse prefix class.
pub fn rule_prefix(rule: Option<&str>) -> String {
    let rule = match rule {
        Some(r) if !r.trim().is_empty() => r.trim().to_ascii_lowercase(),
        _ => return "NO_RULE".into(),
    };

    if rule.contains("tracking") || rule.contains("telemetry") {
        "TRACKING".into()
    } else if rule.contains("malware") || rule.contains("malicious") {
        "MALWARE".into()
    } else if rule.contains("ads") || rule.contains("advertisement") {
        "ADS".into()
    } else if rule.contains("privacy") || rule.contains("geo") || rule.contains("location") {
        "PRIVACY".into()
    } else if rule.contains("social") {
        "SOCIAL".into()
    } else if rule.contains("analytics") {
        "ANALYTICS".into()
    } else if rule.contains("block") {
        "BLOCK".into()
    } else {
        let first = rule.split_whitespace().next().unwrap_or("GENERIC");
        first.chars().take(20).collect()
    }
}

/// Normalize client info into a coarse device class.
pub fn client_class(client: Option<&str>) -> String {
    let client = match client {
        Some(c) if !c.trim().is_empty() => c.trim().to_ascii_lowercase(),
        _ => return "UNKNOWN_CLIENT".into(),
    };

    if client.contains("mobile") || client.contains("android") || client.contains("ios") {
        "MOBILE".into()
    } else if client.contains("desktop") || client.contains("windows") || client.contains("macos") {
        "DESKTOP".into()
    } else if client.contains("tv") || client.contains("smart") {
        "IOT".into()
    } else {
        "OTHER_DEVICE".into()
    }
}

/// A learned (or seeded) metadata pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    /// Partition key
    pub key: SignatureKey,
    /// Category this pattern maps to
    pub category: String,
    /// Risk this pattern maps to
    pub risk: Risk,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Observations supporting the pattern
    pub hits: u64,
    /// Last confirming observation
    pub last_seen: DateTime<Utc>,
}

impl Signature {
    /// Whether the signature is too old to trust.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen > Duration::days(STALE_AFTER_DAYS)
    }
}

/// Concurrent signature store with seed baseline and atomic disk snapshots.
pub struct SignatureStore {
    signatures: RwLock<HashMap<SignatureKey, Signature>>,
    path: Option<PathBuf>,
    seed_count: usize,
    learned: AtomicU64,
}

impl SignatureStore {
    /// In-memory store with the seed baseline.
    pub fn new() -> Self {
        let seeds = seed_signatures();
        let seed_count = seeds.len();
        Self {
            signatures: RwLock::new(seeds),
            path: None,
            seed_count,
            learned: AtomicU64::new(0),
        }
    }

    /// Store backed by a snapshot file. A missing or unreadable snapshot
    /// falls back to the seed baseline.
    pub fn open(path: PathBuf) -> Self {
        let mut store = Self::new();
        match load_snapshot(&path) {
            Ok(signatures) if !signatures.is_empty() => {
                tracing::info!(count = signatures.len(), path = %path.display(), "loaded signature snapshot");
                let mut map = store.signatures.write();
                map.clear();
                for sig in signatures {
                    map.insert(sig.key.clone(), sig);
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "signature snapshot unavailable, using seed baseline");
            }
        }
        store.path = Some(path);
        store
    }

    /// Probe for a match at decreasing specificity:
    /// exact key → (reason, rule_prefix) → (reason). The best non-stale
    /// signature at the first matching level wins (highest confidence,
    /// ties broken by most recent `last_seen`).
    pub fn lookup(&self, event: &UpstreamEvent) -> Option<Signature> {
        let key = SignatureKey::from_event(event);
        let now = Utc::now();
        let map = self.signatures.read();

        if let Some(sig) = map.get(&key) {
            if !sig.is_stale(now) {
                return Some(sig.clone());
            }
        }

        let level2 = best_of(map.values().filter(|s| {
            !s.is_stale(now) && s.key.reason == key.reason && s.key.rule_prefix == key.rule_prefix
        }));
        if level2.is_some() {
            return level2;
        }

        best_of(map.values().filter(|s| !s.is_stale(now) && s.key.reason == key.reason))
    }

    /// Apply one confirmed observation: blend confidence for an existing
    /// key, insert a new signature otherwise.
    pub fn observe(&self, key: SignatureKey, category: &str, risk: Risk, observed_conf: f64) {
        let observed_conf = observed_conf.clamp(0.0, 1.0);
        let mut map = self.signatures.write();
        match map.get_mut(&key) {
            Some(sig) => {
                sig.hits += 1;
                sig.last_seen = Utc::now();
                sig.confidence = BLEND_KEEP * sig.confidence + (1.0 - BLEND_KEEP) * observed_conf;
                sig.category = category.to_string();
                sig.risk = risk;
            }
            None => {
                map.insert(
                    key.clone(),
                    Signature {
                        key,
                        category: category.to_string(),
                        risk,
                        confidence: observed_conf,
                        hits: 1,
                        last_seen: Utc::now(),
                    },
                );
                self.learned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Total signatures currently held.
    pub fn len(&self) -> usize {
        self.signatures.read().len()
    }

    /// Whether the store holds no signatures.
    pub fn is_empty(&self) -> bool {
        self.signatures.read().is_empty()
    }

    /// Signatures in the seed baseline.
    pub fn seed_count(&self) -> usize {
        self.seed_count
    }

    /// Signatures learned since process start.
    pub fn learned_count(&self) -> u64 {
        self.learned.load(Ordering::Relaxed)
    }

    /// Category → signature count, for the stats surface.
    pub fn category_distribution(&self) -> HashMap<String, usize> {
        let mut dist = HashMap::new();
        for sig in self.signatures.read().values() {
            *dist.entry(sig.category.clone()).or_insert(0) += 1;
        }
        dist
    }

    /// Write a snapshot via write-then-rename. No-op without a path.
    pub fn flush(&self) -> Result<(), EngineError> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let signatures: Vec<Signature> = self.signatures.read().values().cloned().collect();
        write_snapshot(&path, &signatures)?;
        tracing::debug!(count = signatures.len(), path = %path.display(), "signature snapshot written");
        Ok(())
    }
}

impl Default for SignatureStore {
    fn default() -> Self {
        Self::new()
    }
}

fn best_of<'a>(candidates: impl Iterator<Item = &'a Signature>) -> Option<Signature> {
    candidates
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.last_seen.cmp(&b.last_seen))
        })
        .cloned()
}

/// Pre-learned baseline so the classifier is useful before any feedback.
fn seed_signatures() -> HashMap<SignatureKey, Signature> {
    let now = Utc::now();
    let seed = |reason: &str, filter_id, rule: &str, cat: &str, risk| {
        let key = SignatureKey {
            reason: reason.into(),
            filter_id,
            rule_prefix: rule_prefix(Some(rule)),
            client_class: client_class(None),
        };
        Signature {
            key,
            category: cat.into(),
            risk,
            confidence: 0.95,
            hits: 100,
            last_seen: now,
        }
    };

    let seeds = [
        seed("Processed", Some(14), "||googleapis.com^", category::SYSTEM, Risk::Low),
        seed("Processed", Some(14), "||gstatic.com^", category::SYSTEM, Risk::Low),
        seed(
            "FilteredBlackList",
            Some(2),
            "||telemetry.microsoft.com^",
            category::TRACKER,
            Risk::Medium,
        ),
        seed(
            "FilteredBlackList",
            Some(2),
            "||settings-win.data.microsoft.com^",
            category::TRACKER,
            Risk::Medium,
        ),
        seed("FilteredBlackList", Some(1), "||*.xyz^", category::MALWARE, Risk::High),
    ];

    seeds.into_iter().map(|s| (s.key.clone(), s)).collect()
}

fn write_snapshot(path: &Path, signatures: &[Signature]) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&SNAPSHOT_MAGIC)?;
        file.write_all(&[SNAPSHOT_VERSION])?;
        serde_json::to_writer(&mut file, signatures)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<Vec<Signature>, EngineError> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 5];
    file.read_exact(&mut header)?;
    if header[..4] != SNAPSHOT_MAGIC || header[4] != SNAPSHOT_VERSION {
        return Err(EngineError::Snapshot(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad snapshot header",
        )));
    }
    let mut body = Vec::new();
    file.read_to_end(&mut body)?;
    let signatures = serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(signatures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_event(rule: &str) -> UpstreamEvent {
        UpstreamEvent {
            domain: "tracker.example".into(),
            answered_at: Utc::now(),
            filter_reason: "FilteredBlackList".into(),
            filter_rule: Some(rule.into()),
            filter_id: Some(2),
            client: None,
        }
    }

    #[test]
    fn test_seed_baseline_present() {
        let store = SignatureStore::new();
        assert_eq!(store.len(), store.seed_count());
        assert!(store.len() >= 5);
    }

    #[test]
    fn test_exact_lookup_beats_reason_level() {
        let store = SignatureStore::new();
        let event = blocked_event("||telemetry.microsoft.com^");
        let sig = store.lookup(&event).expect("seed match");
        assert_eq!(sig.category, category::TRACKER);
        assert_eq!(sig.key.rule_prefix, "TRACKING");
    }

    #[test]
    fn test_reason_level_fallback() {
        let store = SignatureStore::new();
        // Rule matching no seed prefix: falls through to the reason level,
        // where the highest-confidence FilteredBlackList seed wins.
        let event = blocked_event("||something-novel.example^");
        let sig = store.lookup(&event).expect("reason-level match");
        assert_eq!(sig.key.reason, "FilteredBlackList");
    }

    #[test]
    fn test_observe_blend_and_idempotence() {
        let store = SignatureStore::new();
        let key = SignatureKey {
            reason: "FilteredBlackList".into(),
            filter_id: Some(7),
            rule_prefix: "ADS".into(),
            client_class: "DESKTOP".into(),
        };

        store.observe(key.clone(), category::ADVERTISING, Risk::Medium, 1.0);
        let first = store
            .signatures
            .read()
            .get(&key)
            .cloned()
            .expect("inserted");
        assert_eq!(first.hits, 1);
        assert!((first.confidence - 1.0).abs() < 1e-9);

        store.observe(key.clone(), category::ADVERTISING, Risk::Medium, 0.5);
        let second = store.signatures.read().get(&key).cloned().unwrap();
        // hits may only grow by one per apply; confidence blends 0.8/0.2
        assert_eq!(second.hits, 2);
        assert!((second.confidence - 0.9).abs() < 1e-9);
        assert_eq!(store.learned_count(), 1);
    }

    #[test]
    fn test_stale_signatures_ignored() {
        let store = SignatureStore::new();
        let key = SignatureKey {
            reason: "Ancient".into(),
            filter_id: None,
            rule_prefix: "NO_RULE".into(),
            client_class: "UNKNOWN_CLIENT".into(),
        };
        store.signatures.write().insert(
            key.clone(),
            Signature {
                key,
                category: category::TRACKER.into(),
                risk: Risk::Medium,
                confidence: 0.99,
                hits: 50,
                last_seen: Utc::now() - Duration::days(STALE_AFTER_DAYS + 1),
            },
        );

        let event = UpstreamEvent {
            domain: "old.example".into(),
            answered_at: Utc::now(),
            filter_reason: "Ancient".into(),
            filter_rule: None,
            filter_id: None,
            client: None,
        };
        assert!(store.lookup(&event).is_none());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.ngs");

        let store = SignatureStore::open(path.clone());
        let key = SignatureKey {
            reason: "FilteredBlackList".into(),
            filter_id: Some(9),
            rule_prefix: "MALWARE".into(),
            client_class: "IOT".into(),
        };
        store.observe(key.clone(), category::MALWARE, Risk::High, 0.9);
        store.flush().unwrap();

        let reloaded = SignatureStore::open(path);
        assert_eq!(reloaded.len(), store.len());
        assert!(reloaded.signatures.read().contains_key(&key));
    }

    #[test]
    fn test_bad_snapshot_header_falls_back_to_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.ngs");
        std::fs::write(&path, b"JUNKJUNKJUNK").unwrap();

        let store = SignatureStore::open(path);
        assert_eq!(store.len(), store.seed_count());
    }

    #[test]
    fn test_rule_and_client_normalization() {
        assert_eq!(rule_prefix(Some("||telemetry.microsoft.com^")), "TRACKING");
        assert_eq!(rule_prefix(Some("badware malware list")), "MALWARE");
        assert_eq!(rule_prefix(None), "NO_RULE");
        assert_eq!(rule_prefix(Some("||example.com^")), "||example.com^");

        assert_eq!(client_class(Some("Android-Phone")), "MOBILE");
        assert_eq!(client_class(Some("windows-desktop")), "DESKTOP");
        assert_eq!(client_class(Some("samsung-smart-tv")), "IOT");
        assert_eq!(client_class(None), "UNKNOWN_CLIENT");
    }
}
