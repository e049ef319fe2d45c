//! Verdict Data Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk level of a verdict. Ordering is total, `Unknown` lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Risk {
    /// No signal either way
    Unknown,
    /// Benign or routine traffic
    Low,
    /// Tracking, advertising, mild policy concerns
    Medium,
    /// Likely malicious or privacy-invasive
    High,
    /// Confirmed or near-certain threat
    Critical,
}

impl Risk {
    /// Stable label used in the ledger and API payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Unknown => "Unknown",
            Risk::Low => "Low",
            Risk::Medium => "Medium",
            Risk::High => "High",
            Risk::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Risk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which analysis tier produced a verdict. Set exactly once, at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// Served from the two-tier verdict cache
    Cache,
    /// Learned-signature / keyword match on upstream metadata
    Metadata,
    /// Statistical name features (entropy, digit ratio)
    Heuristic,
    /// Outlier relative to recent traffic
    Anomaly,
    /// Remote reasoning analyst
    Reasoning,
    /// Synthesized from the best lower tier under degraded conditions
    Fallback,
}

impl Source {
    /// Stable label used in the ledger and API payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "Cache",
            Source::Metadata => "Metadata",
            Source::Heuristic => "Heuristic",
            Source::Anomaly => "Anomaly",
            Source::Reasoning => "Reasoning",
            Source::Fallback => "Fallback",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known category labels. Categories are free-form strings on the wire;
/// these are the values the pipeline itself emits.
pub mod category {
    /// Telemetry / user tracking
    pub const TRACKER: &str = "Tracker";
    /// Ad delivery networks
    pub const ADVERTISING: &str = "Advertising";
    /// Malware, C2, DGA
    pub const MALWARE: &str = "Malware";
    /// OS and platform plumbing
    pub const SYSTEM: &str = "System";
    /// Location / personal-data collection
    pub const PRIVACY: &str = "Privacy";
    /// No classification
    pub const UNKNOWN: &str = "Unknown";
    /// Anomalous traffic with no matching signature
    pub const ZERO_DAY: &str = "Zero-Day Suspect";
}

/// One entry from the upstream DNS filter's query log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEvent {
    /// Queried name as reported upstream
    pub domain: String,
    /// When the query was answered
    pub answered_at: DateTime<Utc>,
    /// Opaque filter outcome string (e.g. "FilteredBlackList")
    pub filter_reason: String,
    /// Matching filter rule, when the query was filtered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_rule: Option<String>,
    /// Id of the filter list that matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_id: Option<i64>,
    /// Requesting client, as reported upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl UpstreamEvent {
    /// Whether the upstream filtered this query. Unknown reason strings are
    /// treated as unfiltered.
    pub fn is_filtered(&self) -> bool {
        let reason = self.filter_reason.to_ascii_lowercase();
        reason.starts_with("filtered") || reason.contains("block")
    }
}

/// Final classification record for one domain. Produced by exactly one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Normalized domain fingerprint
    pub domain: String,
    /// Assessed risk
    pub risk: Risk,
    /// Category label, usually one of [`category`]
    pub category: String,
    /// Human-readable one-line explanation
    pub summary: String,
    /// Whether the anomaly engine flagged the name
    pub is_anomaly: bool,
    /// Signed anomaly score; lower = more anomalous, 0.0 before training
    pub anomaly_score: f64,
    /// Shannon entropy of the registrable stem
    pub entropy: f64,
    /// Tier that produced this verdict
    pub source: Source,
    /// Upstream log entry that triggered the analysis, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamEvent>,
    /// Commit timestamp
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_ordering_is_total() {
        assert!(Risk::Unknown < Risk::Low);
        assert!(Risk::Low < Risk::Medium);
        assert!(Risk::Medium < Risk::High);
        assert!(Risk::High < Risk::Critical);
        assert_eq!(Risk::High.max(Risk::Medium), Risk::High);
    }

    #[test]
    fn test_unknown_reason_is_unfiltered() {
        let ev = UpstreamEvent {
            domain: "example.com".into(),
            answered_at: Utc::now(),
            filter_reason: "NotFilteredNotFound".into(),
            filter_rule: None,
            filter_id: None,
            client: None,
        };
        assert!(!ev.is_filtered());

        let blocked = UpstreamEvent {
            filter_reason: "Blocked by rule".into(),
            ..ev.clone()
        };
        assert!(blocked.is_filtered());

        let opaque = UpstreamEvent {
            filter_reason: "SomethingNew".into(),
            ..ev
        };
        assert!(!opaque.is_filtered());
    }

    #[test]
    fn test_verdict_serde_roundtrip() {
        let v = Verdict {
            domain: "example.com".into(),
            risk: Risk::Medium,
            category: category::TRACKER.into(),
            summary: "matched signature".into(),
            is_anomaly: false,
            anomaly_score: 0.0,
            entropy: 2.5,
            source: Source::Metadata,
            upstream: None,
            decided_at: Utc::now(),
        };
        let json = serde_json::to_string(&v).unwrap();
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back.risk, Risk::Medium);
        assert_eq!(back.source, Source::Metadata);
        assert_eq!(back.category, "Tracker");
    }
}
