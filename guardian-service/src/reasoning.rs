//! Remote Reasoning Client
//!
//! Calls the reasoning service for domains no local tier could settle.
//! Responses must conform to a typed schema; anything else counts as a
//! circuit-breaker failure. System-context prose is attached only for
//! architectural questions (a cost optimization, not a correctness
//! property).

use crate::breaker::CircuitBreaker;
use guardian_engine::{verdict::category, Risk};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout; anything slower counts as a failure
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Keywords marking a request as an architectural question.
const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "architecture",
    "stack",
    "how do you work",
    "who are you",
    "system",
    "infrastructure",
];

/// System context sent only with architectural questions.
const SYSTEM_CONTEXT: &str = "You are the Network Guardian analyst, a SOC-focused \
    reasoning service embedded in a local DNS observability pipeline. The pipeline \
    polls a DNS filter's query log, triages each domain through cache, signature, \
    heuristic and anomaly tiers, and escalates only unresolved names to you. \
    Respond with a strict JSON verdict. Focus strictly on defensive analysis.";

/// Categories the reasoning service is allowed to return.
const ALLOWED_CATEGORIES: &[&str] = &["Ad", "Tracker", "Malware", "Unknown"];

/// Reasoning call failure.
#[derive(Debug, Error)]
pub enum ReasoningError {
    /// No reasoning service configured
    #[error("reasoning service not configured")]
    Disabled,
    /// Circuit breaker rejected the call
    #[error("circuit breaker open")]
    Open,
    /// Connection-level failure
    #[error("transport error: {0}")]
    Transport(String),
    /// Call exceeded the request timeout
    #[error("request timed out")]
    Timeout,
    /// Non-success HTTP status
    #[error("http status {0}")]
    Status(u16),
    /// Response did not conform to the schema
    #[error("schema violation: {0}")]
    Schema(String),
}

/// Compact feature bundle shipped with every analysis request.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureBundle {
    /// Shannon entropy of the registrable stem
    pub entropy: f64,
    /// Digit ratio of the registrable stem
    pub digit_ratio: f64,
    /// Signed anomaly score (0.0 when untrained)
    pub anomaly_score: f64,
    /// Upstream filter reason, when the poller saw the domain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_reason: Option<String>,
    /// Upstream filter rule, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_rule: Option<String>,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    domain: &'a str,
    features: &'a FeatureBundle,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'static str>,
}

/// Raw wire response; validated into a [`ReasoningVerdict`].
#[derive(Debug, Deserialize)]
pub struct ReasoningResponse {
    /// 1..=10
    pub risk_score: u8,
    /// One of Ad, Tracker, Malware, Unknown
    pub category: String,
    /// Analyst explanation
    pub explanation: String,
    /// Suggested operator action
    #[serde(default)]
    pub recommended_action: String,
}

/// Validated verdict from the reasoning service.
#[derive(Debug, Clone)]
pub struct ReasoningVerdict {
    /// Mapped risk level
    pub risk: Risk,
    /// Pipeline category label
    pub category: String,
    /// Analyst explanation
    pub summary: String,
    /// Suggested operator action
    pub recommended_action: String,
}

/// Map a 1..=10 risk score onto the verdict scale.
pub fn map_risk(score: u8) -> Risk {
    match score {
        1..=3 => Risk::Low,
        4..=6 => Risk::Medium,
        7..=8 => Risk::High,
        _ => Risk::Critical,
    }
}

/// Whether a request reads as an architectural question.
pub fn is_architectural_query(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    ARCHITECTURE_KEYWORDS.iter().any(|k| text.contains(k))
}

/// HTTP client for the reasoning service, gated by the circuit breaker.
pub struct ReasoningClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    breaker: Arc<CircuitBreaker>,
}

impl ReasoningClient {
    /// Client for the given endpoint, sharing the pipeline's breaker.
    pub fn new(url: String, api_key: String, breaker: Arc<CircuitBreaker>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            api_key,
            breaker,
        }
    }

    /// Shared breaker handle.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Analyze a domain. `request_text` is the manual caller's free text,
    /// used only for the JIT-context check.
    pub async fn analyze(
        &self,
        domain: &str,
        features: &FeatureBundle,
        request_text: Option<&str>,
    ) -> Result<ReasoningVerdict, ReasoningError> {
        if !self.breaker.try_acquire() {
            return Err(ReasoningError::Open);
        }

        let context = request_text
            .filter(|t| is_architectural_query(t))
            .map(|_| SYSTEM_CONTEXT);
        if context.is_some() {
            tracing::debug!(domain, "attaching system context for architectural query");
        }

        let result = self.call(domain, features, context).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(ReasoningError::Timeout)
            | Err(ReasoningError::Schema(_))
            | Err(ReasoningError::Transport(_)) => self.breaker.record_failure(),
            Err(ReasoningError::Status(code)) if *code == 429 || *code >= 500 => {
                self.breaker.record_failure()
            }
            Err(_) => {}
        }
        result
    }

    async fn call(
        &self,
        domain: &str,
        features: &FeatureBundle,
        context: Option<&'static str>,
    ) -> Result<ReasoningVerdict, ReasoningError> {
        let request = AnalyzeRequest {
            domain,
            features,
            context,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasoningError::Timeout
                } else {
                    ReasoningError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReasoningError::Status(status.as_u16()));
        }

        let raw: ReasoningResponse = response
            .json()
            .await
            .map_err(|e| ReasoningError::Schema(e.to_string()))?;
        validate(raw)
    }
}

/// Enforce the response schema and map onto pipeline types.
pub fn validate(raw: ReasoningResponse) -> Result<ReasoningVerdict, ReasoningError> {
    if !(1..=10).contains(&raw.risk_score) {
        return Err(ReasoningError::Schema(format!(
            "risk_score {} outside 1..=10",
            raw.risk_score
        )));
    }
    if !ALLOWED_CATEGORIES.contains(&raw.category.as_str()) {
        return Err(ReasoningError::Schema(format!(
            "unknown category {:?}",
            raw.category
        )));
    }

    let category = match raw.category.as_str() {
        "Ad" => category::ADVERTISING,
        "Tracker" => category::TRACKER,
        "Malware" => category::MALWARE,
        _ => category::UNKNOWN,
    };

    Ok(ReasoningVerdict {
        risk: map_risk(raw.risk_score),
        category: category.into(),
        summary: raw.explanation,
        recommended_action: raw.recommended_action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_mapping() {
        assert_eq!(map_risk(1), Risk::Low);
        assert_eq!(map_risk(3), Risk::Low);
        assert_eq!(map_risk(4), Risk::Medium);
        assert_eq!(map_risk(6), Risk::Medium);
        assert_eq!(map_risk(7), Risk::High);
        assert_eq!(map_risk(8), Risk::High);
        assert_eq!(map_risk(9), Risk::Critical);
        assert_eq!(map_risk(10), Risk::Critical);
    }

    #[test]
    fn test_schema_validation() {
        let ok: ReasoningResponse = serde_json::from_str(
            r#"{"risk_score": 9, "category": "Malware", "explanation": "DGA beacon", "recommended_action": "block"}"#,
        )
        .unwrap();
        let verdict = validate(ok).unwrap();
        assert_eq!(verdict.risk, Risk::Critical);
        assert_eq!(verdict.category, "Malware");

        let out_of_range = ReasoningResponse {
            risk_score: 11,
            category: "Malware".into(),
            explanation: String::new(),
            recommended_action: String::new(),
        };
        assert!(matches!(validate(out_of_range), Err(ReasoningError::Schema(_))));

        let bad_category = ReasoningResponse {
            risk_score: 5,
            category: "Weird".into(),
            explanation: String::new(),
            recommended_action: String::new(),
        };
        assert!(matches!(validate(bad_category), Err(ReasoningError::Schema(_))));
    }

    #[test]
    fn test_ad_maps_to_advertising() {
        let raw = ReasoningResponse {
            risk_score: 4,
            category: "Ad".into(),
            explanation: "ad cdn".into(),
            recommended_action: String::new(),
        };
        let verdict = validate(raw).unwrap();
        assert_eq!(verdict.category, category::ADVERTISING);
        assert_eq!(verdict.risk, Risk::Medium);
    }

    #[test]
    fn test_jit_context_keyword_check() {
        assert!(is_architectural_query("How does your ARCHITECTURE work?"));
        assert!(is_architectural_query("what's in the stack"));
        assert!(!is_architectural_query("is tracker.example.com dangerous?"));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::with_timing(
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        for _ in 0..5 {
            breaker.record_failure();
        }
        let client = ReasoningClient::new(
            "http://127.0.0.1:9".into(),
            "key".into(),
            breaker,
        );
        let bundle = FeatureBundle {
            entropy: 4.0,
            digit_ratio: 0.4,
            anomaly_score: -0.2,
            upstream_reason: None,
            upstream_rule: None,
        };
        let err = client.analyze("x.example", &bundle, None).await.unwrap_err();
        assert!(matches!(err, ReasoningError::Open));
    }
}
