//! Verdict Ledger Sink
//!
//! Append-only row writer for committed verdicts. Fire-and-forget with a
//! bounded retry; the pipeline never waits on the ledger. Rows are
//! idempotent on `(decided_at, domain)`.

use crate::config::GuardianConfig;
use guardian_engine::Verdict;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Fixed column order of every appended row.
pub const LEDGER_COLUMNS: [&str; 10] = [
    "decided_at",
    "domain",
    "risk",
    "category",
    "summary",
    "upstream_reason",
    "upstream_rule",
    "is_anomaly",
    "anomaly_score",
    "entropy",
];

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);

/// HTTP append client for the external ledger.
pub struct LedgerSink {
    client: reqwest::Client,
    url: String,
    ledger_id: String,
    token: String,
}

impl LedgerSink {
    /// Build from configuration. Returns `None` (with a logged warning)
    /// when credentials are absent; the pipeline continues without a ledger.
    pub fn from_config(config: &GuardianConfig) -> Option<Arc<Self>> {
        if !config.has_ledger() {
            tracing::warn!("ledger credentials absent, verdicts will not be persisted externally");
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Some(Arc::new(Self {
            client,
            url: config.ledger_url.clone().unwrap_or_default(),
            ledger_id: config.ledger_id.clone().unwrap_or_default(),
            token: config.ledger_token.clone().unwrap_or_default(),
        }))
    }

    /// One verdict as a row in [`LEDGER_COLUMNS`] order.
    pub fn row(verdict: &Verdict) -> Vec<Value> {
        let (reason, rule) = match &verdict.upstream {
            Some(ev) => (
                Value::String(ev.filter_reason.clone()),
                ev.filter_rule.clone().map(Value::String).unwrap_or(Value::Null),
            ),
            None => (Value::Null, Value::Null),
        };
        vec![
            Value::String(verdict.decided_at.to_rfc3339()),
            Value::String(verdict.domain.clone()),
            Value::String(verdict.risk.as_str().into()),
            Value::String(verdict.category.clone()),
            Value::String(verdict.summary.clone()),
            reason,
            rule,
            Value::Bool(verdict.is_anomaly),
            json!(verdict.anomaly_score),
            json!(verdict.entropy),
        ]
    }

    /// Append one verdict, retrying transient failures a bounded number of
    /// times. Drops the row with a warning after the last attempt.
    pub async fn append(&self, verdict: &Verdict) {
        let body = json!({
            "ledger_id": self.ledger_id,
            "columns": LEDGER_COLUMNS,
            "row": Self::row(verdict),
        });
        let idempotency_key = format!("{}|{}", verdict.decided_at.to_rfc3339(), verdict.domain);

        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .client
                .post(&self.url)
                .bearer_auth(&self.token)
                .header("Idempotency-Key", &idempotency_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(domain = %verdict.domain, "verdict appended to ledger");
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(
                        domain = %verdict.domain,
                        status = resp.status().as_u16(),
                        attempt,
                        "ledger append rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(domain = %verdict.domain, error = %e, attempt, "ledger append failed");
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(BASE_DELAY * 2u32.pow(attempt)).await;
            }
        }
        tracing::warn!(domain = %verdict.domain, "ledger append dropped after retries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use guardian_engine::{Risk, Source, UpstreamEvent};

    #[test]
    fn test_row_column_order() {
        let verdict = Verdict {
            domain: "tracker.example".into(),
            risk: Risk::Medium,
            category: "Tracker".into(),
            summary: "matched signature".into(),
            is_anomaly: false,
            anomaly_score: -0.02,
            entropy: 2.8,
            source: Source::Metadata,
            upstream: Some(UpstreamEvent {
                domain: "tracker.example".into(),
                answered_at: Utc::now(),
                filter_reason: "FilteredBlackList".into(),
                filter_rule: Some("||tracker.example^".into()),
                filter_id: Some(2),
                client: None,
            }),
            decided_at: Utc::now(),
        };

        let row = LedgerSink::row(&verdict);
        assert_eq!(row.len(), LEDGER_COLUMNS.len());
        assert_eq!(row[1], Value::String("tracker.example".into()));
        assert_eq!(row[2], Value::String("Medium".into()));
        assert_eq!(row[3], Value::String("Tracker".into()));
        assert_eq!(row[5], Value::String("FilteredBlackList".into()));
        assert_eq!(row[7], Value::Bool(false));
    }

    #[test]
    fn test_absent_credentials_disable_sink() {
        let config = GuardianConfig::default();
        assert!(LedgerSink::from_config(&config).is_none());
    }
}
