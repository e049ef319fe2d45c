//! HTTP & Push Surface
//!
//! The verdict stream contract: recent history, manual-session history, the
//! synchronous analyze endpoint, system stats, and a WebSocket push channel
//! delivering verdicts in commit order. The manual endpoint is the only
//! place pipeline failures surface (validation as 4xx, everything else as a
//! degraded 200).

use crate::orchestrator::{AnalysisJob, JobQueues, Orchestrator};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// History endpoints return at most this many verdicts
pub const HISTORY_LIMIT: usize = 200;

/// How long the analyze endpoint waits for a verdict before degrading
const ANALYZE_DEADLINE: Duration = Duration::from_secs(30);

/// Shared state behind the HTTP surface.
pub struct ApiContext {
    /// The pipeline
    pub orchestrator: Arc<Orchestrator>,
    /// Worker queue handles
    pub queues: JobQueues,
}

/// Build the service router.
pub fn router(context: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/history", get(history))
        .route("/manual-history", get(manual_history))
        .route("/analyze", post(analyze))
        .route("/api/stats/system", get(system_stats))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn health(State(context): State<Arc<ApiContext>>) -> impl IntoResponse {
    let orchestrator = &context.orchestrator;
    Json(json!({
        "status": "ok",
        "processed": orchestrator.dedup.recent_len(),
        "in_flight": orchestrator.dedup.in_flight_len(),
    }))
}

async fn history(State(context): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(context.orchestrator.buffer.recent(HISTORY_LIMIT))
}

async fn manual_history(State(context): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(context.orchestrator.buffer.manual_recent(HISTORY_LIMIT))
}

/// Manual analysis request body.
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    /// Domain to analyze
    pub domain: String,
    /// Optional free-text context from the caller
    #[serde(default)]
    pub context: Option<String>,
}

async fn analyze(
    State(context): State<Arc<ApiContext>>,
    Json(request): Json<AnalyzeRequest>,
) -> impl IntoResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    let job = AnalysisJob::manual(request.domain.clone(), request.context, reply_tx);

    if context.queues.manual_tx.try_send(job).is_err() {
        tracing::warn!(domain = %request.domain, "manual queue saturated, degrading");
        return degraded_response(&request.domain, "worker pool saturated");
    }

    match tokio::time::timeout(ANALYZE_DEADLINE, reply_rx).await {
        Ok(Ok(Ok(verdict))) => (StatusCode::OK, Json(json!(verdict))).into_response(),
        Ok(Ok(Err(validation))) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": validation.to_string() })),
        )
            .into_response(),
        Ok(Err(_)) | Err(_) => degraded_response(&request.domain, "analysis did not complete"),
    }
}

fn degraded_response(domain: &str, note: &str) -> axum::response::Response {
    let verdict = json!({
        "domain": domain,
        "risk": "Unknown",
        "category": "Unknown",
        "summary": format!("{note} (degraded mode)"),
        "is_anomaly": false,
        "anomaly_score": 0.0,
        "entropy": 0.0,
        "source": "Fallback",
        "decided_at": chrono::Utc::now(),
    });
    (StatusCode::OK, Json(verdict)).into_response()
}

async fn system_stats(State(context): State<Arc<ApiContext>>) -> impl IntoResponse {
    let orchestrator = &context.orchestrator;
    let decisions = orchestrator.stats.decisions();
    let drops = orchestrator.stats.drops();

    Json(json!({
        "autonomy_score": decisions.autonomy_score,
        "local_decisions": decisions.local_decisions,
        "cloud_decisions": decisions.cloud_decisions,
        "total_decisions": decisions.total_decisions,
        "learned_patterns": orchestrator.signatures.learned_count(),
        "seed_patterns": orchestrator.signatures.seed_count(),
        "total_patterns": orchestrator.signatures.len(),
        "classifier": {
            "category_distribution": orchestrator.signatures.category_distribution(),
        },
        "cache": orchestrator.cache.stats(),
        "anomaly_engine": orchestrator.anomaly.stats(),
        "thresholds": {
            "entropy": orchestrator.heuristics.threshold(),
            "anomaly": orchestrator.anomaly.threshold(),
        },
        "breaker": orchestrator.breaker.state(),
        "subscribers": orchestrator.buffer.subscriber_count(),
        "counters": drops,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(context): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

/// Push loop: verdicts are delivered as they commit, newest last. A client
/// that falls behind its bounded queue loses the oldest messages; the
/// publisher never waits.
async fn handle_socket(mut socket: WebSocket, context: Arc<ApiContext>) {
    let client_id = uuid::Uuid::new_v4();
    let mut verdicts = context.orchestrator.buffer.subscribe();
    tracing::info!(%client_id, "push subscriber connected");

    let welcome = json!({ "msg_type": "connected", "client_id": client_id });
    if socket.send(Message::Text(welcome.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            verdict = verdicts.recv() => {
                match verdict {
                    Ok(verdict) => {
                        let frame = json!({ "msg_type": "verdict", "data": verdict });
                        if socket.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        context.orchestrator.stats.record_push_lagged(n);
                        tracing::warn!(%client_id, dropped = n, "push subscriber lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.contains("ping") {
                            let pong = json!({ "msg_type": "pong" });
                            let _ = socket.send(Message::Text(pong.to_string())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::info!(%client_id, "push subscriber disconnected");
}
