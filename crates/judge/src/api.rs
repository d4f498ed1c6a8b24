//! HTTP API: health, metrics, sample ingest and event draining

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use judge_lib::{
    cluster::RingHandle,
    datasource::{validate_point, DataSource},
    health::HealthRegistry,
    judge::{JudgeCore, PullRuleManager, PushJudge},
    models::{AlertEvent, MetricPoint},
    observability::JudgeMetrics,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default number of events returned by one drain
const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 10_000;

/// Shared application state
pub struct AppState {
    pub health: HealthRegistry,
    pub metrics: JudgeMetrics,
    pub source: Arc<dyn DataSource>,
    pub core: JudgeCore,
    pub push_judge: PushJudge,
    pub pull_manager: Arc<PullRuleManager>,
    pub ring: RingHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub datasource: String,
    pub write_queue: usize,
    pub cached_series: usize,
    pub event_queue: usize,
    pub event_states: usize,
    pub push_rules: usize,
    pub pull_rules: usize,
    pub invalid_rules: usize,
    pub indexed_metrics: usize,
    pub rules_version: i64,
    pub pull_evaluators: usize,
    pub ring_members: Vec<String>,
    pub push_workers: usize,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.health().await;

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Ingest a batch: enqueue for remote write, then feed the PUSH judge.
///
/// Never fails because the backend or the judge is behind.
async fn push(
    State(state): State<Arc<AppState>>,
    Json(points): Json<Vec<MetricPoint>>,
) -> impl IntoResponse {
    let stats = state.source.push_to_queue(&points);

    for point in points {
        if validate_point(&point).is_ok() {
            state.push_judge.submit(point);
        }
    }

    Json(PushResponse {
        accepted: stats.accepted,
        rejected: stats.invalid,
        dropped: stats.dropped,
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let index = state.core.index().stats();
    let pull_evaluators = state.pull_manager.active_count();
    state.metrics.set_pull_evaluators(pull_evaluators);

    Json(StatsResponse {
        datasource: state.source.name().to_string(),
        write_queue: state.source.queue_len(),
        cached_series: state.core.cache().series_count(),
        event_queue: state.core.store().queue_len(),
        event_states: state.core.store().state_len(),
        push_rules: index.push_rules,
        pull_rules: index.pull_rules,
        invalid_rules: index.invalid_rules,
        indexed_metrics: index.metrics,
        rules_version: state.core.index().last_sync(),
        pull_evaluators,
        ring_members: state.ring.members(),
        push_workers: state.push_judge.worker_count(),
    })
}

/// Drain up to `limit` pending events, oldest first
async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<AlertEvent>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    Json(state.core.store().drain(limit))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/push", post(push))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/events", get(events))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}
