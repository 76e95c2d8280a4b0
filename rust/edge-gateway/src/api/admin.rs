//! Admin operations API.
//!
//! Every route here sits behind [`require_admin_session`], so callers must
//! present a live, IP-bound admin session.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /admin/metrics?window_ms=` | Realtime request stats |
//! | `GET /admin/health` | Monitor health score + upstream breaker |
//! | `GET /admin/alerts?limit=` | Recent alerts |
//! | `GET /admin/slow-queries` | Recent slow samples |
//! | `GET /admin/endpoints` | Per-endpoint aggregates |
//! | `GET /admin/cache/stats` | Response cache counters |
//! | `POST /admin/cache/invalidate` | Purge cache keys matching a regex |

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::GatewayError;
use crate::gateway::auth::require_admin_session;
use crate::gateway::cache::{CacheError, CacheStats};
use crate::gateway::circuit_breaker::BreakerSnapshot;
use crate::monitor::{Alert, EndpointStats, HealthStatus, MetricSample, RealtimeStats};

const DEFAULT_WINDOW_MS: u64 = 60_000;
const DEFAULT_ALERT_LIMIT: usize = 50;

/// Admin routes, guarded by the admin session lane.
pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/metrics", get(metrics))
        .route("/admin/health", get(health))
        .route("/admin/alerts", get(alerts))
        .route("/admin/slow-queries", get(slow_queries))
        .route("/admin/endpoints", get(endpoints))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/invalidate", post(invalidate_cache))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_session))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub window_ms: Option<u64>,
}

async fn metrics(State(state): State<AppState>, Query(query): Query<MetricsQuery>) -> Json<RealtimeStats> {
    let window = Duration::from_millis(query.window_ms.unwrap_or(DEFAULT_WINDOW_MS).max(1));
    Json(state.monitor.realtime_stats(window))
}

#[derive(Debug, Serialize)]
pub struct AdminHealth {
    #[serde(flatten)]
    pub health: HealthStatus,
    pub upstream: BreakerSnapshot,
}

async fn health(State(state): State<AppState>) -> Json<AdminHealth> {
    Json(AdminHealth {
        health: state.monitor.health_status(),
        upstream: state.proxy.breaker().snapshot(),
    })
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
}

async fn alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> Json<Vec<Alert>> {
    Json(state.monitor.alerts(query.limit.unwrap_or(DEFAULT_ALERT_LIMIT)))
}

async fn slow_queries(State(state): State<AppState>) -> Json<Vec<MetricSample>> {
    Json(state.monitor.slow_queries())
}

async fn endpoints(State(state): State<AppState>) -> Json<Vec<EndpointStats>> {
    Json(state.monitor.endpoint_stats())
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: String,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub invalidated: usize,
}

async fn invalidate_cache(State(state): State<AppState>, Json(req): Json<InvalidateRequest>) -> Response {
    match state.cache.invalidate_pattern(&req.pattern) {
        Ok(invalidated) => {
            tracing::info!(pattern = %req.pattern, invalidated, "Cache entries invalidated");
            Json(InvalidateResponse { invalidated }).into_response()
        }
        Err(e @ CacheError::InvalidPattern(_)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid_pattern", "message": e.to_string() })),
        )
            .into_response(),
        Err(e) => GatewayError::from(e).render(&state.error_policy()),
    }
}
