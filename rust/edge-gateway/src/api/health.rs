//! Gateway self-health endpoint.
//!
//! Served locally, ahead of admission and authentication, so load balancers
//! can probe the gateway without counting against any rate bucket.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::AppState;
use crate::config::Environment;
use crate::gateway::circuit_breaker::BreakerState;

/// Reserved path for the gateway's own health check.
pub const HEALTH_PATH: &str = "/gateway/health";

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health_check))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub environment: Environment,
    /// Upstream circuit breaker state.
    pub upstream: BreakerState,
    pub uptime_secs: u64,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let upstream = state.proxy.breaker().state();
    Json(HealthResponse {
        status: if upstream == BreakerState::Open { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.deployment.environment,
        upstream,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
