//! HTTP server setup, middleware and background maintenance.

use std::time::Duration;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::config::{AdmissionMode, AppConfig, CorsConfig};
use crate::gateway::{self, admission, compression, proxy};
use crate::logging::OpTimer;
use crate::monitor;
use crate::{AppState, log_banner, log_init_step, log_init_warning, log_success};

/// Edge gateway version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Interval of the session/cache/bucket sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Create the application with all routes and middleware.
///
/// Returns the state as well so the caller can start [`spawn_maintenance`].
pub fn create_app(config: AppConfig) -> anyhow::Result<(Router, AppState)> {
    let overall_timer = OpTimer::new("server", "create_app");

    log_banner!(
        format!("🛡️  Edge Gateway v{VERSION}"),
        format!(
            "Environment: {} | Admission: {}",
            config.deployment.environment, config.deployment.admission_mode
        )
    );

    // [1/4] Upstream
    let step_timer = OpTimer::new("server", "upstream");
    let upstream = config.upstream.url.clone().unwrap_or_default();
    log_init_step!(
        1,
        4,
        "Upstream",
        format!(
            "🔗 {upstream} (timeout {}s, connect {}s)",
            config.upstream.timeout_secs, config.upstream.connect_timeout_secs
        )
    );
    step_timer.finish();

    // [2/4] Registries
    let step_timer = OpTimer::new("server", "state");
    let state = AppState::new(config);
    step_timer.finish_with_result(state.as_ref());
    let state = state?;
    log_init_step!(
        2,
        4,
        "Registries",
        format!(
            "🔐 sessions ttl={}s | 💾 cache {} entries ttl={}s",
            state.config.admin.session_ttl_secs, state.config.cache.max_entries, state.config.cache.ttl_secs
        )
    );

    // [3/4] Admission
    let step_timer = OpTimer::new("server", "admission");
    log_init_step!(
        3,
        4,
        "Admission",
        format!(
            "🚦 mode={} oracle={} limits admin/frontend/public={}/{}/{} per {}s",
            state.admission.mode(),
            state.admission.oracle().name(),
            state.config.rate_limit.admin,
            state.config.rate_limit.frontend,
            state.config.rate_limit.public,
            state.config.rate_limit.window_secs
        )
    );
    if state.config.deployment.is_production() && state.admission.mode() != AdmissionMode::Enforce {
        log_init_warning!(
            "Admission mode is {} in production; shield denials are not enforced",
            state.admission.mode()
        );
    }
    step_timer.finish();

    // [4/4] Router
    let step_timer = OpTimer::new("server", "router");
    let app = build_router(state.clone());
    log_init_step!(4, 4, "Router", "🌐 Routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("Edge gateway created successfully");

    Ok((app, state))
}

/// Assemble routes and middleware around an existing state.
///
/// Request order through the layers: trace, CORS, timeout, metrics,
/// admission, compression, then either a local route or the proxy fallback.
pub fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        .merge(api::create_router(&state))
        .merge(gateway::create_router())
        .fallback(proxy::proxy_handler);

    routes
        .layer(middleware::from_fn_with_state(
            state.clone(),
            compression::compression_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admission::admission_middleware,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), monitor::track_requests))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(state.config.server.timeout_secs),
        ))
        .layer(cors_layer(&state.config.cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS policy from configuration. A `*` entry allows any value; credentials
/// are only allowed when every list is explicit.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let wildcard = |list: &[String]| list.iter().any(|v| v.trim() == "*");
    let mut layer = CorsLayer::new();

    layer = if wildcard(&config.allowed_origins) {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o.trim()).ok())
            .collect();
        layer.allow_origin(origins)
    };

    layer = if wildcard(&config.allowed_methods) {
        layer.allow_methods(Any)
    } else {
        let methods: Vec<Method> = config
            .allowed_methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
            .collect();
        layer.allow_methods(methods)
    };

    layer = if wildcard(&config.allowed_headers) {
        layer.allow_headers(Any)
    } else {
        let headers: Vec<HeaderName> = config
            .allowed_headers
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.trim().as_bytes()).ok())
            .collect();
        layer.allow_headers(headers)
    };

    let explicit = !wildcard(&config.allowed_origins)
        && !wildcard(&config.allowed_methods)
        && !wildcard(&config.allowed_headers);
    layer.allow_credentials(explicit)
}

/// Start the periodic sweep and resource poll.
///
/// The returned handles are aborted by the caller on shutdown.
pub fn spawn_maintenance(state: &AppState) -> Vec<JoinHandle<()>> {
    let sweep_state = state.clone();
    let sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_sweep(&sweep_state);
        }
    });

    let poll_state = state.clone();
    let poll_interval = Duration::from_secs(state.config.monitor.poll_interval_secs.max(1));
    let poll = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            poll_state.monitor.poll_resources();
        }
    });

    vec![sweep, poll]
}

/// One maintenance pass over every TTL-bound store.
pub fn run_sweep(state: &AppState) {
    let sessions = state.sessions.sweep();
    let cache = state.cache.sweep_expired();
    let buckets = state
        .rate_buckets
        .sweep(state.config.rate_limit.window().max(admission::BURST_WINDOW));
    if let Some(shield) = &state.shield {
        shield.retain_recent();
    }
    tracing::debug!(
        sessions_removed = sessions,
        cache_expired = cache,
        buckets_removed = buckets,
        "Maintenance sweep complete"
    );
}
