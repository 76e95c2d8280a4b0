//! Edge Gateway - public front door for a private API
//!
//! This crate sits between the public internet and a private upstream API and
//! provides:
//!
//! - **Admission control**: pluggable shield oracle plus per-tier and burst
//!   rate buckets, with dry-run and fail-open/fail-closed policies
//! - **Authentication**: service API keys and IP-bound admin sessions (JWT)
//! - **Reverse proxy**: header decoration, circuit breaker, 403 masking
//! - **Response cache**: tier-partitioned, ETag revalidation, LRU eviction
//! - **Compression**: gzip/deflate with size diagnostics
//! - **Performance monitor**: request samples, alerts and a health score
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`gateway`]: The request pipeline (admission, auth, cache, proxy)
//! - [`monitor`]: Request metrics, alerts and resource polling
//! - [`api`]: Gateway-local health and admin endpoints
//! - [`server`]: Router assembly and background maintenance
//!
//! # Example
//!
//! ```rust,ignore
//! use edge_gateway::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let (app, _state) = create_app(config)?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions, reason = "types are re-exported by module name")]
#![allow(clippy::missing_errors_doc, reason = "error types document their own variants")]

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod monitor;
pub mod server;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use config::AppConfig;
use error::ErrorPolicy;
use gateway::admission::AdmissionFilter;
use gateway::auth::JwtAuthority;
use gateway::cache::ResponseCache;
use gateway::ip::IpClassifier;
use gateway::proxy::GatewayProxy;
use gateway::rate_limit::RateBucketStore;
use gateway::sessions::SessionRegistry;
use gateway::shield::{HeuristicShield, ShieldOracle};
use monitor::PerformanceMonitor;

/// Application state shared across all handlers.
///
/// Every registry is constructed once here and injected through axum state;
/// nothing in the crate keeps process-global mutable state.
#[derive(Clone)]
pub struct AppState {
    /// Validated, immutable configuration.
    pub config: Arc<AppConfig>,
    /// Live admin sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Signs and verifies admin session tokens.
    pub jwt: Arc<JwtAuthority>,
    /// Whitelist / CDN / platform range matching.
    pub ip_classifier: Arc<IpClassifier>,
    /// Fixed-window counters. Only the admission filter increments them.
    pub rate_buckets: Arc<RateBucketStore>,
    pub admission: Arc<AdmissionFilter>,
    /// Default shield, kept for periodic limiter cleanup. `None` when a
    /// custom oracle was injected.
    pub shield: Option<Arc<HeuristicShield>>,
    pub cache: Arc<ResponseCache>,
    pub monitor: Arc<PerformanceMonitor>,
    pub proxy: Arc<GatewayProxy>,
    pub started_at: Instant,
}

impl AppState {
    /// Build state with the default heuristic shield.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let shield = Arc::new(HeuristicShield::new(&config.shield));
        let oracle: Arc<dyn ShieldOracle> = Arc::<HeuristicShield>::clone(&shield);
        let mut state = Self::with_shield(config, oracle)?;
        state.shield = Some(shield);
        Ok(state)
    }

    /// Build state around a caller-supplied shield oracle.
    pub fn with_shield(config: AppConfig, oracle: Arc<dyn ShieldOracle>) -> anyhow::Result<Self> {
        let jwt_secret = config
            .admin
            .jwt_secret
            .as_deref()
            .context("JWT_SECRET is required")?;

        let rate_buckets = Arc::new(RateBucketStore::new());
        let admission = AdmissionFilter::new(&config, oracle, Arc::clone(&rate_buckets));
        let ip_classifier = IpClassifier::new(
            config.admin.ip_whitelist.clone(),
            config.network.cdn_ranges.clone(),
            config.network.platform_ranges.clone(),
            config.network.trust_proxy,
        );
        let proxy = GatewayProxy::new(&config).context("Failed to build upstream client")?;

        Ok(Self {
            sessions: Arc::new(SessionRegistry::new(config.session_ttl())),
            jwt: Arc::new(JwtAuthority::new(jwt_secret)),
            ip_classifier: Arc::new(ip_classifier),
            rate_buckets,
            admission: Arc::new(admission),
            shield: None,
            cache: Arc::new(ResponseCache::new(&config.cache)),
            monitor: Arc::new(PerformanceMonitor::new(&config.monitor)),
            proxy: Arc::new(proxy),
            started_at: Instant::now(),
            config: Arc::new(config),
        })
    }

    /// How errors are rendered for the current deployment.
    pub fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::from_config(&self.config)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("environment", &self.config.deployment.environment)
            .field("upstream", &self.proxy.base_url())
            .field("sessions", &self.sessions.len())
            .field("cache_entries", &self.cache.len())
            .field("oracle", &self.admission.oracle().name())
            .finish_non_exhaustive()
    }
}
