//! Admission filter: the first stage every request passes through.
//!
//! Order of checks:
//! 1. Gateway health path bypasses everything.
//! 2. `disabled` mode allows without consulting the oracle.
//! 3. Shield oracle (skipped for platform-internal callers), bounded by a timeout.
//! 4. Per-IP burst bucket, then the tier bucket.
//!
//! In `dry-run` mode every check still runs and is logged, but nothing blocks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, header::USER_AGENT},
    middleware::Next,
    response::Response,
};

use super::auth::{AuthTier, has_admin_session, presented_api_key, secrets_match};
use super::ip::{ClientIp, IpClass};
use super::rate_limit::{RateBucketStore, RateDecision};
use super::shield::{ShieldDecision, ShieldOracle, ShieldRequest};
use crate::AppState;
use crate::api::health::HEALTH_PATH;
use crate::config::{AdmissionMode, AppConfig, RateLimitConfig};
use crate::error::GatewayError;

/// Length of the burst window.
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Everything the filter needs to know about one request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub method: String,
    pub path: String,
    pub ip: String,
    pub ip_class: IpClass,
    pub user_agent: Option<String>,
    pub tier: AuthTier,
    /// Rate bucket key: `key_<prefix>` or `ip_<ip>`.
    pub bucket_key: String,
}

/// Admission filter.
#[derive(Debug)]
pub struct AdmissionFilter {
    oracle: Arc<dyn ShieldOracle>,
    buckets: Arc<RateBucketStore>,
    mode: AdmissionMode,
    fail_closed: bool,
    oracle_timeout: Duration,
    limits: RateLimitConfig,
}

impl AdmissionFilter {
    #[must_use]
    pub fn new(config: &AppConfig, oracle: Arc<dyn ShieldOracle>, buckets: Arc<RateBucketStore>) -> Self {
        Self {
            oracle,
            buckets,
            mode: config.deployment.admission_mode,
            fail_closed: config.deployment.is_production(),
            oracle_timeout: Duration::from_millis(config.shield.timeout_ms),
            limits: config.rate_limit.clone(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    #[must_use]
    pub fn oracle(&self) -> &Arc<dyn ShieldOracle> {
        &self.oracle
    }

    /// Ceiling for a tier.
    #[must_use]
    pub fn limit_for(&self, tier: AuthTier) -> u32 {
        match tier {
            AuthTier::Admin => self.limits.admin,
            AuthTier::Frontend => self.limits.frontend,
            AuthTier::Public => self.limits.public,
        }
    }

    /// Decide whether a request may proceed.
    ///
    /// `Ok(Some(decision))` carries the tier bucket state for the
    /// `x-ratelimit-*` headers; `Ok(None)` means the filter was bypassed.
    pub async fn admit(&self, req: &AdmissionRequest) -> Result<Option<RateDecision>, GatewayError> {
        if req.path == HEALTH_PATH || self.mode == AdmissionMode::Disabled {
            return Ok(None);
        }
        let dry_run = self.mode == AdmissionMode::DryRun;

        if req.ip_class != IpClass::Platform {
            self.consult_oracle(req, dry_run).await?;
        }

        let burst = self.buckets.check(
            &format!("burst_{}", req.ip),
            self.limits.burst_per_second,
            BURST_WINDOW,
        );
        if !burst.allowed {
            tracing::warn!(
                ip = %req.ip,
                path = %req.path,
                reason = "burst_limit",
                dry_run = dry_run,
                "Request rate limited"
            );
            if !dry_run {
                return Err(GatewayError::RateLimited(burst));
            }
        }

        let decision = self
            .buckets
            .check(&req.bucket_key, self.limit_for(req.tier), self.limits.window());
        if !decision.allowed {
            tracing::warn!(
                ip = %req.ip,
                path = %req.path,
                key = %req.bucket_key,
                tier = req.tier.as_str(),
                reason = "rate_limit",
                dry_run = dry_run,
                "Request rate limited"
            );
            if !dry_run {
                return Err(GatewayError::RateLimited(decision));
            }
        }

        Ok(Some(decision))
    }

    async fn consult_oracle(&self, req: &AdmissionRequest, dry_run: bool) -> Result<(), GatewayError> {
        let shield_request = ShieldRequest {
            method: req.method.clone(),
            path: req.path.clone(),
            ip: req.ip.clone(),
            user_agent: req.user_agent.clone(),
        };

        let timeout_ms = u64::try_from(self.oracle_timeout.as_millis()).unwrap_or(u64::MAX);
        let verdict = tokio::time::timeout(self.oracle_timeout, self.oracle.decide(&shield_request))
            .await
            .unwrap_or(Err(super::shield::ShieldError::Timeout(timeout_ms)));

        match verdict {
            Ok(ShieldDecision::Allow) => Ok(()),
            Ok(denial) => {
                tracing::warn!(
                    ip = %req.ip,
                    path = %req.path,
                    reason = denial.as_str(),
                    oracle = self.oracle.name(),
                    dry_run = dry_run,
                    "Request denied by shield"
                );
                if dry_run {
                    Ok(())
                } else {
                    Err(GatewayError::AdmissionDenied {
                        reason: denial.as_str().to_string(),
                    })
                }
            }
            Err(e) if self.fail_closed && !dry_run => {
                tracing::warn!(ip = %req.ip, path = %req.path, error = %e, "Shield unavailable, failing closed");
                Err(GatewayError::AdmissionDenied {
                    reason: "shield_unavailable".to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(ip = %req.ip, path = %req.path, error = %e, dry_run = dry_run, "Shield unavailable, failing open");
                Ok(())
            }
        }
    }
}

/// Tier and bucket key for a request.
///
/// A valid API key selects the frontend tier; a session that passes every
/// admin check selects the admin tier; everything else is public.
pub fn classify_tier(state: &AppState, headers: &HeaderMap, ip: &str) -> (AuthTier, String) {
    if let (Some(presented), Some(expected)) =
        (presented_api_key(headers), state.config.gateway.api_key.as_deref())
        && secrets_match(presented, expected)
    {
        let prefix: String = presented.chars().take(8).collect();
        return (AuthTier::Frontend, format!("key_{prefix}"));
    }

    if has_admin_session(state, headers, ip) {
        return (AuthTier::Admin, format!("ip_{ip}"));
    }

    (AuthTier::Public, format!("ip_{ip}"))
}

/// Admission middleware. Resolves the client address once and stores it as a
/// [`ClientIp`] extension for every later stage.
pub async fn admission_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = state.ip_classifier.client_ip(req.headers(), peer);
    req.extensions_mut().insert(ClientIp(ip.clone()));

    let (tier, bucket_key) = classify_tier(&state, req.headers(), &ip);
    let admission = AdmissionRequest {
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        ip_class: state.ip_classifier.classify(&ip),
        ip,
        user_agent: req
            .headers()
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
        tier,
        bucket_key,
    };

    match state.admission.admit(&admission).await {
        Ok(decision) => {
            let mut response = next.run(req).await;
            if let Some(decision) = decision {
                decision.apply_headers(response.headers_mut());
            }
            response
        }
        Err(e) => e.render(&state.error_policy()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::Environment;
    use crate::gateway::shield::ShieldError;

    #[derive(Debug)]
    struct FixedShield {
        verdict: Result<ShieldDecision, &'static str>,
        calls: AtomicUsize,
    }

    impl FixedShield {
        fn new(verdict: Result<ShieldDecision, &'static str>) -> Arc<Self> {
            Arc::new(Self {
                verdict,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ShieldOracle for FixedShield {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn decide(&self, _request: &ShieldRequest) -> Result<ShieldDecision, ShieldError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.map_err(|e| ShieldError::Failed(e.to_string()))
        }
    }

    #[derive(Debug)]
    struct SlowShield;

    #[async_trait]
    impl ShieldOracle for SlowShield {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn decide(&self, _request: &ShieldRequest) -> Result<ShieldDecision, ShieldError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ShieldDecision::Allow)
        }
    }

    fn filter(mode: AdmissionMode, env: Environment, oracle: Arc<dyn ShieldOracle>) -> AdmissionFilter {
        let mut config = AppConfig::default();
        config.deployment.admission_mode = mode;
        config.deployment.environment = env;
        config.rate_limit.public = 5;
        config.rate_limit.window_secs = 60;
        config.shield.timeout_ms = 50;
        AdmissionFilter::new(&config, oracle, Arc::new(RateBucketStore::new()))
    }

    fn request(path: &str, class: IpClass) -> AdmissionRequest {
        AdmissionRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            ip: "1.2.3.4".to_string(),
            ip_class: class,
            user_agent: Some("curl/8.0".to_string()),
            tier: AuthTier::Public,
            bucket_key: "ip_1.2.3.4".to_string(),
        }
    }

    #[tokio::test]
    async fn test_disabled_mode_never_calls_oracle() {
        let shield = FixedShield::new(Ok(ShieldDecision::BotDetected));
        let filter = filter(AdmissionMode::Disabled, Environment::Development, Arc::<FixedShield>::clone(&shield));
        for _ in 0..10 {
            assert!(filter.admit(&request("/api/x", IpClass::External)).await.unwrap().is_none());
        }
        assert_eq!(shield.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_path_bypasses() {
        let shield = FixedShield::new(Ok(ShieldDecision::ShieldedDeny));
        let filter = filter(AdmissionMode::Enforce, Environment::Production, Arc::<FixedShield>::clone(&shield));
        assert!(filter.admit(&request(HEALTH_PATH, IpClass::External)).await.unwrap().is_none());
        assert_eq!(shield.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denial_enforced() {
        let filter = filter(
            AdmissionMode::Enforce,
            Environment::Development,
            FixedShield::new(Ok(ShieldDecision::BotDetected)),
        );
        let err = filter.admit(&request("/api/x", IpClass::External)).await.unwrap_err();
        assert!(matches!(err, GatewayError::AdmissionDenied { ref reason } if reason == "bot_detected"));
    }

    #[tokio::test]
    async fn test_dry_run_logs_but_allows() {
        let filter = filter(
            AdmissionMode::DryRun,
            Environment::Production,
            FixedShield::new(Ok(ShieldDecision::ShieldedDeny)),
        );
        for _ in 0..8 {
            assert!(filter.admit(&request("/api/x", IpClass::External)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_oracle_error_fails_open_in_development_closed_in_production() {
        let dev = filter(AdmissionMode::Enforce, Environment::Development, FixedShield::new(Err("down")));
        assert!(dev.admit(&request("/api/x", IpClass::External)).await.is_ok());

        let prod = filter(AdmissionMode::Enforce, Environment::Production, FixedShield::new(Err("down")));
        let err = prod.admit(&request("/api/x", IpClass::External)).await.unwrap_err();
        assert!(matches!(err, GatewayError::AdmissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_oracle_timeout_counts_as_error() {
        let prod = filter(AdmissionMode::Enforce, Environment::Production, Arc::new(SlowShield));
        let err = prod.admit(&request("/api/x", IpClass::External)).await.unwrap_err();
        assert!(matches!(err, GatewayError::AdmissionDenied { ref reason } if reason == "shield_unavailable"));
    }

    #[tokio::test]
    async fn test_platform_callers_skip_oracle_but_are_rate_limited() {
        let shield = FixedShield::new(Ok(ShieldDecision::BotDetected));
        let filter = filter(AdmissionMode::Enforce, Environment::Production, Arc::<FixedShield>::clone(&shield));

        for _ in 0..5 {
            assert!(filter.admit(&request("/api/x", IpClass::Platform)).await.is_ok());
        }
        let err = filter.admit(&request("/api/x", IpClass::Platform)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited(_)));
        assert_eq!(shield.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tier_limit_applies_with_remaining_count() {
        let filter = filter(
            AdmissionMode::Enforce,
            Environment::Development,
            FixedShield::new(Ok(ShieldDecision::Allow)),
        );
        let first = filter
            .admit(&request("/api/x", IpClass::External))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.limit, 5);
        assert_eq!(first.remaining, 4);
    }
}
