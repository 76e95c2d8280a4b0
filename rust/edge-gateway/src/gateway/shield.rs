//! Shield decision oracle.
//!
//! The admission filter asks an oracle whether a request looks like abuse.
//! The oracle is a trait so a vendor-backed implementation can replace
//! [`HeuristicShield`], the built-in default.

use std::fmt;
use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Serialize;

use crate::config::ShieldConfig;

/// What the oracle is shown about a request.
#[derive(Debug, Clone)]
pub struct ShieldRequest {
    pub method: String,
    pub path: String,
    pub ip: String,
    pub user_agent: Option<String>,
}

/// Oracle verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldDecision {
    Allow,
    RateLimited,
    BotDetected,
    ShieldedDeny,
}

impl ShieldDecision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::RateLimited => "rate_limited",
            Self::BotDetected => "bot_detected",
            Self::ShieldedDeny => "shielded_deny",
        }
    }
}

impl fmt::Display for ShieldDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Oracle failure.
#[derive(Debug, thiserror::Error)]
pub enum ShieldError {
    #[error("shield decision timed out after {0} ms")]
    Timeout(u64),
    #[error("shield decision failed: {0}")]
    Failed(String),
}

/// A pluggable bot/abuse decision oracle.
#[async_trait]
pub trait ShieldOracle: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn decide(&self, request: &ShieldRequest) -> Result<ShieldDecision, ShieldError>;
}

/// Crawlers that are welcome even though they self-identify as bots.
const ALLOWED_CRAWLERS: &[&str] = &[
    "googlebot",
    "bingbot",
    "duckduckbot",
    "yandexbot",
    "baiduspider",
    "applebot",
    "slurp",
];

const BOT_SIGNATURES: &[&str] = &[
    "bot", "crawler", "spider", "scraper", "curl/", "wget/", "python-requests", "python-urllib",
    "go-http-client", "java/", "libwww", "httpclient", "headless", "phantomjs", "selenium",
    "scrapy", "masscan", "nikto", "sqlmap", "zgrab", "nmap",
];

const ATTACK_PATHS: &[&str] = &[
    "/.env",
    "/.git",
    "/wp-admin",
    "/wp-login",
    "/xmlrpc.php",
    "/phpmyadmin",
    "/cgi-bin",
    "/etc/passwd",
    "/.aws",
    "/server-status",
    "../",
    "..%2f",
    "%2e%2e",
];

/// Default oracle: user-agent and path heuristics plus a per-IP GCRA limiter.
#[derive(Debug)]
pub struct HeuristicShield {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl HeuristicShield {
    #[must_use]
    pub fn new(config: &ShieldConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
        }
    }

    /// Drop limiter state for addresses that have gone quiet.
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
    }

    fn classify_user_agent(user_agent: Option<&str>) -> ShieldDecision {
        let ua = user_agent.map(str::trim).unwrap_or_default().to_lowercase();
        if ua.is_empty() {
            return ShieldDecision::BotDetected;
        }
        if ALLOWED_CRAWLERS.iter().any(|c| ua.contains(c)) {
            return ShieldDecision::Allow;
        }
        if BOT_SIGNATURES.iter().any(|s| ua.contains(s)) {
            return ShieldDecision::BotDetected;
        }
        ShieldDecision::Allow
    }

    fn is_attack_path(path: &str) -> bool {
        let path = path.to_lowercase();
        ATTACK_PATHS.iter().any(|p| path.contains(p))
    }
}

#[async_trait]
impl ShieldOracle for HeuristicShield {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn decide(&self, request: &ShieldRequest) -> Result<ShieldDecision, ShieldError> {
        if Self::is_attack_path(&request.path) {
            return Ok(ShieldDecision::ShieldedDeny);
        }

        let verdict = Self::classify_user_agent(request.user_agent.as_deref());
        if !verdict.is_allowed() {
            return Ok(verdict);
        }

        if self.limiter.check_key(&request.ip).is_err() {
            return Ok(ShieldDecision::RateLimited);
        }

        Ok(ShieldDecision::Allow)
    }
}
