//! Configuration management for the edge gateway.
//!
//! Configuration is assembled once at startup from defaults, optional config
//! files, `GATEWAY__*` environment variables and the well-known flat variables
//! (`PRIVATE_API_URL`, `GATEWAY_API_KEY`, ...). The result is validated by
//! [`ConfigValidator`] and then shared read-only.
//!
//! ```rust,ignore
//! use edge_gateway::config::AppConfig;
//!
//! let config = AppConfig::load()?; // fails listing every missing key
//! ```

pub mod deployment;
pub mod error;
pub mod validator;

pub use deployment::{AdmissionMode, DeploymentConfig, Environment};
pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cloudflare's published IPv4 edge ranges.
pub const DEFAULT_CDN_RANGES: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
];

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Environment and admission mode.
    #[serde(default)]
    pub deployment: DeploymentConfig,
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Private upstream API.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Service-to-service lane and redirect targets.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Admin session lane.
    #[serde(default)]
    pub admin: AdminConfig,
    /// Address ranges used for client-IP resolution and classification.
    #[serde(default)]
    pub network: NetworkConfig,
    /// CORS policy.
    #[serde(default)]
    pub cors: CorsConfig,
    /// Per-tier rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Default shield oracle tuning.
    #[serde(default)]
    pub shield: ShieldConfig,
    /// Response cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Performance monitor.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate configuration.
    ///
    /// Sources, lowest precedence first:
    /// 1. Default values
    /// 2. Config files (`config/edge-gateway.*`)
    /// 3. `GATEWAY__SECTION__KEY` environment variables
    /// 4. Flat environment variables (`PRIVATE_API_URL`, `JWT_SECRET`, ...)
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let layered = ::config::Config::builder()
            .add_source(::config::File::with_name("config/edge-gateway").required(false))
            .add_source(
                ::config::Environment::with_prefix("GATEWAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = layered.try_deserialize()?;
        app_config.deployment = DeploymentConfig::from_env();
        app_config.apply_env_overrides();

        Ok(app_config)
    }

    /// Apply the flat, well-known environment variables.
    fn apply_env_overrides(&mut self) {
        if let Some(url) = env_string("PRIVATE_API_URL") {
            self.upstream.url = Some(url);
        }
        if let Some(secs) = env_parse("UPSTREAM_TIMEOUT_SECS") {
            self.upstream.timeout_secs = secs;
        }
        if let Some(secs) = env_parse("UPSTREAM_CONNECT_TIMEOUT_SECS") {
            self.upstream.connect_timeout_secs = secs;
        }

        if let Some(key) = env_string("GATEWAY_API_KEY") {
            self.gateway.api_key = Some(key);
        }
        if let Some(url) = env_string("PUBLIC_SITE_URL") {
            self.gateway.public_site_url = url;
        }
        if let Some(url) = env_string("SAFE_REDIRECT_URL") {
            self.gateway.safe_redirect_url = Some(url);
        }
        if let Some(list) = env_list("PUBLIC_PATH_PREFIXES") {
            self.gateway.public_path_prefixes = list;
        }
        if let Some(prefix) = env_string("ADMIN_PATH_PREFIX") {
            self.gateway.admin_path_prefix = prefix;
        }

        if let Some(password) = env_string("ADMIN_PASSWORD") {
            self.admin.password = Some(password);
        }
        if let Some(secret) = env_string("JWT_SECRET") {
            self.admin.jwt_secret = Some(secret);
        }
        if let Some(secs) = env_parse("SESSION_TTL_SECS") {
            self.admin.session_ttl_secs = secs;
        }
        if let Some(list) = env_list("ADMIN_IP_WHITELIST") {
            self.admin.ip_whitelist = list;
        }

        if let Some(list) = env_list("CDN_IP_RANGES") {
            self.network.cdn_ranges = list;
        }
        if let Some(list) = env_list("PLATFORM_IP_RANGES") {
            self.network.platform_ranges = list;
        }
        if let Some(trust) = env_parse("TRUST_PROXY") {
            self.network.trust_proxy = trust;
        }

        if let Some(list) = env_list("CORS_ALLOWED_ORIGINS") {
            self.cors.allowed_origins = list;
        }
        if let Some(list) = env_list("CORS_ALLOWED_METHODS") {
            self.cors.allowed_methods = list;
        }
        if let Some(list) = env_list("CORS_ALLOWED_HEADERS") {
            self.cors.allowed_headers = list;
        }

        if let Some(secs) = env_parse("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = secs;
        }
        if let Some(limit) = env_parse("RATE_LIMIT_ADMIN") {
            self.rate_limit.admin = limit;
        }
        if let Some(limit) = env_parse("RATE_LIMIT_FRONTEND") {
            self.rate_limit.frontend = limit;
        }
        if let Some(limit) = env_parse("RATE_LIMIT_PUBLIC") {
            self.rate_limit.public = limit;
        }
        if let Some(limit) = env_parse("BURST_LIMIT_PER_SECOND") {
            self.rate_limit.burst_per_second = limit;
        }

        if let Some(secs) = env_parse("CACHE_TTL_SECS") {
            self.cache.ttl_secs = secs;
        }
        if let Some(max) = env_parse("CACHE_MAX_ENTRIES") {
            self.cache.max_entries = max;
        }

        if let Some(ms) = env_parse("SLOW_QUERY_THRESHOLD_MS") {
            self.monitor.slow_query_threshold_ms = ms;
        }

        if let Some(json) = env_parse("LOG_JSON") {
            self.logging.json = json;
        }
    }

    /// Where admission denials are sent.
    #[must_use]
    pub fn safe_redirect_url(&self) -> &str {
        self.gateway
            .safe_redirect_url
            .as_deref()
            .unwrap_or(&self.gateway.public_site_url)
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.admin.session_ttl_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment value");
            None
        }
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|raw| split_list(&raw))
}

/// Split a comma-separated list, dropping blanks.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whole-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    /// Largest request or response body the gateway buffers.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Private upstream API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the private API.
    pub url: Option<String>,
    /// Total response timeout in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Consecutive connectivity failures before the breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    /// Breaker cooldown in seconds.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_upstream_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown(),
        }
    }
}

/// Service lane and redirect configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Shared service-to-service key.
    pub api_key: Option<String>,
    /// Public marketing site; target for auth and upstream-403 redirects.
    #[serde(default = "default_public_site")]
    pub public_site_url: String,
    /// Landing page for admission denials. Defaults to the public site.
    pub safe_redirect_url: Option<String>,
    /// Proxied prefixes served without authentication.
    #[serde(default)]
    pub public_path_prefixes: Vec<String>,
    /// Proxied prefix that requires the admin session lane.
    #[serde(default = "default_admin_prefix")]
    pub admin_path_prefix: String,
}

fn default_public_site() -> String {
    "https://example.com".to_string()
}

fn default_admin_prefix() -> String {
    "/api/admin".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            public_site_url: default_public_site(),
            safe_redirect_url: None,
            public_path_prefixes: Vec::new(),
            admin_path_prefix: default_admin_prefix(),
        }
    }
}

/// Admin session lane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Plaintext password or an `$argon2…` PHC hash.
    pub password: Option<String>,
    /// HS256 signing secret for session tokens.
    pub jwt_secret: Option<String>,
    /// Session lifetime in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Addresses or CIDR ranges allowed to log in.
    #[serde(default = "default_whitelist")]
    pub ip_whitelist: Vec<String>,
}

fn default_session_ttl() -> u64 {
    600 // 10 minutes
}

fn default_whitelist() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            password: None,
            jwt_secret: None,
            session_ttl_secs: default_session_ttl(),
            ip_whitelist: default_whitelist(),
        }
    }
}

/// Network classification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// CDN / reverse-proxy edge ranges.
    #[serde(default = "default_cdn_ranges")]
    pub cdn_ranges: Vec<String>,
    /// Hosting platform internal ranges.
    #[serde(default = "default_platform_ranges")]
    pub platform_ranges: Vec<String>,
    /// Honour forwarding headers from any peer, not only CDN/platform hops.
    #[serde(default)]
    pub trust_proxy: bool,
}

fn default_cdn_ranges() -> Vec<String> {
    DEFAULT_CDN_RANGES.iter().map(|s| (*s).to_string()).collect()
}

fn default_platform_ranges() -> Vec<String> {
    vec![
        "10.0.0.0/8".to_string(),
        "172.16.0.0/12".to_string(),
        "192.168.0.0/16".to_string(),
    ]
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cdn_ranges: default_cdn_ranges(),
            platform_ranges: default_platform_ranges(),
            trust_proxy: false,
        }
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_cors_headers")]
    pub allowed_headers: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    ["content-type", "authorization", "x-api-key", "x-requested-with"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_origins(),
            allowed_methods: default_cors_methods(),
            allowed_headers: default_cors_headers(),
        }
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Fixed window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
    /// Ceiling for admin-session callers.
    #[serde(default = "default_admin_limit")]
    pub admin: u32,
    /// Ceiling for API-key callers.
    #[serde(default = "default_frontend_limit")]
    pub frontend: u32,
    /// Ceiling for anonymous callers.
    #[serde(default = "default_public_limit")]
    pub public: u32,
    /// Per-IP ceiling within any one second.
    #[serde(default = "default_burst")]
    pub burst_per_second: u32,
}

fn default_rate_window() -> u64 {
    900 // 15 minutes
}

fn default_admin_limit() -> u32 {
    1000
}

fn default_frontend_limit() -> u32 {
    500
}

fn default_public_limit() -> u32 {
    100
}

fn default_burst() -> u32 {
    20
}

impl RateLimitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window(),
            admin: default_admin_limit(),
            frontend: default_frontend_limit(),
            public: default_public_limit(),
            burst_per_second: default_burst(),
        }
    }
}

/// Tuning for the built-in heuristic shield.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Sustained per-IP request rate the shield tolerates.
    #[serde(default = "default_shield_rpm")]
    pub requests_per_minute: u32,
    /// Upper bound on one oracle decision.
    #[serde(default = "default_shield_timeout")]
    pub timeout_ms: u64,
}

fn default_shield_rpm() -> u32 {
    300
}

fn default_shield_timeout() -> u64 {
    2000
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_shield_rpm(),
            timeout_ms: default_shield_timeout(),
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// Largest payload admitted into the cache.
    #[serde(default = "default_cache_payload")]
    pub max_payload_bytes: usize,
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_entries() -> usize {
    1000
}

fn default_cache_payload() -> usize {
    1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
            max_payload_bytes: default_cache_payload(),
        }
    }
}

/// Performance monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_slow_threshold")]
    pub slow_query_threshold_ms: u64,
    /// Samples kept in the ring buffer.
    #[serde(default = "default_ring_capacity")]
    pub sample_capacity: usize,
    /// Resource polling interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_slow_threshold() -> u64 {
    1000
}

fn default_ring_capacity() -> usize {
    1000
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: default_slow_threshold(),
            sample_capacity: default_ring_capacity(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to use JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
