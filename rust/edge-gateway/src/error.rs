//! Gateway error taxonomy and the single place errors become HTTP responses.
//!
//! Every failure a request can hit is one of the [`GatewayError`] variants.
//! [`GatewayError::render`] matches them exhaustively against an
//! [`ErrorPolicy`], which captures the development/production asymmetry:
//! verbose JSON reasons while developing, silent redirects when public-facing.

use std::fmt;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::config::AppConfig;
use crate::gateway::cache::CacheError;
use crate::gateway::rate_limit::{RateDecision, RateLimitError};

/// Seconds advertised in `Retry-After` when the upstream is unreachable.
pub const UPSTREAM_RETRY_AFTER_SECS: u64 = 30;

/// Machine-readable authentication failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    MissingApiKey,
    InvalidApiKey,
    MissingSession,
    InvalidToken,
    SessionNotFound,
    SessionExpired,
    IpMismatch,
    IpNotWhitelisted,
    InvalidPassword,
}

impl AuthFailure {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "missing_api_key",
            Self::InvalidApiKey => "invalid_api_key",
            Self::MissingSession => "missing_session",
            Self::InvalidToken => "invalid_token",
            Self::SessionNotFound => "session_not_found",
            Self::SessionExpired => "session_expired",
            Self::IpMismatch => "ip_mismatch",
            Self::IpNotWhitelisted => "ip_not_whitelisted",
            Self::InvalidPassword => "invalid_password",
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "API key is required",
            Self::InvalidApiKey => "API key is invalid",
            Self::MissingSession => "Admin session token is required",
            Self::InvalidToken => "Session token failed verification",
            Self::SessionNotFound => "Session is not active",
            Self::SessionExpired => "Session has expired",
            Self::IpMismatch => "Session was issued to a different address",
            Self::IpNotWhitelisted => "Address is not allowed to access admin endpoints",
            Self::InvalidPassword => "Invalid credentials",
        }
    }

    /// Status used in verbose mode.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::IpNotWhitelisted => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the upstream could not produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// Connection refused, reset or DNS failure.
    Connect,
    /// Connect or response deadline exceeded.
    Timeout,
    /// The circuit breaker is failing fast.
    CircuitOpen,
    /// Anything else: malformed response, body read error.
    Protocol,
}

impl UpstreamFailure {
    /// Operational code; only ever sent to clients in verbose mode.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Connect => "UPSTREAM_CONNECT",
            Self::Timeout => "UPSTREAM_TIMEOUT",
            Self::CircuitOpen => "UPSTREAM_CIRCUIT_OPEN",
            Self::Protocol => "UPSTREAM_PROTOCOL",
        }
    }

    /// Transient connectivity is 503; everything else is 502.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Connect | Self::Timeout | Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::Protocol => StatusCode::BAD_GATEWAY,
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Every way a request can fail inside the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The shield oracle (or its failure policy) refused the request.
    #[error("admission denied: {reason}")]
    AdmissionDenied { reason: String },

    /// A rate bucket is exhausted.
    #[error("rate limit exceeded")]
    RateLimited(RateDecision),

    /// API-key or admin-session authentication failed.
    #[error("authentication failed: {0}")]
    AuthFailed(AuthFailure),

    /// The upstream could not be reached or answered garbage.
    #[error("upstream unavailable ({kind}): {detail}")]
    UpstreamUnavailable { kind: UpstreamFailure, detail: String },

    /// The upstream's direct-access guard answered 403.
    #[error("upstream rejected the request")]
    UpstreamRejected,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<AuthFailure> for GatewayError {
    fn from(failure: AuthFailure) -> Self {
        Self::AuthFailed(failure)
    }
}

/// How errors are surfaced to clients.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    /// Expose machine-readable reasons and upstream codes.
    pub verbose: bool,
    /// Target for admission redirects.
    pub safe_redirect_url: String,
    /// Target for auth and upstream-403 redirects in production.
    pub public_site_url: String,
}

impl ErrorPolicy {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            verbose: config.deployment.is_verbose(),
            safe_redirect_url: config.safe_redirect_url().to_string(),
            public_site_url: config.gateway.public_site_url.clone(),
        }
    }
}

impl GatewayError {
    /// Turn the error into the response a client is allowed to see.
    pub fn render(self, policy: &ErrorPolicy) -> Response {
        match self {
            Self::AdmissionDenied { .. } => found(&policy.safe_redirect_url),
            Self::RateLimited(decision) => RateLimitError::from_decision(decision).into_response(),
            Self::AuthFailed(failure) => {
                if policy.verbose {
                    let error = if failure.status() == StatusCode::FORBIDDEN {
                        "forbidden"
                    } else {
                        "unauthorized"
                    };
                    (
                        failure.status(),
                        Json(json!({
                            "error": error,
                            "reason": failure.as_str(),
                            "message": failure.message(),
                            "timestamp": timestamp(),
                        })),
                    )
                        .into_response()
                } else {
                    found(&policy.public_site_url)
                }
            }
            Self::UpstreamUnavailable { kind, .. } => {
                let status = kind.status();
                let mut body = json!({
                    "error": if status == StatusCode::BAD_GATEWAY { "bad_gateway" } else { "service_unavailable" },
                    "message": "The service is temporarily unavailable. Please try again later.",
                    "timestamp": timestamp(),
                });
                if policy.verbose {
                    body["code"] = json!(kind.code());
                }
                let mut response = (status, Json(body)).into_response();
                if status == StatusCode::SERVICE_UNAVAILABLE {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from(UPSTREAM_RETRY_AFTER_SECS));
                }
                response
            }
            Self::UpstreamRejected => found(&policy.public_site_url),
            Self::Cache(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "message": "An internal error occurred",
                    "timestamp": timestamp(),
                })),
            )
                .into_response(),
        }
    }
}

/// `302 Found` pointing at `url`.
pub fn found(url: &str) -> Response {
    let location = HeaderValue::from_str(url).unwrap_or_else(|_| HeaderValue::from_static("/"));
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(verbose: bool) -> ErrorPolicy {
        ErrorPolicy {
            verbose,
            safe_redirect_url: "https://example.com/safe".to_string(),
            public_site_url: "https://example.com".to_string(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_admission_denial_redirects_to_safe_url() {
        let response = GatewayError::AdmissionDenied {
            reason: "bot".to_string(),
        }
        .render(&policy(true));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "https://example.com/safe");
    }

    #[tokio::test]
    async fn test_auth_failure_is_verbose_in_development() {
        let response = GatewayError::AuthFailed(AuthFailure::InvalidApiKey).render(&policy(true));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["reason"], "invalid_api_key");
        assert!(body["timestamp"].is_string());
    }

    #[test]
    fn test_auth_failure_redirects_in_production() {
        let response = GatewayError::AuthFailed(AuthFailure::MissingApiKey).render(&policy(false));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "https://example.com");
    }

    #[tokio::test]
    async fn test_upstream_code_hidden_in_production() {
        let err = || GatewayError::UpstreamUnavailable {
            kind: UpstreamFailure::Connect,
            detail: "connection refused (10.0.0.3:5000)".to_string(),
        };

        let response = err().render(&policy(false));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
        let body = body_json(response).await;
        assert!(body.get("code").is_none());
        assert!(!body.to_string().contains("10.0.0.3"));

        let body = body_json(err().render(&policy(true))).await;
        assert_eq!(body["code"], "UPSTREAM_CONNECT");
    }

    #[test]
    fn test_protocol_failure_is_bad_gateway() {
        let response = GatewayError::UpstreamUnavailable {
            kind: UpstreamFailure::Protocol,
            detail: "bad body".to_string(),
        }
        .render(&policy(true));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_rate_limited_renders_429() {
        let response = GatewayError::RateLimited(RateDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_after: Duration::from_secs(10),
        })
        .render(&policy(false));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "10");
    }

    #[test]
    fn test_upstream_rejection_redirects() {
        let response = GatewayError::UpstreamRejected.render(&policy(true));
        assert_eq!(response.status(), StatusCode::FOUND);
    }
}
