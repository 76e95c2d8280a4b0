//! Reverse proxy to the private upstream API.
//!
//! A request that reaches the fallback handler has already been admitted.
//! From there it runs a fixed pipeline:
//!
//! 1. authorize: public prefix, admin session lane or service API key
//! 2. cache lookup (GET only), answering HIT or 304 directly
//! 3. [`decorate_request`]: forwarding headers, original path kept verbatim
//! 4. [`GatewayProxy::forward`]: circuit breaker, timeouts, one retry for
//!    idempotent reads on connect errors
//! 5. [`decorate_response`]: upstream 403 becomes a redirect
//! 6. cache population on a cacheable MISS
//!
//! Failures from any step go through [`map_error`] and
//! [`GatewayError::render`]; clients never see upstream addresses.

use std::time::{Duration, Instant};

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::json;

use super::auth::{AuthTier, authenticate_admin, check_api_key};
use super::cache::{CacheEntry, CacheKey, is_cacheable_path};
use super::circuit_breaker::CircuitBreaker;
use super::headers::{ForwardingContext, decorate_upstream_headers, sanitize_response_headers};
use super::ip::ClientIp;
use crate::AppState;
use crate::config::AppConfig;
use crate::error::{AuthFailure, GatewayError, UpstreamFailure};

/// A request ready to leave the gateway.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A fully buffered upstream answer.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    fn content_type(&self) -> Option<String> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
    }

    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Upstream client plus the breaker guarding it.
#[derive(Debug)]
pub struct GatewayProxy {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    breaker: CircuitBreaker,
    max_body_bytes: usize,
}

impl GatewayProxy {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let base_url = config
            .upstream
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("PRIVATE_API_URL is not configured"))?
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
            .timeout(Duration::from_secs(config.upstream.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.gateway.api_key.clone(),
            breaker: CircuitBreaker::new(
                config.upstream.breaker_failure_threshold,
                Duration::from_secs(config.upstream.breaker_cooldown_secs),
            ),
            max_body_bytes: config.server.max_body_bytes,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Upstream URL for a path and query, path kept verbatim.
    #[must_use]
    pub fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{path_and_query}", self.base_url)
    }

    /// Send a request upstream and buffer the answer.
    pub async fn forward(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        if !self.breaker.try_acquire() {
            return Err(GatewayError::UpstreamUnavailable {
                kind: UpstreamFailure::CircuitOpen,
                detail: "circuit breaker open".to_string(),
            });
        }

        let idempotent = matches!(request.method, Method::GET | Method::HEAD);
        let mut retried = false;
        let response = loop {
            match self.send(request).await {
                Ok(response) => break response,
                Err(e) if idempotent && !retried && e.is_connect() => {
                    tracing::debug!(upstream = %request.target, error = %e, "Retrying upstream after connect error");
                    retried = true;
                }
                Err(e) => {
                    self.record_outcome(&e);
                    return Err(map_error(&e));
                }
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                self.record_outcome(&e);
                return Err(map_error(&e));
            }
        };
        self.breaker.record_success();

        Ok(UpstreamResponse { status, headers, body })
    }

    async fn send(&self, request: &UpstreamRequest) -> reqwest::Result<reqwest::Response> {
        self.client
            .request(request.method.clone(), &request.target)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await
    }

    fn record_outcome(&self, error: &reqwest::Error) {
        if error.is_connect() || error.is_timeout() {
            self.breaker.record_failure();
        } else {
            // The upstream answered, even if badly.
            self.breaker.record_success();
        }
    }
}

/// Step 3: build the upstream request from the inbound one.
#[must_use]
pub fn decorate_request(
    proxy: &GatewayProxy,
    parts: &Parts,
    body: Bytes,
    client_ip: &str,
    request_id: &str,
) -> UpstreamRequest {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);

    let original_host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let mut headers = parts.headers.clone();
    decorate_upstream_headers(
        &mut headers,
        &ForwardingContext {
            client_ip,
            request_id,
            original_host: original_host.as_deref(),
            api_key: proxy.api_key.as_deref(),
        },
    );

    UpstreamRequest {
        method: parts.method.clone(),
        target: proxy.target_url(&path_and_query),
        headers,
        body,
    }
}

/// Step 5: mask the upstream's direct-access guard and clean headers.
pub fn decorate_response(mut response: UpstreamResponse) -> Result<UpstreamResponse, GatewayError> {
    if response.status == StatusCode::FORBIDDEN {
        return Err(GatewayError::UpstreamRejected);
    }
    sanitize_response_headers(&mut response.headers);
    Ok(response)
}

/// Classify a transport error. Only the kind ever reaches clients.
#[must_use]
pub fn map_error(error: &reqwest::Error) -> GatewayError {
    let kind = if error.is_timeout() {
        UpstreamFailure::Timeout
    } else if error.is_connect() {
        UpstreamFailure::Connect
    } else {
        UpstreamFailure::Protocol
    };
    GatewayError::UpstreamUnavailable {
        kind,
        detail: error.to_string(),
    }
}

fn has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Step 1: pick the authentication lane for a proxied path.
pub fn authorize(state: &AppState, headers: &HeaderMap, path: &str, ip: &str) -> Result<AuthTier, AuthFailure> {
    let gateway = &state.config.gateway;

    if gateway
        .public_path_prefixes
        .iter()
        .any(|prefix| has_prefix(path, prefix))
    {
        return Ok(AuthTier::Public);
    }

    if has_prefix(path, &gateway.admin_path_prefix) {
        return authenticate_admin(state, headers, ip).map(|_| AuthTier::Admin);
    }

    let expected = gateway.api_key.as_deref().ok_or(AuthFailure::InvalidApiKey)?;
    check_api_key(headers, expected).map(|()| AuthTier::Frontend)
}

/// Whether any `If-None-Match` candidate names `etag`. Weak prefixes are ignored.
#[must_use]
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let etag = etag.trim_start_matches("W/");
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
}

fn cache_headers(response: &mut Response, etag: &str, status: &'static str, max_age: Duration) {
    let headers = response.headers_mut();
    if let Ok(etag) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, etag);
    }
    headers.insert("x-cache", HeaderValue::from_static(status));
    if let Ok(cc) = HeaderValue::from_str(&format!("max-age={}", max_age.as_secs())) {
        headers.insert(header::CACHE_CONTROL, cc);
    }
}

fn cached_response(entry: &CacheEntry, if_none_match: Option<&str>) -> Response {
    let remaining = entry.remaining_ttl(Instant::now());

    if if_none_match.is_some_and(|inm| etag_matches(inm, &entry.etag)) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        cache_headers(&mut response, &entry.etag, "HIT", remaining);
        return response;
    }

    let mut response = Response::new(Body::from(entry.payload.clone()));
    if let Some(ct) = entry
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    cache_headers(&mut response, &entry.etag, "HIT", remaining);
    response
}

/// Fallback handler: everything not served locally goes upstream.
pub async fn proxy_handler(State(state): State<AppState>, ClientIp(ip): ClientIp, req: Request) -> Response {
    let policy = state.error_policy();
    let path = req.uri().path().to_string();

    let tier = match authorize(&state, req.headers(), &path, &ip) {
        Ok(tier) => tier,
        Err(failure) => {
            tracing::debug!(ip = %ip, path = %path, reason = %failure, "Proxy request rejected");
            return GatewayError::AuthFailed(failure).render(&policy);
        }
    };

    let mut response = proxy_authorized(&state, req, tier, &ip).await;
    response.extensions_mut().insert(tier);
    response
}

async fn proxy_authorized(state: &AppState, req: Request, tier: AuthTier, ip: &str) -> Response {
    let policy = state.error_policy();
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let cache_key = (parts.method == Method::GET && is_cacheable_path(&path))
        .then(|| CacheKey::new(tier, parts.method.as_str(), &path, parts.uri.query()));
    let if_none_match = parts
        .headers
        .get(header::IF_NONE_MATCH)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    if let Some(key) = &cache_key
        && let Some(entry) = state.cache.get(key)
    {
        tracing::debug!(key = %key, "Cache hit");
        return cached_response(&entry, if_none_match.as_deref());
    }

    let body = match to_bytes(body, state.proxy.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "Rejected oversized request body");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(json!({ "error": "payload_too_large", "message": "Request body too large" })),
            )
                .into_response();
        }
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let upstream_request = decorate_request(&state.proxy, &parts, body, ip, &request_id);

    let upstream = match state.proxy.forward(&upstream_request).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::error!(
                path = %path,
                upstream = %upstream_request.target,
                request_id = %request_id,
                error = %e,
                "Proxy error"
            );
            return e.render(&policy);
        }
    };
    tracing::debug!(
        upstream = %upstream_request.target,
        status = upstream.status.as_u16(),
        request_id = %request_id,
        "Proxied request"
    );

    let upstream = match decorate_response(upstream) {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::info!(path = %path, ip = %ip, "Upstream blocked direct access, redirecting");
            return e.render(&policy);
        }
    };

    let cacheable = cache_key.is_some()
        && upstream.status == StatusCode::OK
        && !upstream.headers.contains_key(header::CONTENT_ENCODING);

    match cache_key.filter(|_| cacheable) {
        Some(key) => {
            let content_type = upstream.content_type();
            let body = upstream.body.clone();
            let mut response = upstream.into_response();
            match state.cache.set(key, body, None, content_type) {
                Ok(entry) => cache_headers(&mut response, &entry.etag, "MISS", entry.ttl),
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "Response not cached");
                    response.headers_mut().insert("x-cache", HeaderValue::from_static("MISS"));
                }
            }
            response
        }
        None => upstream.into_response(),
    }
}
