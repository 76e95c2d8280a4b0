//! Authentication lanes.
//!
//! - Service lane: one shared API key in `x-api-key` or `Authorization: Bearer`.
//! - Admin lane: IP-bound HS256 session tokens, carried in the `authToken`
//!   cookie (or as a bearer token), that must also be live in the
//!   [`SessionRegistry`](super::sessions::SessionRegistry).

use std::time::Duration;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::ip::ClientIp;
use super::sessions::{Session, SessionLookup};
use crate::AppState;
use crate::error::{AuthFailure, GatewayError};

/// Name of the admin session cookie.
pub const SESSION_COOKIE: &str = "authToken";

/// Purpose claim carried by admin session tokens.
pub const ADMIN_PURPOSE: &str = "admin_session";

/// Authentication tier; selects the rate ceiling and partitions the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthTier {
    Admin,
    Frontend,
    Public,
}

impl AuthTier {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Frontend => "frontend",
            Self::Public => "public",
        }
    }
}

/// Claims embedded in an admin session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    /// Client address the session is bound to.
    pub ip: String,
    pub purpose: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique per issuance so two logins in the same second differ.
    pub jti: String,
}

/// Signs and verifies admin session tokens.
pub struct JwtAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthority")
            .field("algorithm", &Algorithm::HS256)
            .finish_non_exhaustive()
    }
}

impl JwtAuthority {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Issue a token bound to `ip`. Token expiry is rounded up to whole seconds;
    /// the registry enforces the exact TTL.
    pub fn issue(&self, ip: &str, ttl: Duration) -> jsonwebtoken::errors::Result<(String, SessionClaims)> {
        let now = chrono::Utc::now().timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2).max(1);
        let claims = SessionClaims {
            sub: "admin".to_string(),
            ip: ip.to_string(),
            purpose: ADMIN_PURPOSE.to_string(),
            iat: now,
            exp: now.saturating_add(ttl_secs),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> jsonwebtoken::errors::Result<SessionClaims> {
        decode::<SessionClaims>(token, &self.decoding, &self.validation).map(|data| data.claims)
    }
}

/// Constant-time comparison of two secrets.
#[must_use]
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// API key presented by the caller, from `x-api-key` or a bearer token.
pub fn presented_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .or_else(|| bearer_token(headers))
}

/// Service lane check.
pub fn check_api_key(headers: &HeaderMap, expected: &str) -> Result<(), AuthFailure> {
    match presented_api_key(headers) {
        None => Err(AuthFailure::MissingApiKey),
        Some(key) if secrets_match(key, expected) => Ok(()),
        Some(_) => Err(AuthFailure::InvalidApiKey),
    }
}

/// Admin session token from the `authToken` cookie, falling back to bearer.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    jar.get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| bearer_token(headers).map(str::to_string))
}

/// A verified admin session, available to handlers behind the admin lane.
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub claims: SessionClaims,
    pub session: Session,
}

/// Admin lane check. All of registry membership, expiry, signature and IP
/// binding must hold. An expired entry is removed on the way out.
pub fn authenticate_admin(state: &AppState, headers: &HeaderMap, ip: &str) -> Result<AdminSession, AuthFailure> {
    let token = session_token(headers).ok_or(AuthFailure::MissingSession)?;
    let lookup = state.sessions.lookup(&token);
    verify_session(state, &token, lookup, ip)
}

/// Whether the request carries a session that would pass
/// [`authenticate_admin`]. Leaves the registry untouched.
pub fn has_admin_session(state: &AppState, headers: &HeaderMap, ip: &str) -> bool {
    session_token(headers).is_some_and(|token| {
        let lookup = state.sessions.peek(&token);
        verify_session(state, &token, lookup, ip).is_ok()
    })
}

fn verify_session(state: &AppState, token: &str, lookup: SessionLookup, ip: &str) -> Result<AdminSession, AuthFailure> {
    let session = match lookup {
        SessionLookup::Active(session) => session,
        SessionLookup::Expired => return Err(AuthFailure::SessionExpired),
        SessionLookup::Missing => return Err(AuthFailure::SessionNotFound),
    };

    let claims = state.jwt.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "Session token failed verification");
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthFailure::SessionExpired,
            _ => AuthFailure::InvalidToken,
        }
    })?;

    if claims.purpose != ADMIN_PURPOSE {
        return Err(AuthFailure::InvalidToken);
    }

    if claims.ip != ip || session.bound_ip != ip {
        tracing::warn!(
            bound_ip = %session.bound_ip,
            presented_ip = %ip,
            "Admin session presented from a different address"
        );
        return Err(AuthFailure::IpMismatch);
    }

    Ok(AdminSession { claims, session })
}

/// Middleware guarding gateway-local admin routes.
pub async fn require_admin_session(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    mut req: Request,
    next: Next,
) -> Response {
    match authenticate_admin(&state, req.headers(), &ip) {
        Ok(admin) => {
            req.extensions_mut().insert(admin);
            next.run(req).await
        }
        Err(failure) => {
            tracing::debug!(ip = %ip, reason = %failure, path = %req.uri().path(), "Admin lane rejected request");
            GatewayError::AuthFailed(failure).render(&state.error_policy())
        }
    }
}

/// Check a login password against the configured value, which is either
/// plaintext or an argon2 PHC string.
#[must_use]
pub fn verify_password(presented: &str, configured: &str) -> bool {
    if configured.starts_with("$argon2") {
        return match PasswordHash::new(configured) {
            Ok(hash) => Argon2::default()
                .verify_password(presented.as_bytes(), &hash)
                .is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "Configured admin password hash does not parse");
                false
            }
        };
    }
    secrets_match(presented, configured)
}

/// `Set-Cookie` value carrying a fresh session token.
#[must_use]
pub fn session_cookie(token: &str, ttl: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        ttl.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that removes the session cookie.
#[must_use]
pub fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", Duration::ZERO, secure)
}
