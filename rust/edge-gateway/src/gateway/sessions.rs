//! Admin session registry and the login/logout/status endpoints.
//!
//! Tokens are never stored in the clear: the registry is keyed by the
//! SHA-256 of the raw token. Expiry is lazy (checked on every lookup) with a
//! periodic sweep from the maintenance task.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::auth::{authenticate_admin, clear_session_cookie, session_cookie, session_token, verify_password};
use super::ip::ClientIp;
use crate::AppState;
use crate::error::{AuthFailure, GatewayError};

/// One issued admin session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    #[serde(skip)]
    pub token_hash: String,
    pub bound_ip: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whole seconds left, zero once expired.
    #[must_use]
    pub fn expires_in_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Result of looking a token up in the registry.
#[derive(Debug, Clone)]
pub enum SessionLookup {
    Active(Session),
    /// The entry existed but had expired; it has been removed.
    Expired,
    Missing,
}

/// In-memory registry of live admin sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

/// Hex SHA-256 of a raw session token.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl SessionRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a freshly issued token bound to `ip`.
    pub fn insert(&self, token: &str, ip: &str) -> Session {
        let issued_at = Utc::now();
        let ttl = TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX);
        let session = Session {
            token_hash: hash_token(token),
            bound_ip: ip.to_string(),
            issued_at,
            expires_at: issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.sessions
            .lock()
            .insert(session.token_hash.clone(), session.clone());
        session
    }

    /// Find a token's session, removing it if it has expired.
    pub fn lookup(&self, token: &str) -> SessionLookup {
        let hash = hash_token(token);
        let mut sessions = self.sessions.lock();
        match sessions.get(&hash) {
            None => SessionLookup::Missing,
            Some(session) if session.is_expired_at(Utc::now()) => {
                sessions.remove(&hash);
                SessionLookup::Expired
            }
            Some(session) => SessionLookup::Active(session.clone()),
        }
    }

    /// Like [`lookup`](Self::lookup), but leaves expired entries in place.
    pub fn peek(&self, token: &str) -> SessionLookup {
        match self.sessions.lock().get(&hash_token(token)) {
            None => SessionLookup::Missing,
            Some(session) if session.is_expired_at(Utc::now()) => SessionLookup::Expired,
            Some(session) => SessionLookup::Active(session.clone()),
        }
    }

    /// Destroy a session. Returns whether it existed.
    pub fn remove(&self, token: &str) -> bool {
        self.sessions.lock().remove(&hash_token(token)).is_some()
    }

    /// Drop every expired session.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Session endpoints, mounted at the gateway root.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/status", get(status))
}

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

/// Login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64,
}

/// Exchange the admin password for an IP-bound session.
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<LoginRequest>,
) -> Response {
    let policy = state.error_policy();

    if !state.ip_classifier.is_whitelisted(&ip) {
        tracing::warn!(ip = %ip, "Admin login attempt from non-whitelisted address");
        return GatewayError::AuthFailed(AuthFailure::IpNotWhitelisted).render(&policy);
    }

    let Some(configured) = state.config.admin.password.as_deref() else {
        return GatewayError::AuthFailed(AuthFailure::InvalidPassword).render(&policy);
    };
    if !verify_password(&req.password, configured) {
        tracing::warn!(ip = %ip, "Admin login failed: invalid password");
        return GatewayError::AuthFailed(AuthFailure::InvalidPassword).render(&policy);
    }

    let ttl = state.sessions.ttl();
    let token = match state.jwt.issue(&ip, ttl) {
        Ok((token, _claims)) => token,
        Err(e) => {
            tracing::error!(error = %e, "Failed to sign admin session token");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal_error", "message": "Could not create session" })),
            )
                .into_response();
        }
    };
    let session = state.sessions.insert(&token, &ip);

    tracing::info!(ip = %ip, expires_at = %session.expires_at, "Admin session issued");

    let cookie = session_cookie(&token, ttl, state.config.deployment.is_production());
    let body = LoginResponse {
        success: true,
        token,
        expires_at: session.expires_at,
        expires_in: ttl.as_secs(),
    };
    with_cookie(Json(body).into_response(), &cookie)
}

/// Destroy the caller's session, if any, and clear the cookie.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let removed = session_token(&headers).is_some_and(|token| state.sessions.remove(&token));
    if removed {
        tracing::info!("Admin session destroyed");
    }

    let cookie = clear_session_cookie(state.config.deployment.is_production());
    with_cookie(
        Json(serde_json::json!({ "success": true, "session_removed": removed })).into_response(),
        &cookie,
    )
}

/// Report the caller's session state.
pub async fn status(State(state): State<AppState>, ClientIp(ip): ClientIp, headers: HeaderMap) -> Response {
    match authenticate_admin(&state, &headers, &ip) {
        Ok(admin) => Json(serde_json::json!({
            "authenticated": true,
            "ip": admin.session.bound_ip,
            "issued_at": admin.session.issued_at,
            "expires_at": admin.session.expires_at,
            "expires_in": admin.session.expires_in_secs(),
        }))
        .into_response(),
        Err(failure) => GatewayError::AuthFailed(failure).render(&state.error_policy()),
    }
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}
