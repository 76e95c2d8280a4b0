//! Gateway request pipeline.
//!
//! This module holds every stage a proxied request passes through:
//! - IP matching, classification and client-IP resolution
//! - Admission filtering (shield oracle + rate buckets)
//! - API-key and admin-session authentication
//! - Response caching and compression
//! - Forwarding to the private upstream API

pub mod admission;
pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod compression;
pub mod headers;
pub mod ip;
pub mod proxy;
pub mod rate_limit;
pub mod sessions;
pub mod shield;

use axum::Router;

use crate::AppState;

/// Gateway-local routes that do not require an admin session.
pub fn create_router() -> Router<AppState> {
    Router::new().merge(sessions::router())
}
