//! Gateway-local HTTP endpoints.

pub mod admin;
pub mod health;

use axum::Router;

use crate::AppState;

/// Create the router for locally served endpoints.
pub fn create_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(admin::router(state))
}
