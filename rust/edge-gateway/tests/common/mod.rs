//! Shared fixtures: a mock private API and a gateway wired to it.

#![allow(dead_code, reason = "each test binary uses a subset of the fixtures")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use edge_gateway::AppState;
use edge_gateway::config::{AdmissionMode, AppConfig, Environment};
use edge_gateway::server::build_router;

pub const API_KEY: &str = "test-gateway-key-0123456789";
pub const ADMIN_PASSWORD: &str = "correct-horse-battery-staple";
pub const JWT_SECRET: &str = "integration-test-secret-at-least-32-bytes";
pub const PUBLIC_SITE: &str = "https://www.example.com";
pub const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";

/// Counts requests that actually reached the mock upstream.
#[derive(Debug, Clone, Default)]
pub struct UpstreamHits(Arc<AtomicUsize>);

impl UpstreamHits {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

async fn echo(State(hits): State<UpstreamHits>, headers: HeaderMap, req: Request<Body>) -> Json<Value> {
    hits.0.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "path": req.uri().path(),
        "query": req.uri().query(),
        "x-gateway-service": header("x-gateway-service"),
        "x-gateway-request": header("x-gateway-request"),
        "x-forwarded-for": header("x-forwarded-for"),
        "x-real-ip": header("x-real-ip"),
        "x-api-key": header("x-api-key"),
    }))
}

async fn sized(State(hits): State<UpstreamHits>, size: usize) -> Response {
    hits.0.fetch_add(1, Ordering::SeqCst);
    // {"data":"…"} is 11 bytes of framing.
    let body = json!({ "data": "a".repeat(size.saturating_sub(11)) }).to_string();
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Start the mock private API and return its base URL.
pub async fn spawn_upstream() -> (String, UpstreamHits) {
    let hits = UpstreamHits::default();
    let app = Router::new()
        .route("/api/small", get(|s: State<UpstreamHits>| sized(s, 500)))
        .route("/api/large", get(|s: State<UpstreamHits>| sized(s, 5 * 1024)))
        .route(
            "/api/forbidden",
            get(|| async { (StatusCode::FORBIDDEN, Json(json!({ "error": "direct access" }))) }),
        )
        .route(
            "/api/missing",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))) }),
        )
        .route(
            "/api/analytics/realtime",
            get(|s: State<UpstreamHits>| sized(s, 200)),
        )
        .fallback(echo)
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

/// Development config pointed at `upstream`, with every secret filled in.
pub fn test_config(upstream: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.deployment.environment = Environment::Development;
    config.deployment.admission_mode = AdmissionMode::Enforce;
    config.upstream.url = Some(upstream.to_string());
    config.upstream.timeout_secs = 5;
    config.upstream.connect_timeout_secs = 1;
    config.gateway.api_key = Some(API_KEY.to_string());
    config.gateway.public_site_url = PUBLIC_SITE.to_string();
    config.gateway.public_path_prefixes = vec!["/api/public".to_string()];
    config.admin.password = Some(ADMIN_PASSWORD.to_string());
    config.admin.jwt_secret = Some(JWT_SECRET.to_string());
    config
}

pub fn gateway(config: AppConfig) -> (Router, AppState) {
    let state = AppState::new(config).unwrap();
    (build_router(state.clone()), state)
}

/// A browser-like request from `ip`.
pub fn request(method: &str, uri: &str, ip: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::USER_AGENT, BROWSER)
        .header("x-forwarded-for", ip)
}

/// A browser-like request arriving over a real connection from `peer`, with
/// whatever `x-forwarded-for` the caller chose to send.
pub fn request_via(method: &str, uri: &str, peer: &str, forwarded_for: &str) -> axum::http::request::Builder {
    let peer: SocketAddr = format!("{peer}:40000").parse().unwrap();
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::USER_AGENT, BROWSER)
        .header("x-forwarded-for", forwarded_for)
        .extension(ConnectInfo(peer))
}

pub async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Log in as admin from `ip` and return the session token.
pub async fn login(app: &Router, ip: &str) -> String {
    let req = request("POST", "/admin/login", ip)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "password": ADMIN_PASSWORD }).to_string()))
        .unwrap();
    let response = send(app, req).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"].as_str().unwrap().to_string()
}
