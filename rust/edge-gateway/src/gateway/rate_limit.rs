//! Fixed-window rate buckets and the 429 response they produce.
//!
//! Buckets live in a single process-wide store. The read-compare-increment
//! sequence for a key always runs under one lock guard, so concurrent
//! requests on the same key cannot interleave between the check and the
//! increment.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use serde::Serialize;

/// A single counting window for one key.
#[derive(Debug, Clone)]
pub struct RateBucket {
    pub key: String,
    pub window_start: Instant,
    pub count: u32,
    pub limit: u32,
}

/// Outcome of counting one request against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time left until the current window closes.
    pub reset_after: Duration,
}

impl RateDecision {
    /// Seconds to advertise in `Retry-After`, never zero.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }

    /// Window reset as a Unix timestamp.
    #[must_use]
    pub fn reset_epoch_secs(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (now + self.reset_after).as_secs()
    }

    /// Attach the `x-ratelimit-*` headers to a response header map.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_epoch_secs()));
    }
}

/// In-memory per-key counters with fixed windows.
#[derive(Debug, Default)]
pub struct RateBucketStore {
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl RateBucketStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `key` at the current instant.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        self.check_at(key, limit, window, Instant::now())
    }

    /// Count one request for `key` as if it arrived at `now`.
    ///
    /// Requests over the limit are not counted, so a flood does not push the
    /// remaining budget of the next window below zero.
    pub fn check_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> RateDecision {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| RateBucket {
            key: key.to_string(),
            window_start: now,
            count: 0,
            limit,
        });

        if now.saturating_duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        bucket.limit = limit;

        let elapsed = now.saturating_duration_since(bucket.window_start);
        let reset_after = window.saturating_sub(elapsed);

        if bucket.count >= limit {
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_after,
            };
        }

        bucket.count += 1;
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - bucket.count,
            reset_after,
        }
    }

    /// Current count for a key, if a bucket exists.
    pub fn count(&self, key: &str) -> Option<u32> {
        self.buckets.lock().get(key).map(|b| b.count)
    }

    /// Drop a key's bucket entirely.
    pub fn reset(&self, key: &str) -> bool {
        self.buckets.lock().remove(key).is_some()
    }

    /// Remove buckets whose window closed more than `max_window` ago.
    pub fn sweep(&self, max_window: Duration) -> usize {
        self.sweep_at(max_window, Instant::now())
    }

    fn sweep_at(&self, max_window: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.window_start) < max_window);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rate limit error response.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitError {
    pub error: String,
    pub message: String,
    pub retry_after_secs: u64,
    #[serde(skip)]
    pub decision: Option<RateDecision>,
}

impl RateLimitError {
    #[must_use]
    pub fn from_decision(decision: RateDecision) -> Self {
        Self {
            error: "rate_limit_exceeded".to_string(),
            message: "Too many requests. Please try again later.".to_string(),
            retry_after_secs: decision.retry_after_secs(),
            decision: Some(decision),
        }
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after_secs;
        let decision = self.decision;
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response();

        let headers = response.headers_mut();
        headers.insert("Retry-After", HeaderValue::from(retry_after));
        if let Some(decision) = decision {
            decision.apply_headers(headers);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_requests_beyond_limit_are_rejected() {
        let store = RateBucketStore::new();
        let start = Instant::now();

        let decisions: Vec<_> = (0..8)
            .map(|_| store.check_at("ip_1.2.3.4", 5, WINDOW, start))
            .collect();

        let allowed = decisions.iter().filter(|d| d.allowed).count();
        assert_eq!(allowed, 5);
        assert!(decisions[..5].iter().all(|d| d.allowed));
        assert!(decisions[5..].iter().all(|d| !d.allowed));
        assert_eq!(decisions[4].remaining, 0);
        assert_eq!(decisions[0].remaining, 4);
    }

    #[test]
    fn test_window_reset_allows_more_requests() {
        let store = RateBucketStore::new();
        let start = Instant::now();
        for _ in 0..5 {
            assert!(store.check_at("ip_1.2.3.4", 5, WINDOW, start).allowed);
        }
        assert!(!store.check_at("ip_1.2.3.4", 5, WINDOW, start).allowed);

        let later = start + WINDOW;
        let decision = store.check_at("ip_1.2.3.4", 5, WINDOW, later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = RateBucketStore::new();
        let now = Instant::now();
        assert!(store.check_at("ip_1.1.1.1", 1, WINDOW, now).allowed);
        assert!(!store.check_at("ip_1.1.1.1", 1, WINDOW, now).allowed);
        assert!(store.check_at("ip_2.2.2.2", 1, WINDOW, now).allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_after: Duration::from_millis(1500),
        };
        assert_eq!(decision.retry_after_secs(), 2);

        let decision = RateDecision {
            reset_after: Duration::ZERO,
            ..decision
        };
        assert_eq!(decision.retry_after_secs(), 1);
    }

    #[test]
    fn test_sweep_removes_stale_buckets() {
        let store = RateBucketStore::new();
        let start = Instant::now();
        store.check_at("old", 5, WINDOW, start);
        store.check_at("fresh", 5, WINDOW, start + Duration::from_secs(120));
        assert_eq!(store.sweep_at(WINDOW, start + Duration::from_secs(121)), 1);
        assert!(store.count("old").is_none());
        assert_eq!(store.count("fresh"), Some(1));
    }

    #[test]
    fn test_rate_limit_error_response_headers() {
        let decision = RateDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_after: Duration::from_secs(42),
        };
        let response = RateLimitError::from_decision(decision).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }
}
