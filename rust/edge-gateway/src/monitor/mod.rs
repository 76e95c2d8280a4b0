//! Request performance monitor.
//!
//! Every response is recorded as a [`MetricSample`] into a bounded ring
//! buffer plus a per-endpoint aggregate. Slow samples raise alerts
//! immediately; error rate, memory and CPU are evaluated by the periodic
//! resource poll. [`PerformanceMonitor::health_status`] folds the current
//! picture into a score.

pub mod alerts;
pub mod system;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

pub use alerts::{Alert, AlertLog, AlertType, Severity, slow_severity};
pub use system::{ResourceSnapshot, SystemProbe};

use crate::AppState;
use crate::api::health::HEALTH_PATH;
use crate::config::MonitorConfig;
use crate::gateway::auth::AuthTier;

/// Slow samples kept for inspection.
pub const SLOW_QUERY_CAPACITY: usize = 100;
/// Alerts kept for inspection.
pub const ALERT_CAPACITY: usize = 100;
/// Error rate that raises `high_error_rate`.
pub const ERROR_RATE_THRESHOLD: f64 = 0.05;
/// Samples required before the error rate is judged.
pub const ERROR_RATE_MIN_SAMPLES: usize = 20;
/// Memory ratio that raises `memory_usage`.
pub const MEMORY_RATIO_THRESHOLD: f64 = 0.90;
/// CPU percent that raises `cpu_usage`.
pub const CPU_PERCENT_THRESHOLD: f64 = 80.0;
/// Window used for error-rate, latency and critical-alert health checks.
pub const HEALTH_WINDOW: Duration = Duration::from_secs(5 * 60);

const PENALTY_ERROR_RATE: u8 = 30;
const PENALTY_LATENCY: u8 = 20;
const PENALTY_MEMORY: u8 = 25;
const PENALTY_CPU: u8 = 15;
const PENALTY_CRITICAL_ALERT: u8 = 10;

/// Distinct (method, path) aggregates kept. Past this, the quietest one is
/// dropped to make room.
pub const ENDPOINT_CAPACITY: usize = 500;

const TOP_ENDPOINTS: usize = 10;

fn is_id_segment(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    let all_hex = |b: &[u8]| b.iter().all(u8::is_ascii_hexdigit);
    match bytes.len() {
        0 => false,
        24 => all_hex(bytes),
        36 => bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        }),
        _ => bytes.iter().all(u8::is_ascii_digit),
    }
}

/// Collapse id-like path segments (numbers, object ids, UUIDs) so
/// per-endpoint aggregates stay bounded.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| if is_id_segment(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

/// One completed request.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub path: String,
    pub method: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Authentication lane that served the request, or `none`.
    pub auth_kind: String,
}

impl MetricSample {
    #[must_use]
    pub fn new(method: &str, path: &str, status_code: u16, duration: Duration, auth_kind: &str) -> Self {
        Self {
            path: normalize_path(path),
            method: method.to_ascii_uppercase(),
            status_code,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
            auth_kind: auth_kind.to_string(),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Aggregate for one (method, path) pair.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub method: String,
    pub path: String,
    pub count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    #[serde(skip)]
    total_ms: u64,
}

impl EndpointStats {
    fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            count: 0,
            error_count: 0,
            avg_latency_ms: 0.0,
            min_latency_ms: u64::MAX,
            max_latency_ms: 0,
            total_ms: 0,
        }
    }

    #[allow(clippy::cast_precision_loss, reason = "averages tolerate rounding")]
    fn record(&mut self, sample: &MetricSample) {
        self.count += 1;
        if sample.is_error() {
            self.error_count += 1;
        }
        self.total_ms = self.total_ms.saturating_add(sample.duration_ms);
        self.min_latency_ms = self.min_latency_ms.min(sample.duration_ms);
        self.max_latency_ms = self.max_latency_ms.max(sample.duration_ms);
        self.avg_latency_ms = self.total_ms as f64 / self.count as f64;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointCount {
    pub method: String,
    pub path: String,
    pub count: u64,
}

/// Aggregates over a recent window.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStats {
    pub window_ms: u64,
    pub total_requests: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub requests_per_second: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub top_endpoints: Vec<EndpointCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    #[must_use]
    pub const fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::Healthy
        } else if score >= 50 {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthLevel,
    pub score: u8,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MonitorInner {
    samples: VecDeque<MetricSample>,
    endpoints: HashMap<(String, String), EndpointStats>,
    slow_queries: VecDeque<MetricSample>,
    resources: Option<ResourceSnapshot>,
}

/// Process-wide performance monitor.
#[derive(Debug)]
pub struct PerformanceMonitor {
    inner: Mutex<MonitorInner>,
    alerts: Mutex<AlertLog>,
    probe: SystemProbe,
    slow_threshold_ms: u64,
    capacity: usize,
}

impl PerformanceMonitor {
    #[must_use]
    pub fn new(config: &MonitorConfig) -> Self {
        let capacity = config.sample_capacity.max(1);
        Self {
            inner: Mutex::new(MonitorInner {
                samples: VecDeque::with_capacity(capacity),
                ..MonitorInner::default()
            }),
            alerts: Mutex::new(AlertLog::new(ALERT_CAPACITY)),
            probe: SystemProbe::new(),
            slow_threshold_ms: config.slow_query_threshold_ms,
            capacity,
        }
    }

    pub const fn slow_threshold_ms(&self) -> u64 {
        self.slow_threshold_ms
    }

    pub fn record(&self, sample: MetricSample) {
        let slow = sample.duration_ms > self.slow_threshold_ms;
        {
            let mut inner = self.inner.lock();
            let key = (sample.method.clone(), sample.path.clone());
            if !inner.endpoints.contains_key(&key) && inner.endpoints.len() >= ENDPOINT_CAPACITY {
                evict_quietest(&mut inner.endpoints);
            }
            inner
                .endpoints
                .entry(key)
                .or_insert_with(|| EndpointStats::new(&sample.method, &sample.path))
                .record(&sample);
            if slow {
                if inner.slow_queries.len() == SLOW_QUERY_CAPACITY {
                    inner.slow_queries.pop_front();
                }
                inner.slow_queries.push_back(sample.clone());
            }
            if inner.samples.len() == self.capacity {
                inner.samples.pop_front();
            }
            inner.samples.push_back(sample.clone());
        }

        if slow {
            self.raise(Alert::new(
                AlertType::SlowResponse,
                slow_severity(sample.duration_ms, self.slow_threshold_ms),
                format!("Slow response: {} {} took {}ms", sample.method, sample.path, sample.duration_ms),
                json!({
                    "method": sample.method,
                    "path": sample.path,
                    "duration_ms": sample.duration_ms,
                    "threshold_ms": self.slow_threshold_ms,
                    "status_code": sample.status_code,
                }),
            ));
        }
    }

    fn raise(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }

    fn samples_since(&self, since: DateTime<Utc>) -> Vec<MetricSample> {
        self.inner
            .lock()
            .samples
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect()
    }

    fn window_start(window: Duration) -> DateTime<Utc> {
        TimeDelta::from_std(window)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    #[allow(clippy::cast_precision_loss, reason = "rates tolerate rounding")]
    pub fn realtime_stats(&self, window: Duration) -> RealtimeStats {
        let samples = self.samples_since(Self::window_start(window));

        let total = samples.len() as u64;
        let error_count = samples.iter().filter(|s| s.is_error()).count() as u64;
        let total_ms: u64 = samples.iter().map(|s| s.duration_ms).sum();

        let mut status_codes = BTreeMap::new();
        let mut per_endpoint: HashMap<(&str, &str), u64> = HashMap::new();
        for sample in &samples {
            *status_codes.entry(sample.status_code).or_insert(0) += 1;
            *per_endpoint
                .entry((sample.method.as_str(), sample.path.as_str()))
                .or_insert(0) += 1;
        }

        let mut top_endpoints: Vec<EndpointCount> = per_endpoint
            .into_iter()
            .map(|((method, path), count)| EndpointCount {
                method: method.to_string(),
                path: path.to_string(),
                count,
            })
            .collect();
        top_endpoints.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        top_endpoints.truncate(TOP_ENDPOINTS);

        let window_secs = window.as_secs_f64();
        RealtimeStats {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            total_requests: total,
            avg_latency_ms: if total == 0 { 0.0 } else { total_ms as f64 / total as f64 },
            min_latency_ms: samples.iter().map(|s| s.duration_ms).min().unwrap_or(0),
            max_latency_ms: samples.iter().map(|s| s.duration_ms).max().unwrap_or(0),
            error_count,
            error_rate: if total == 0 { 0.0 } else { error_count as f64 / total as f64 },
            requests_per_second: if window_secs > 0.0 { total as f64 / window_secs } else { 0.0 },
            status_codes,
            top_endpoints,
        }
    }

    /// Error rate over the health window, if enough samples exist to judge it.
    #[allow(clippy::cast_precision_loss, reason = "rates tolerate rounding")]
    fn recent_error_rate(&self) -> Option<f64> {
        let samples = self.samples_since(Self::window_start(HEALTH_WINDOW));
        if samples.len() < ERROR_RATE_MIN_SAMPLES {
            return None;
        }
        let errors = samples.iter().filter(|s| s.is_error()).count();
        Some(errors as f64 / samples.len() as f64)
    }

    /// Periodic check: sample the process and raise threshold alerts.
    pub fn poll_resources(&self) {
        let snapshot = self.probe.sample();
        self.evaluate_resources(snapshot);
    }

    pub fn evaluate_resources(&self, snapshot: ResourceSnapshot) {
        if let Some(rate) = self.recent_error_rate()
            && rate > ERROR_RATE_THRESHOLD
        {
            self.raise(Alert::new(
                AlertType::HighErrorRate,
                Severity::High,
                format!("High error rate: {:.1}%", rate * 100.0),
                json!({ "error_rate": rate, "threshold": ERROR_RATE_THRESHOLD }),
            ));
        }

        if let Some(ratio) = snapshot.memory_ratio
            && ratio > MEMORY_RATIO_THRESHOLD
        {
            let severity = if ratio > 0.95 { Severity::Critical } else { Severity::High };
            self.raise(Alert::new(
                AlertType::MemoryUsage,
                severity,
                format!("High memory usage: {:.1}%", ratio * 100.0),
                json!({
                    "ratio": ratio,
                    "rss_bytes": snapshot.rss_bytes,
                    "limit_bytes": snapshot.memory_limit_bytes,
                }),
            ));
        }

        if let Some(cpu) = snapshot.cpu_percent
            && cpu > CPU_PERCENT_THRESHOLD
        {
            self.raise(Alert::new(
                AlertType::CpuUsage,
                Severity::High,
                format!("High CPU usage: {cpu:.1}%"),
                json!({ "cpu_percent": cpu, "threshold": CPU_PERCENT_THRESHOLD }),
            ));
        }

        self.inner.lock().resources = Some(snapshot);
    }

    pub fn health_status(&self) -> HealthStatus {
        let mut score: u8 = 100;
        let mut issues = Vec::new();

        if let Some(rate) = self.recent_error_rate()
            && rate > ERROR_RATE_THRESHOLD
        {
            score = score.saturating_sub(PENALTY_ERROR_RATE);
            issues.push(format!("High error rate: {:.1}%", rate * 100.0));
        }

        let recent = self.realtime_stats(HEALTH_WINDOW);
        #[allow(clippy::cast_precision_loss, reason = "threshold comparison")]
        let latency_threshold = self.slow_threshold_ms as f64;
        if recent.total_requests > 0 && recent.avg_latency_ms > latency_threshold {
            score = score.saturating_sub(PENALTY_LATENCY);
            issues.push(format!("High average latency: {:.0}ms", recent.avg_latency_ms));
        }

        let resources = self.inner.lock().resources.clone();
        if let Some(snapshot) = resources {
            if let Some(ratio) = snapshot.memory_ratio
                && ratio > MEMORY_RATIO_THRESHOLD
            {
                score = score.saturating_sub(PENALTY_MEMORY);
                issues.push(format!("High memory usage: {:.1}%", ratio * 100.0));
            }
            if let Some(cpu) = snapshot.cpu_percent
                && cpu > CPU_PERCENT_THRESHOLD
            {
                score = score.saturating_sub(PENALTY_CPU);
                issues.push(format!("High CPU usage: {cpu:.1}%"));
            }
        }

        if self
            .alerts
            .lock()
            .has_critical_since(Self::window_start(HEALTH_WINDOW))
        {
            score = score.saturating_sub(PENALTY_CRITICAL_ALERT);
            issues.push("Critical alert in the last 5 minutes".to_string());
        }

        HealthStatus {
            status: HealthLevel::from_score(score),
            score,
            issues,
            checked_at: Utc::now(),
        }
    }

    pub fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.lock().recent(limit)
    }

    /// Slow samples, most recent first.
    pub fn slow_queries(&self) -> Vec<MetricSample> {
        self.inner.lock().slow_queries.iter().rev().cloned().collect()
    }

    /// Endpoint aggregates, busiest first.
    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        let mut stats: Vec<EndpointStats> = self.inner.lock().endpoints.values().cloned().collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        stats
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }
}

fn evict_quietest(endpoints: &mut HashMap<(String, String), EndpointStats>) {
    let quietest = endpoints
        .iter()
        .min_by_key(|(_, stats)| stats.count)
        .map(|(key, _)| key.clone());
    if let Some(key) = quietest {
        endpoints.remove(&key);
    }
}

/// Records every response except gateway self-health probes.
pub async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    if path == HEALTH_PATH {
        return next.run(request).await;
    }

    let started = Instant::now();
    let response = next.run(request).await;
    let auth_kind = response
        .extensions()
        .get::<AuthTier>()
        .map_or("none", AuthTier::as_str);

    state.monitor.record(MetricSample::new(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed(),
        auth_kind,
    ));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(&MonitorConfig {
            slow_query_threshold_ms: 100,
            sample_capacity: 50,
            poll_interval_secs: 30,
        })
    }

    fn sample(path: &str, status: u16, ms: u64) -> MetricSample {
        MetricSample::new("get", path, status, Duration::from_millis(ms), "public")
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/users/42"), "/api/users/:id");
        assert_eq!(normalize_path("/api/posts/507f1f77bcf86cd799439011/comments"), "/api/posts/:id/comments");
        assert_eq!(
            normalize_path("/api/items/550e8400-e29b-41d4-a716-446655440000"),
            "/api/items/:id"
        );
        assert_eq!(normalize_path("/api/v1/users"), "/api/v1/users");
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let monitor = monitor();
        for i in 0..60 {
            monitor.record(sample(&format!("/p{i}"), 200, 1));
        }
        assert_eq!(monitor.sample_count(), 50);
        let stats = monitor.realtime_stats(Duration::from_secs(60));
        assert_eq!(stats.total_requests, 50);
        assert!(stats.top_endpoints.iter().all(|e| e.path != "/p0"));
    }

    #[test]
    fn test_endpoint_aggregates() {
        let monitor = monitor();
        monitor.record(sample("/api/users/1", 200, 10));
        monitor.record(sample("/api/users/2", 500, 30));
        monitor.record(sample("/api/other", 200, 5));

        let stats = monitor.endpoint_stats();
        assert_eq!(stats[0].path, "/api/users/:id");
        assert_eq!(stats[0].method, "GET");
        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[0].error_count, 1);
        assert_eq!(stats[0].min_latency_ms, 10);
        assert_eq!(stats[0].max_latency_ms, 30);
        assert!((stats[0].avg_latency_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_endpoint_aggregates_are_capped() {
        let monitor = monitor();
        for _ in 0..3 {
            monitor.record(sample("/api/hot", 200, 1));
        }
        for i in 0..ENDPOINT_CAPACITY * 2 {
            monitor.record(sample(&format!("/scan/p{i}"), 404, 1));
        }

        let stats = monitor.endpoint_stats();
        assert_eq!(stats.len(), ENDPOINT_CAPACITY);
        assert_eq!(stats[0].path, "/api/hot");
        assert_eq!(stats[0].count, 3);
    }

    #[test]
    fn test_realtime_stats() {
        let monitor = monitor();
        monitor.record(sample("/a", 200, 10));
        monitor.record(sample("/a", 200, 20));
        monitor.record(sample("/b", 404, 30));
        monitor.record(sample("/c", 503, 40));

        let stats = monitor.realtime_stats(Duration::from_secs(10));
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.error_count, 2);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_latency_ms - 25.0).abs() < f64::EPSILON);
        assert_eq!(stats.min_latency_ms, 10);
        assert_eq!(stats.max_latency_ms, 40);
        assert!((stats.requests_per_second - 0.4).abs() < 1e-9);
        assert_eq!(stats.status_codes[&200], 2);
        assert_eq!(stats.top_endpoints[0].path, "/a");
        assert_eq!(stats.top_endpoints[0].count, 2);
    }

    #[test]
    fn test_slow_sample_raises_scaled_alert() {
        let monitor = monitor();
        monitor.record(sample("/fast", 200, 50));
        monitor.record(sample("/slow", 200, 150));
        monitor.record(sample("/slower", 200, 350));

        let slow = monitor.slow_queries();
        assert_eq!(slow.len(), 2);
        assert_eq!(slow[0].path, "/slower");

        let alerts = monitor.alerts(10);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, AlertType::SlowResponse);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[1].severity, Severity::Medium);
    }

    #[test]
    fn test_healthy_when_quiet() {
        let health = monitor().health_status();
        assert_eq!(health.status, HealthLevel::Healthy);
        assert_eq!(health.score, 100);
        assert!(health.issues.is_empty());
    }

    #[test]
    fn test_error_rate_needs_minimum_samples() {
        let monitor = monitor();
        for _ in 0..10 {
            monitor.record(sample("/err", 500, 1));
        }
        monitor.evaluate_resources(ResourceSnapshot::default());
        assert!(monitor.alerts(10).is_empty());
        assert_eq!(monitor.health_status().score, 100);

        for _ in 0..10 {
            monitor.record(sample("/err", 500, 1));
        }
        monitor.evaluate_resources(ResourceSnapshot::default());
        assert_eq!(monitor.alerts(10)[0].alert_type, AlertType::HighErrorRate);
        assert_eq!(monitor.health_status().score, 70);
    }

    #[test]
    fn test_resource_penalties_stack() {
        let monitor = monitor();
        monitor.evaluate_resources(ResourceSnapshot {
            rss_bytes: Some(97),
            memory_limit_bytes: Some(100),
            memory_ratio: Some(0.97),
            cpu_percent: Some(95.0),
        });

        let types: Vec<AlertType> = monitor.alerts(10).iter().map(|a| a.alert_type).collect();
        assert!(types.contains(&AlertType::MemoryUsage));
        assert!(types.contains(&AlertType::CpuUsage));

        // memory 25 + cpu 15 + critical memory alert 10
        let health = monitor.health_status();
        assert_eq!(health.score, 50);
        assert_eq!(health.status, HealthLevel::Degraded);
        assert_eq!(health.issues.len(), 3);
    }

    #[test]
    fn test_latency_penalty_and_levels() {
        let monitor = monitor();
        monitor.record(sample("/slow", 200, 250));
        let health = monitor.health_status();
        // latency 20; the 2.5x slow alert is high, not critical
        assert_eq!(health.score, 80);
        assert_eq!(health.status, HealthLevel::Healthy);

        assert_eq!(HealthLevel::from_score(79), HealthLevel::Degraded);
        assert_eq!(HealthLevel::from_score(49), HealthLevel::Unhealthy);
    }
}
