//! Alerts raised by the performance monitor.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Alert category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SlowResponse,
    HighErrorRate,
    MemoryUsage,
    CpuUsage,
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

/// Severity of a slow response, scaled by how far it overshoots.
#[must_use]
pub fn slow_severity(duration_ms: u64, threshold_ms: u64) -> Severity {
    let threshold = threshold_ms.max(1);
    if duration_ms >= threshold.saturating_mul(3) {
        Severity::Critical
    } else if duration_ms >= threshold.saturating_mul(2) {
        Severity::High
    } else {
        Severity::Medium
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl Alert {
    #[must_use]
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            alert_type,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Bounded, newest-last alert history.
#[derive(Debug)]
pub struct AlertLog {
    alerts: VecDeque<Alert>,
    capacity: usize,
}

impl AlertLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, alert: Alert) {
        if alert.severity == Severity::Critical {
            tracing::error!(alert_type = ?alert.alert_type, details = %alert.details, "{}", alert.message);
        } else {
            tracing::warn!(
                alert_type = ?alert.alert_type,
                severity = ?alert.severity,
                details = %alert.details,
                "{}",
                alert.message
            );
        }
        if self.alerts.len() == self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    /// Most recent alerts first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn has_critical_since(&self, since: DateTime<Utc>) -> bool {
        self.alerts
            .iter()
            .any(|a| a.severity == Severity::Critical && a.timestamp >= since)
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
