//! Process resource probe backed by `/proc` and cgroup files.
//!
//! On platforms without these files every reading is `None` and the
//! resource alerts simply never fire.

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Kernel clock ticks per second for `/proc/self/stat` CPU fields.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// One resource reading.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceSnapshot {
    pub rss_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    /// Resident set over the memory limit, 0.0 to 1.0.
    pub memory_ratio: Option<f64>,
    /// Process CPU use since the previous reading, in percent of one core.
    pub cpu_percent: Option<f64>,
}

/// Samples this process's memory and CPU use.
#[derive(Debug, Default)]
pub struct SystemProbe {
    last_cpu: Mutex<Option<(u64, Instant)>>,
}

impl SystemProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&self) -> ResourceSnapshot {
        let rss_bytes = read("/proc/self/status").and_then(|s| parse_vm_rss(&s));
        let memory_limit_bytes = read("/sys/fs/cgroup/memory.max")
            .and_then(|s| parse_cgroup_limit(&s))
            .or_else(|| read("/proc/meminfo").and_then(|s| parse_mem_total(&s)));

        #[allow(clippy::cast_precision_loss, reason = "byte counts fit comfortably in f64")]
        let memory_ratio = match (rss_bytes, memory_limit_bytes) {
            (Some(rss), Some(limit)) if limit > 0 => Some(rss as f64 / limit as f64),
            _ => None,
        };

        let cpu_percent = read("/proc/self/stat")
            .and_then(|s| parse_cpu_ticks(&s))
            .and_then(|ticks| self.cpu_since_last(ticks, Instant::now()));

        ResourceSnapshot {
            rss_bytes,
            memory_limit_bytes,
            memory_ratio,
            cpu_percent,
        }
    }

    #[allow(clippy::cast_precision_loss, reason = "tick deltas are small")]
    fn cpu_since_last(&self, ticks: u64, now: Instant) -> Option<f64> {
        let mut last = self.last_cpu.lock();
        let previous = last.replace((ticks, now));
        let (prev_ticks, prev_at) = previous?;
        let elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / CLOCK_TICKS_PER_SEC;
        Some(cpu_secs / elapsed * 100.0)
    }
}

fn read(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn parse_kb_field(contents: &str, field: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Resident set size from `/proc/self/status`.
#[must_use]
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    parse_kb_field(status, "VmRSS:")
}

/// Total memory from `/proc/meminfo`.
#[must_use]
pub fn parse_mem_total(meminfo: &str) -> Option<u64> {
    parse_kb_field(meminfo, "MemTotal:")
}

/// cgroup v2 `memory.max`; `max` means unlimited.
#[must_use]
pub fn parse_cgroup_limit(contents: &str) -> Option<u64> {
    contents.trim().parse().ok()
}

/// utime + stime from `/proc/self/stat`, in clock ticks.
#[must_use]
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}
