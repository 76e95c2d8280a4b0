//! Response cache with TTL expiry, LRU eviction and ETags.
//!
//! Keys carry the caller's [`AuthTier`] so admin, frontend and public callers
//! never share a cached payload for the same path.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::auth::AuthTier;
use crate::config::CacheConfig;

/// Path fragments that are never cached.
const UNCACHEABLE_FRAGMENTS: &[&str] = &["/analytics/realtime", "/realtime"];

/// Cache key: tier, method, path and raw query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tier: AuthTier,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
}

impl CacheKey {
    #[must_use]
    pub fn new(tier: AuthTier, method: &str, path: &str, query: Option<&str>) -> Self {
        Self {
            tier,
            method: method.to_uppercase(),
            path: path.to_string(),
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tier.as_str(), self.method, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

/// A cached upstream payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub etag: String,
    pub created_at: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
    pub last_accessed_at: Instant,
}

impl CacheEntry {
    #[must_use]
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }

    /// TTL left at `now`, used for `Cache-Control: max-age`.
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.created_at))
    }
}

/// Cache failures. None of them should fail a request.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("payload of {size} bytes exceeds the {max} byte cache limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid invalidation pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Counters exposed on the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub max_entries: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Process-wide response cache.
#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    default_ttl: Duration,
    max_entries: usize,
    max_payload_bytes: usize,
}

impl ResponseCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            default_ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries.max(1),
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.get_at(key, Instant::now())
    }

    /// Look up `key` as of `now`. Expired entries are removed and count as
    /// a miss.
    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();

        let valid = inner.entries.get(key).map(|entry| entry.is_valid_at(now));
        match valid {
            Some(true) => {
                inner.hits += 1;
                let entry = inner.entries.get_mut(key)?;
                entry.hit_count += 1;
                entry.last_accessed_at = now;
                Some(entry.clone())
            }
            Some(false) => {
                inner.entries.remove(key);
                inner.expirations += 1;
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(
        &self,
        key: CacheKey,
        payload: Bytes,
        ttl: Option<Duration>,
        content_type: Option<String>,
    ) -> Result<CacheEntry, CacheError> {
        self.set_at(key, payload, ttl, content_type, Instant::now())
    }

    /// Store a payload. When the cache is full the least recently accessed
    /// entry is evicted first.
    pub fn set_at(
        &self,
        key: CacheKey,
        payload: Bytes,
        ttl: Option<Duration>,
        content_type: Option<String>,
        now: Instant,
    ) -> Result<CacheEntry, CacheError> {
        if payload.len() > self.max_payload_bytes {
            return Err(CacheError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_bytes,
            });
        }

        let entry = CacheEntry {
            etag: etag_for(&payload),
            key: key.clone(),
            payload,
            content_type,
            created_at: now,
            ttl: ttl.unwrap_or(self.default_ttl),
            hit_count: 0,
            last_accessed_at: now,
        };

        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            let lru = inner
                .entries
                .values()
                .min_by_key(|e| e.last_accessed_at)
                .map(|e| e.key.clone());
            if let Some(lru) = lru {
                inner.entries.remove(&lru);
                inner.evictions += 1;
                tracing::debug!(key = %lru, "Evicted least recently used cache entry");
            }
        }
        inner.entries.insert(key, entry.clone());
        Ok(entry)
    }

    /// Remove every entry whose key matches `pattern`. Returns the count.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let regex = regex::Regex::new(pattern)?;
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !regex.is_match(&key.to_string()));
        let removed = before - inner.entries.len();
        tracing::info!(pattern = %pattern, removed = removed, "Cache invalidated");
        Ok(removed)
    }

    /// Remove expired entries independent of LRU pressure.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.is_valid_at(now));
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        #[allow(clippy::cast_precision_loss, reason = "ratio of counters")]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            entries: inner.entries.len(),
            max_entries: self.max_entries,
            hit_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Real-time analytics paths are never cached.
#[must_use]
pub fn is_cacheable_path(path: &str) -> bool {
    !UNCACHEABLE_FRAGMENTS.iter().any(|f| path.contains(f))
}

/// Quoted first 32 hex characters of the payload's SHA-256.
#[must_use]
pub fn etag_for(payload: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(payload));
    format!("\"{}\"", &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize) -> ResponseCache {
        ResponseCache::new(&CacheConfig {
            ttl_secs: 60,
            max_entries,
            max_payload_bytes: 1024,
        })
    }

    fn key(tier: AuthTier, path: &str) -> CacheKey {
        CacheKey::new(tier, "get", path, None)
    }

    #[test]
    fn test_miss_then_hit_with_stable_etag() {
        let cache = cache(10);
        let k = key(AuthTier::Public, "/api/services");
        assert!(cache.get(&k).is_none());

        let stored = cache
            .set(k.clone(), Bytes::from_static(b"{\"a\":1}"), None, Some("application/json".into()))
            .unwrap();
        let hit = cache.get(&k).unwrap();
        assert_eq!(hit.etag, stored.etag);
        assert_eq!(hit.hit_count, 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = cache(10);
        let k = key(AuthTier::Public, "/api/services");
        let start = Instant::now();
        cache
            .set_at(k.clone(), Bytes::from_static(b"x"), Some(Duration::from_secs(5)), None, start)
            .unwrap();

        assert!(cache.get_at(&k, start + Duration::from_secs(4)).is_some());
        assert!(cache.get_at(&k, start + Duration::from_secs(5)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_tiers_do_not_share_entries() {
        let cache = cache(10);
        cache
            .set(key(AuthTier::Admin, "/api/quotes"), Bytes::from_static(b"secret"), None, None)
            .unwrap();
        assert!(cache.get(&key(AuthTier::Public, "/api/quotes")).is_none());
        assert!(cache.get(&key(AuthTier::Admin, "/api/quotes")).is_some());
    }

    #[test]
    fn test_lru_eviction_picks_least_recently_accessed() {
        let cache = cache(2);
        let start = Instant::now();
        let a = key(AuthTier::Public, "/a");
        let b = key(AuthTier::Public, "/b");
        let c = key(AuthTier::Public, "/c");

        cache.set_at(a.clone(), Bytes::from_static(b"a"), None, None, start).unwrap();
        cache
            .set_at(b.clone(), Bytes::from_static(b"b"), None, None, start + Duration::from_secs(1))
            .unwrap();
        // Touch `a` so `b` becomes the LRU entry.
        assert!(cache.get_at(&a, start + Duration::from_secs(2)).is_some());
        cache
            .set_at(c.clone(), Bytes::from_static(b"c"), None, None, start + Duration::from_secs(3))
            .unwrap();

        let now = start + Duration::from_secs(4);
        assert!(cache.get_at(&a, now).is_some());
        assert!(cache.get_at(&b, now).is_none());
        assert!(cache.get_at(&c, now).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_pattern() {
        let cache = cache(10);
        for path in ["/api/quotes/1", "/api/quotes/2", "/api/contacts"] {
            cache.set(key(AuthTier::Public, path), Bytes::from_static(b"x"), None, None).unwrap();
        }
        assert_eq!(cache.invalidate_pattern("/api/quotes").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert!(matches!(
            cache.invalidate_pattern("("),
            Err(CacheError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cache = cache(10);
        let err = cache
            .set(key(AuthTier::Public, "/big"), Bytes::from(vec![0u8; 2048]), None, None)
            .unwrap_err();
        assert!(matches!(err, CacheError::PayloadTooLarge { size: 2048, max: 1024 }));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = cache(10);
        let start = Instant::now();
        cache
            .set_at(key(AuthTier::Public, "/short"), Bytes::new(), Some(Duration::from_secs(1)), None, start)
            .unwrap();
        cache
            .set_at(key(AuthTier::Public, "/long"), Bytes::new(), Some(Duration::from_secs(100)), None, start)
            .unwrap();
        assert_eq!(cache.sweep_expired_at(start + Duration::from_secs(2)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_realtime_paths_uncacheable() {
        assert!(!is_cacheable_path("/api/analytics/realtime"));
        assert!(!is_cacheable_path("/api/stats/realtime/visitors"));
        assert!(is_cacheable_path("/api/services"));
    }

    #[test]
    fn test_etag_format() {
        let etag = etag_for(b"hello");
        assert_eq!(etag.len(), 34);
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag, etag_for(b"hello"));
        assert_ne!(etag, etag_for(b"hello!"));
    }

    #[test]
    fn test_key_display() {
        let k = CacheKey::new(AuthTier::Frontend, "get", "/api/x", Some("page=2"));
        assert_eq!(k.to_string(), "frontend:GET:/api/x?page=2");
        assert_eq!(CacheKey::new(AuthTier::Public, "GET", "/", Some("")).query, None);
    }
}
