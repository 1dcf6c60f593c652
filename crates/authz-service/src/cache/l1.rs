//! In-process cache level.
//!
//! A bounded TTL map behind a reader/writer lock; readers do not block each
//! other. When full, the entry expiring soonest is evicted first. Values are
//! stored as JSON so one map serves every cached shape (users, balances,
//! authorization decisions).

use super::glob_match;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default L1 TTL (5 minutes).
pub const DEFAULT_L1_TTL: Duration = Duration::from_secs(300);

/// Bounded entry count.
pub const DEFAULT_L1_MAX_ENTRIES: usize = 10_000;

/// Retention priority of an entry. Currently advisory (carried for
/// observability and future eviction tuning); eviction order is
/// oldest-expiring-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CachePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl CachePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePriority::Low => "low",
            CachePriority::Medium => "medium",
            CachePriority::High => "high",
            CachePriority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
    #[allow(dead_code)] // read by stats/debug tooling
    priority: CachePriority,
}

#[derive(Debug)]
pub struct L1Cache {
    entries: RwLock<HashMap<String, Entry>>,
    max_entries: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new(DEFAULT_L1_MAX_ENTRIES, DEFAULT_L1_TTL)
    }
}

impl L1Cache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read an entry. Expired entries count as misses and are left for the
    /// next insert to sweep, so reads stay on the shared lock.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().ok()?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        ttl: Option<Duration>,
        priority: CachePriority,
    ) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        let now = Instant::now();
        // Sweep expired entries before considering eviction
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.len() >= self.max_entries {
            // Evict the entry expiring soonest
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&victim);
            }
        }

        entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: now + ttl.unwrap_or(self.default_ttl),
                priority,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Remove every entry whose key matches the glob pattern. Returns the
    /// number removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_after_insert() {
        let cache = L1Cache::default();
        cache.insert("k1", json!({"a": 1}), None, CachePriority::Medium);
        assert_eq!(cache.get("k1"), Some(json!({"a": 1})));
        assert_eq!(cache.get("k2"), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = L1Cache::default();
        cache.insert(
            "short",
            json!(true),
            Some(Duration::from_millis(0)),
            CachePriority::Low,
        );
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("short"), None);
    }

    #[test]
    fn test_eviction_prefers_oldest_expiring() {
        let cache = L1Cache::new(2, DEFAULT_L1_TTL);
        cache.insert(
            "soon",
            json!(1),
            Some(Duration::from_secs(10)),
            CachePriority::Critical,
        );
        cache.insert(
            "later",
            json!(2),
            Some(Duration::from_secs(600)),
            CachePriority::Low,
        );
        // Map is full; "soon" expires first and is the eviction victim
        cache.insert(
            "newest",
            json!(3),
            Some(Duration::from_secs(300)),
            CachePriority::Medium,
        );

        assert_eq!(cache.get("soon"), None);
        assert_eq!(cache.get("later"), Some(json!(2)));
        assert_eq!(cache.get("newest"), Some(json!(3)));
    }

    #[test]
    fn test_pattern_invalidation_counts_removals() {
        let cache = L1Cache::default();
        cache.insert("perm:u1:generation:g1:read", json!(1), None, CachePriority::Critical);
        cache.insert("perm:u1:generation:g2:read", json!(2), None, CachePriority::Critical);
        cache.insert("perm:u2:generation:g1:read", json!(3), None, CachePriority::Critical);
        cache.insert("repo:users:select:u1", json!(4), None, CachePriority::High);

        assert_eq!(cache.invalidate_pattern("perm:u1:*"), 2);
        assert_eq!(cache.get("perm:u1:generation:g1:read"), None);
        assert_eq!(cache.get("perm:u2:generation:g1:read"), Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_remove() {
        let cache = L1Cache::default();
        cache.insert("k", json!(1), None, CachePriority::Low);
        assert!(cache.remove("k"));
        assert!(!cache.remove("k"));
    }

    #[test]
    fn test_hit_rate_tracking() {
        let cache = L1Cache::default();
        cache.insert("k", json!(1), None, CachePriority::Low);
        let _ = cache.get("k");
        let _ = cache.get("k");
        let _ = cache.get("missing");
        let rate = cache.hit_rate();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
