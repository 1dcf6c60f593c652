//! Multi-tier cache.
//!
//! Three levels: L1 is the in-process TTL map, L2 the remote key-value
//! store, L3 the database itself (the fallback function a caller supplies).
//! Reads promote upward; writes go to L1 and L2, never to L3.
//!
//! # Key namespaces
//!
//! - `repo:<table>:<op>:<args>` for cached entity reads
//! - `perm:<user>:<resource_type>:<resource_id>:<op>` for decisions

pub mod l1;
pub mod l2;

pub use l1::{CachePriority, L1Cache};
pub use l2::L2Cache;

use crate::errors::CoreError;
use crate::observability::metrics::{record_cache_invalidation, record_cache_lookup};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// The level a read was satisfied from. `L3` also tags a confirmed miss
/// (the fallback ran and found nothing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::L1 => "l1",
            CacheLevel::L2 => "l2",
            CacheLevel::L3 => "l3",
        }
    }
}

/// Aggregate statistics for the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l1_hit_rate: f64,
    pub l2_enabled: bool,
    pub l2_hit_rate: f64,
    pub l2_circuit: &'static str,
    /// Hit rates broken down by key namespace, across levels.
    pub by_namespace: Vec<NamespaceStats>,
}

/// Per-namespace lookup statistics (`repo:*` vs `perm:*` reads).
#[derive(Debug, Clone, serde::Serialize)]
pub struct NamespaceStats {
    pub namespace: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Cache key for an entity read.
pub fn repo_key(table: &str, op: &str, args: &str) -> String {
    format!("repo:{table}:{op}:{args}")
}

/// Cache key for an authorization decision.
pub fn perm_key(user_id: &str, resource_type: &str, resource_id: &str, op: &str) -> String {
    format!("perm:{user_id}:{resource_type}:{resource_id}:{op}")
}

/// Namespace of a cache key, from its prefix.
pub fn key_namespace(key: &str) -> &'static str {
    if key.starts_with("repo:") {
        "repo"
    } else if key.starts_with("perm:") {
        "perm"
    } else {
        "other"
    }
}

#[derive(Debug, Default)]
struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NamespaceCounters {
    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn report(&self, namespace: &'static str) -> NamespaceStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        NamespaceStats {
            namespace,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// One counter pair per namespace; a lookup counts as a hit when any level
/// satisfied it, and as a miss when it fell through to the source.
#[derive(Debug, Default)]
struct NamespaceTracker {
    repo: NamespaceCounters,
    perm: NamespaceCounters,
    other: NamespaceCounters,
}

impl NamespaceTracker {
    fn record(&self, key: &str, hit: bool) {
        match key_namespace(key) {
            "repo" => self.repo.record(hit),
            "perm" => self.perm.record(hit),
            _ => self.other.record(hit),
        }
    }

    fn report(&self) -> Vec<NamespaceStats> {
        vec![
            self.repo.report("repo"),
            self.perm.report("perm"),
            self.other.report("other"),
        ]
    }
}

/// Glob matching for pattern invalidation. Supports `*` (any run of
/// characters); everything else matches literally.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        let pc = pattern.get(p).copied();
        if pc == Some('*') {
            star = Some((p, t));
            p += 1;
        } else if pc.is_some() && pc == text.get(t).copied() {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = star {
            // Backtrack: let the last star absorb one more character
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while pattern.get(p).copied() == Some('*') {
        p += 1;
    }
    p == pattern.len()
}

pub struct TieredCache {
    l1: L1Cache,
    l2: Option<L2Cache>,
    namespaces: NamespaceTracker,
}

impl TieredCache {
    pub fn new(l2: Option<L2Cache>) -> Self {
        Self {
            l1: L1Cache::default(),
            l2,
            namespaces: NamespaceTracker::default(),
        }
    }

    pub fn with_l1(l1: L1Cache, l2: Option<L2Cache>) -> Self {
        Self {
            l1,
            l2,
            namespaces: NamespaceTracker::default(),
        }
    }

    /// Read-through lookup.
    ///
    /// 1. L1 hit: return it.
    /// 2. L2 hit (circuit permitting): promote to L1 with the L1 TTL.
    /// 3. Run the fallback. Its value (if any) is written to L1 and L2.
    ///
    /// A fallback *error* propagates; only a genuine absence returns
    /// `(None, L3)` - "not found" and "failed to fetch" are never conflated.
    pub async fn get_with_fallback<T, F, Fut>(
        &self,
        key: &str,
        priority: CachePriority,
        fallback: F,
    ) -> Result<(Option<T>, CacheLevel), CoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CoreError>>,
    {
        let namespace = key_namespace(key);

        if let Some(raw) = self.l1.get(key) {
            if let Ok(value) = serde_json::from_value::<T>(raw) {
                record_cache_lookup("l1", namespace, true);
                self.namespaces.record(key, true);
                return Ok((Some(value), CacheLevel::L1));
            }
            // Shape drifted; drop the stale entry and fall through
            self.l1.remove(key);
        }
        record_cache_lookup("l1", namespace, false);

        if let Some(l2) = &self.l2 {
            if let Some(raw) = l2.get(key).await {
                record_cache_lookup("l2", namespace, true);
                if let Ok(value) = serde_json::from_value::<T>(raw.clone()) {
                    self.l1.insert(key, raw, None, priority);
                    self.namespaces.record(key, true);
                    return Ok((Some(value), CacheLevel::L2));
                }
            } else {
                record_cache_lookup("l2", namespace, false);
            }
        }

        self.namespaces.record(key, false);
        let value = fallback().await?;

        if let Some(ref v) = value {
            if let Ok(raw) = serde_json::to_value(v) {
                self.l1.insert(key, raw.clone(), None, priority);
                if let Some(l2) = &self.l2 {
                    l2.set(key, &raw, None).await;
                }
            }
        }

        Ok((value, CacheLevel::L3))
    }

    /// Raw two-level lookup without a fallback, for callers that need to
    /// apply their own staleness rules (e.g. decision expiry) before
    /// trusting a hit. L2 hits are promoted to L1.
    pub async fn get_raw(&self, key: &str) -> Option<(serde_json::Value, CacheLevel)> {
        let namespace = key_namespace(key);

        if let Some(raw) = self.l1.get(key) {
            record_cache_lookup("l1", namespace, true);
            self.namespaces.record(key, true);
            return Some((raw, CacheLevel::L1));
        }
        record_cache_lookup("l1", namespace, false);

        if let Some(l2) = &self.l2 {
            if let Some(raw) = l2.get(key).await {
                record_cache_lookup("l2", namespace, true);
                self.l1.insert(key, raw.clone(), None, CachePriority::High);
                self.namespaces.record(key, true);
                return Some((raw, CacheLevel::L2));
            }
            record_cache_lookup("l2", namespace, false);
        }

        self.namespaces.record(key, false);
        None
    }

    /// Write a value to L1 and L2 (never to L3, which is upstream).
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, priority: CachePriority) {
        let Ok(raw) = serde_json::to_value(value) else {
            return;
        };
        self.l1.insert(key, raw.clone(), None, priority);
        if let Some(l2) = &self.l2 {
            l2.set(key, &raw, None).await;
        }
    }

    /// Remove matching entries: L1 synchronously, L2 in the background.
    /// Returns the count removed from L1.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let removed = self.l1.invalidate_pattern(pattern);
        if let Some(l2) = &self.l2 {
            l2.invalidate_pattern(pattern);
        }
        record_cache_invalidation(removed);
        removed
    }

    pub fn remove(&self, key: &str) {
        self.l1.remove(key);
        if let Some(l2) = &self.l2 {
            // Single-key removal rides the pattern path; the key is literal
            l2.invalidate_pattern(key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_entries: self.l1.len(),
            l1_hit_rate: self.l1.hit_rate(),
            l2_enabled: self.l2.is_some(),
            l2_hit_rate: self.l2.as_ref().map(L2Cache::hit_rate).unwrap_or(0.0),
            l2_circuit: self
                .l2
                .as_ref()
                .map(L2Cache::circuit_state)
                .unwrap_or("disabled"),
            by_namespace: self.namespaces.report(),
        }
    }
}
