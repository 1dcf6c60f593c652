//! Remote key-value cache level (Redis protocol).
//!
//! The multiplexed connection is cheap to clone and safe for concurrent use;
//! each operation clones it rather than locking. A circuit breaker guards
//! the level: after five consecutive errors the level is skipped for 30
//! seconds, and skipped means *absent*, never an error - no L2 failure is
//! allowed to reach a caller.

use crate::db::circuit::CircuitBreaker;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default L2 TTL (15 minutes).
pub const DEFAULT_L2_TTL: Duration = Duration::from_secs(900);

/// Per-operation timeout. The healthy-path target is single-digit
/// milliseconds; anything slower than this is treated as a miss.
pub const L2_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Batch size for SCAN-based pattern invalidation.
const SCAN_COUNT: usize = 100;

pub struct L2Cache {
    connection: MultiplexedConnection,
    breaker: CircuitBreaker,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl L2Cache {
    /// Connect to the key-value store.
    ///
    /// The URL is never logged; it may contain credentials.
    pub async fn connect(url: &str) -> Result<L2Cache, String> {
        let client = redis::Client::open(url).map_err(|e| {
            error!(
                target: "authz.cache.l2",
                error = %e,
                "Failed to open key-value client"
            );
            format!("failed to open key-value client: {e}")
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "authz.cache.l2",
                    error = %e,
                    "Failed to connect to key-value store"
                );
                format!("failed to connect to key-value store: {e}")
            })?;

        Ok(L2Cache {
            connection,
            breaker: CircuitBreaker::new("cache_l2"),
            default_ttl: DEFAULT_L2_TTL,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Read a value. Errors, timeouts, and an open circuit all read as
    /// `None`.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if !self.breaker.try_acquire() {
            return None;
        }

        let mut conn = self.connection.clone();
        let result: Result<Option<String>, _> =
            match tokio::time::timeout(L2_OP_TIMEOUT, conn.get(key)).await {
                Ok(result) => result,
                Err(_) => {
                    self.breaker.record_failure();
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };

        match result {
            Ok(Some(raw)) => {
                self.breaker.record_success();
                match serde_json::from_str(&raw) {
                    Ok(value) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(value)
                    }
                    Err(e) => {
                        warn!(
                            target: "authz.cache.l2",
                            error = %e,
                            "Dropping undecodable cache value"
                        );
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            Ok(None) => {
                self.breaker.record_success();
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(
                    target: "authz.cache.l2",
                    error = %e,
                    "Key-value read failed"
                );
                self.breaker.record_failure();
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Best-effort write. Failures feed the breaker and are otherwise
    /// swallowed.
    pub async fn set(&self, key: &str, value: &serde_json::Value, ttl: Option<Duration>) {
        if !self.breaker.try_acquire() {
            return;
        }

        let raw = value.to_string();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut conn = self.connection.clone();

        let result: Result<Result<(), _>, _> = tokio::time::timeout(
            L2_OP_TIMEOUT,
            conn.set_ex(key, raw, ttl.as_secs()),
        )
        .await;

        match result {
            Ok(Ok(())) => self.breaker.record_success(),
            Ok(Err(e)) => {
                warn!(
                    target: "authz.cache.l2",
                    error = %e,
                    "Key-value write failed"
                );
                self.breaker.record_failure();
            }
            Err(_) => self.breaker.record_failure(),
        }
    }

    /// Asynchronous pattern invalidation: a background task SCANs for
    /// matching keys and deletes them in batches. Returns immediately.
    pub fn invalidate_pattern(&self, pattern: &str) {
        if self.breaker.is_open() {
            return;
        }

        let mut conn = self.connection.clone();
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut cursor: u64 = 0;
            let mut removed: usize = 0;
            loop {
                let reply: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await;

                let (next, keys) = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(
                            target: "authz.cache.l2",
                            error = %e,
                            "Pattern invalidation scan failed"
                        );
                        return;
                    }
                };

                if !keys.is_empty() {
                    removed += keys.len();
                    let del: Result<(), _> = conn.del(&keys).await;
                    if let Err(e) = del {
                        warn!(
                            target: "authz.cache.l2",
                            error = %e,
                            "Pattern invalidation delete failed"
                        );
                        return;
                    }
                }

                cursor = next;
                if cursor == 0 {
                    break;
                }
            }

            debug!(
                target: "authz.cache.l2",
                pattern = %pattern,
                removed = removed,
                "Pattern invalidation complete"
            );
        });
    }

    pub fn circuit_state(&self) -> &'static str {
        self.breaker.state().as_str()
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
