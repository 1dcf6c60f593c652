//! Specialized connection pool manager.
//!
//! Six pools share one database but serve different workloads, each with its
//! own sizing, statement timeout, and session tuning. Every acquire is
//! leased: the lease records its duration on release and logs a leak warning
//! when a connection was held past the threshold. A per-pool circuit breaker
//! fails acquires fast while the pool is misbehaving, and a background loop
//! probes every pool with `SELECT 1` each 30 seconds.

use crate::config::Config;
use crate::db::circuit::CircuitBreaker;
use crate::errors::DbError;
use crate::observability::metrics::{record_pool_acquire, record_pool_lease_duration};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Executor;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pool acquire timeout.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Leases held longer than this are reported as likely leaks.
pub const LEAK_WARN_THRESHOLD: Duration = Duration::from_secs(60);

/// Interval of the background health loop.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Budget for a single health probe.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The six specialized workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Auth,
    Read,
    Write,
    Analytics,
    Admin,
    Batch,
}

impl PoolKind {
    pub const ALL: [PoolKind; 6] = [
        PoolKind::Auth,
        PoolKind::Read,
        PoolKind::Write,
        PoolKind::Analytics,
        PoolKind::Admin,
        PoolKind::Batch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Auth => "auth",
            PoolKind::Read => "read",
            PoolKind::Write => "write",
            PoolKind::Analytics => "analytics",
            PoolKind::Admin => "admin",
            PoolKind::Batch => "batch",
        }
    }

    /// Default (min, max) connections.
    pub fn sizing(&self) -> (u32, u32) {
        match self {
            PoolKind::Auth => (10, 50),
            PoolKind::Read => (20, 75),
            PoolKind::Write => (5, 25),
            PoolKind::Analytics => (5, 20),
            PoolKind::Admin => (2, 10),
            PoolKind::Batch => (5, 30),
        }
    }

    /// Server-side statement timeout for connections of this pool.
    pub fn statement_timeout(&self) -> Duration {
        match self {
            PoolKind::Auth => Duration::from_secs(30),
            PoolKind::Read => Duration::from_secs(60),
            PoolKind::Write => Duration::from_secs(120),
            PoolKind::Analytics => Duration::from_secs(5),
            PoolKind::Admin => Duration::from_secs(10),
            PoolKind::Batch => Duration::from_secs(30),
        }
    }

    /// Session work_mem tuned to the workload.
    pub fn work_mem(&self) -> &'static str {
        match self {
            PoolKind::Auth => "4MB",
            PoolKind::Read => "16MB",
            PoolKind::Write => "8MB",
            PoolKind::Analytics => "64MB",
            PoolKind::Admin => "16MB",
            PoolKind::Batch => "32MB",
        }
    }

    pub fn application_name(&self) -> String {
        format!("authz-{}", self.as_str())
    }
}

/// Health of a single pool as seen by the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Critical,
    Unavailable,
}

impl PoolHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Critical => "critical",
            PoolHealth::Unavailable => "unavailable",
        }
    }

    /// State transition applied after each probe: one failed or slow probe
    /// degrades, three consecutive failures are critical, persistent failure
    /// (six or more) marks the pool unavailable. Any success recovers fully.
    pub fn next(ok: bool, consecutive_failures: u32) -> PoolHealth {
        if ok {
            PoolHealth::Healthy
        } else if consecutive_failures >= 6 {
            PoolHealth::Unavailable
        } else if consecutive_failures >= 3 {
            PoolHealth::Critical
        } else {
            PoolHealth::Degraded
        }
    }
}

#[derive(Debug)]
struct HealthState {
    status: PoolHealth,
    consecutive_failures: u32,
}

struct PoolEntry {
    pool: PgPool,
    breaker: CircuitBreaker,
    health: RwLock<HealthState>,
}

/// Report row returned by [`PoolManager::health`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolHealthReport {
    pub pool: &'static str,
    pub status: PoolHealth,
    pub consecutive_failures: u32,
    pub circuit: &'static str,
}

/// Report row returned by [`PoolManager::metrics`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetricsReport {
    pub pool: &'static str,
    pub size: u32,
    pub idle: u32,
    pub max: u32,
    pub utilization: f64,
}

/// A leased connection. Recording happens on drop: the lease duration is
/// sampled, and anything held past [`LEAK_WARN_THRESHOLD`] is logged.
pub struct PoolLease {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
    kind: PoolKind,
    acquired_at: Instant,
}

impl PoolLease {
    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}

impl Deref for PoolLease {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.conn
    }
}

impl DerefMut for PoolLease {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        record_pool_lease_duration(self.kind.as_str(), held);
        if held > LEAK_WARN_THRESHOLD {
            warn!(
                target: "authz.db.pools",
                pool = self.kind.as_str(),
                held_secs = held.as_secs(),
                "Connection lease exceeded leak threshold"
            );
        }
    }
}

pub struct PoolManager {
    auth: PoolEntry,
    read: PoolEntry,
    write: PoolEntry,
    analytics: PoolEntry,
    admin: PoolEntry,
    batch: PoolEntry,
}

fn build_entry(config: &Config, kind: PoolKind) -> Result<PoolEntry, DbError> {
    let (mut min, mut max) = kind.sizing();
    if let Some(sizing) = config.pool_overrides.get(kind.as_str()) {
        min = sizing.min;
        max = sizing.max;
    }

    let app_name = kind.application_name();
    let stmt_timeout_ms = kind.statement_timeout().as_millis();
    let work_mem = kind.work_mem();

    let pool = PgPoolOptions::new()
        .min_connections(min)
        .max_connections(max)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .test_before_acquire(false)
        .after_connect(move |conn, _meta| {
            let app_name = app_name.clone();
            Box::pin(async move {
                conn.execute(format!("SET application_name = '{app_name}'").as_str())
                    .await?;
                conn.execute(format!("SET statement_timeout = '{stmt_timeout_ms}ms'").as_str())
                    .await?;
                conn.execute(format!("SET work_mem = '{work_mem}'").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect_lazy(&config.database_url)
        .map_err(|e| DbError::Unavailable(format!("pool setup failed: {e}")))?;

    Ok(PoolEntry {
        pool,
        breaker: CircuitBreaker::new(kind.as_str()),
        health: RwLock::new(HealthState {
            status: PoolHealth::Healthy,
            consecutive_failures: 0,
        }),
    })
}

impl PoolManager {
    /// Connect all six pools. Each connection runs its session setup once in
    /// `after_connect`: application name, statement timeout, work_mem.
    pub async fn connect(config: &Config) -> Result<Arc<PoolManager>, DbError> {
        let manager = PoolManager {
            auth: build_entry(config, PoolKind::Auth)?,
            read: build_entry(config, PoolKind::Read)?,
            write: build_entry(config, PoolKind::Write)?,
            analytics: build_entry(config, PoolKind::Analytics)?,
            admin: build_entry(config, PoolKind::Admin)?,
            batch: build_entry(config, PoolKind::Batch)?,
        };

        info!(
            target: "authz.db.pools",
            pools = PoolKind::ALL.len(),
            "Connection pools initialized"
        );

        Ok(Arc::new(manager))
    }

    fn entry(&self, kind: PoolKind) -> &PoolEntry {
        match kind {
            PoolKind::Auth => &self.auth,
            PoolKind::Read => &self.read,
            PoolKind::Write => &self.write,
            PoolKind::Analytics => &self.analytics,
            PoolKind::Admin => &self.admin,
            PoolKind::Batch => &self.batch,
        }
    }

    /// Raw pool handle, used by the health loop and by warmup queries.
    pub fn pool(&self, kind: PoolKind) -> &PgPool {
        &self.entry(kind).pool
    }

    /// Acquire a leased connection from the given pool.
    ///
    /// Fails fast with `Unavailable` while the pool's circuit is open.
    pub async fn acquire(&self, kind: PoolKind) -> Result<PoolLease, DbError> {
        let entry = self.entry(kind);

        if !entry.breaker.try_acquire() {
            record_pool_acquire(kind.as_str(), "rejected");
            return Err(DbError::Unavailable(format!(
                "{} pool circuit open",
                kind.as_str()
            )));
        }

        match tokio::time::timeout(ACQUIRE_TIMEOUT, entry.pool.acquire()).await {
            Ok(Ok(conn)) => {
                entry.breaker.record_success();
                record_pool_acquire(kind.as_str(), "ok");
                Ok(PoolLease {
                    conn,
                    kind,
                    acquired_at: Instant::now(),
                })
            }
            Ok(Err(e)) => {
                entry.breaker.record_failure();
                record_pool_acquire(kind.as_str(), "error");
                Err(DbError::classify(&e))
            }
            Err(_) => {
                entry.breaker.record_failure();
                record_pool_acquire(kind.as_str(), "timeout");
                Err(DbError::Unavailable(format!(
                    "{} pool acquire timed out",
                    kind.as_str()
                )))
            }
        }
    }

    /// Report a query outcome against the pool's circuit. Only
    /// infrastructure-level failures count; constraint violations and policy
    /// denials say nothing about pool health.
    pub fn record_query_outcome(&self, kind: PoolKind, err: Option<&DbError>) {
        let entry = self.entry(kind);
        match err {
            None => entry.breaker.record_success(),
            Some(DbError::Timeout { .. }) | Some(DbError::Unavailable(_)) => {
                entry.breaker.record_failure();
            }
            Some(_) => entry.breaker.record_success(),
        }
    }

    /// Background health loop: `SELECT 1` on every pool each 30 seconds.
    /// Exits when the cancellation token fires.
    pub async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for kind in PoolKind::ALL {
                        self.probe_pool(kind).await;
                    }
                }
                _ = cancel.cancelled() => {
                    info!(
                        target: "authz.db.pools",
                        "Pool health loop received shutdown signal, exiting"
                    );
                    break;
                }
            }
        }
    }

    async fn probe_pool(&self, kind: PoolKind) {
        let entry = self.entry(kind);
        let ok = matches!(
            tokio::time::timeout(
                HEALTH_PROBE_TIMEOUT,
                sqlx::query("SELECT 1").execute(&entry.pool),
            )
            .await,
            Ok(Ok(_))
        );

        let Ok(mut health) = entry.health.write() else {
            return;
        };

        if ok {
            health.consecutive_failures = 0;
        } else {
            health.consecutive_failures += 1;
        }
        let next = PoolHealth::next(ok, health.consecutive_failures);
        if next != health.status {
            if next == PoolHealth::Healthy {
                info!(
                    target: "authz.db.pools",
                    pool = kind.as_str(),
                    "Pool recovered"
                );
            } else {
                error!(
                    target: "authz.db.pools",
                    pool = kind.as_str(),
                    status = next.as_str(),
                    consecutive_failures = health.consecutive_failures,
                    "Pool health degraded"
                );
            }
        }
        health.status = next;
    }

    /// Health snapshot across all pools.
    pub fn health(&self) -> Vec<PoolHealthReport> {
        PoolKind::ALL
            .iter()
            .map(|kind| {
                let entry = self.entry(*kind);
                let (status, consecutive_failures) = entry
                    .health
                    .read()
                    .map(|h| (h.status, h.consecutive_failures))
                    .unwrap_or((PoolHealth::Unavailable, 0));
                PoolHealthReport {
                    pool: kind.as_str(),
                    status,
                    consecutive_failures,
                    circuit: entry.breaker.state().as_str(),
                }
            })
            .collect()
    }

    /// Utilization snapshot across all pools.
    pub fn metrics(&self) -> Vec<PoolMetricsReport> {
        PoolKind::ALL
            .iter()
            .map(|kind| {
                let entry = self.entry(*kind);
                let (_, max) = kind.sizing();
                let size = entry.pool.size();
                let idle = u32::try_from(entry.pool.num_idle()).unwrap_or(0);
                let in_use = size.saturating_sub(idle);
                PoolMetricsReport {
                    pool: kind.as_str(),
                    size,
                    idle,
                    max,
                    utilization: if max == 0 {
                        0.0
                    } else {
                        f64::from(in_use) / f64::from(max)
                    },
                }
            })
            .collect()
    }

    /// Worst health status across pools, for the aggregate health surface.
    pub fn overall_health(&self) -> PoolHealth {
        self.health()
            .into_iter()
            .map(|report| report.status)
            .max_by_key(|status| match status {
                PoolHealth::Healthy => 0,
                PoolHealth::Degraded => 1,
                PoolHealth::Critical => 2,
                PoolHealth::Unavailable => 3,
            })
            .unwrap_or(PoolHealth::Unavailable)
    }
}
