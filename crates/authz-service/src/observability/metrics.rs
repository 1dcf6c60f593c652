//! Metrics definitions for the authorization core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `authz_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `pool`: 6 values (auth, read, write, analytics, admin, batch)
//! - `operation`: bounded by code (select, insert, update, delete, rpc)
//! - `table`: bounded by schema (~6 tables)
//! - `status`/`outcome`: small fixed sets
//! - `level`: 2 values (l1, l2)
//! - `namespace`: 3 values (repo, perm, other)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Database Metrics
// ============================================================================

/// Record database query execution
///
/// Metric: `authz_db_query_duration_seconds`, `authz_db_queries_total`
/// Labels: `operation`, `table`, `status`
pub fn record_db_query(operation: &str, table: &str, status: &str, duration: Duration) {
    histogram!("authz_db_query_duration_seconds", "operation" => operation.to_string(), "table" => table.to_string())
        .record(duration.as_secs_f64());

    counter!("authz_db_queries_total", "operation" => operation.to_string(), "table" => table.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a pool acquire outcome
///
/// Metric: `authz_pool_acquires_total`
/// Labels: `pool`, `outcome` (ok, error, timeout, rejected)
pub fn record_pool_acquire(pool: &str, outcome: &str) {
    counter!("authz_pool_acquires_total", "pool" => pool.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record how long a connection lease was held
///
/// Metric: `authz_pool_lease_duration_seconds`
/// Labels: `pool`
pub fn record_pool_lease_duration(pool: &str, duration: Duration) {
    histogram!("authz_pool_lease_duration_seconds", "pool" => pool.to_string())
        .record(duration.as_secs_f64());
}

/// Update a pool utilization gauge
///
/// Metric: `authz_pool_utilization`
/// Labels: `pool`
pub fn set_pool_utilization(pool: &str, utilization: f64) {
    gauge!("authz_pool_utilization", "pool" => pool.to_string()).set(utilization);
}

// ============================================================================
// Cache Metrics
// ============================================================================

/// Record a cache lookup at a given level
///
/// Metric: `authz_cache_lookups_total`
/// Labels: `level` (l1, l2), `namespace` (repo, perm, other), `outcome`
/// (hit, miss)
pub fn record_cache_lookup(level: &str, namespace: &'static str, hit: bool) {
    counter!("authz_cache_lookups_total",
        "level" => level.to_string(),
        "namespace" => namespace,
        "outcome" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record a cache pattern invalidation
///
/// Metric: `authz_cache_invalidations_total`
/// Labels: none (patterns are unbounded; counted without the pattern label)
pub fn record_cache_invalidation(removed: usize) {
    counter!("authz_cache_invalidations_total").increment(1);
    counter!("authz_cache_invalidated_entries_total").increment(removed as u64);
}

// ============================================================================
// Authorization Metrics
// ============================================================================

/// Record an authorization decision
///
/// Metric: `authz_decisions_total`, `authz_decision_duration_seconds`
/// Labels: `method` (cache_l1, materialized_view, ...), `granted`
pub fn record_authorization(method: &str, granted: bool, duration: Duration) {
    histogram!("authz_decision_duration_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
    counter!("authz_decisions_total", "method" => method.to_string(), "granted" => if granted { "true" } else { "false" })
        .increment(1);
}

/// Record a blocked privilege-escalation or enumeration attempt
///
/// Metric: `authz_security_events_total`
/// Labels: `kind` (admin_op_blocked, enumeration_blocked)
///
/// ALERT: sustained non-zero rate warrants investigation
pub fn record_security_event(kind: &str) {
    counter!("authz_security_events_total", "kind" => kind.to_string()).increment(1);
}

// ============================================================================
// Token Metrics
// ============================================================================

/// Record token validation result
///
/// Metric: `authz_token_validations_total`
/// Labels: `variant` (jwt, provider, dev), `status` (success, error)
pub fn record_token_validation(variant: &str, status: &str) {
    counter!("authz_token_validations_total", "variant" => variant.to_string(), "status" => status.to_string())
        .increment(1);
}

// ============================================================================
// Credit Metrics
// ============================================================================

/// Record a credit transaction outcome
///
/// Metric: `authz_credit_transactions_total`
/// Labels: `kind` (usage, purchase, ...), `outcome` (success, insufficient,
/// error)
pub fn record_credit_transaction(kind: &str, outcome: &str) {
    counter!("authz_credit_transactions_total", "kind" => kind.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a ledger append failure routed to the reconciliation queue
///
/// Metric: `authz_ledger_append_failures_total`
///
/// ALERT: any sustained non-zero value means the audit trail is lagging
pub fn record_ledger_append_failure() {
    counter!("authz_ledger_append_failures_total").increment(1);
}
