//! Composition root and inbound operation surface.
//!
//! [`AuthzCore`] constructs every component exactly once, in dependency
//! order (token validator → credential gate → pools → executor → cache →
//! resolver → authorization engine → credit engine, with the performance
//! monitor observing all of them), owns the background tasks, and exposes
//! the operation surface the host embeds behind its transport.
//!
//! There are no module-level singletons: everything lives in this struct
//! and dies with [`AuthzCore::shutdown`].

use crate::cache::{repo_key, CachePriority, CacheStats, L2Cache, TieredCache};
use crate::config::Config;
use crate::credential::{CredentialGate, CredentialProbe, GateStats, DEFAULT_PROBE_TIMEOUT};
use crate::db::executor::{QueryExecutor, QueryRequest, SqlParam, BATCH_TIMEOUT};
use crate::db::pools::{PoolHealth, PoolHealthReport, PoolKind, PoolManager, PoolMetricsReport};
use crate::errors::{CoreError, DbError, ForbiddenReason};
use crate::models::{
    AccessOp, AuthorizationDecision, DecisionMethod, LedgerKind, ResourceType, TeamMembership,
    User,
};
use crate::observability::metrics::record_token_validation;
use crate::observability::monitor::{
    Alert, AlertSink, OperationSample, OperationStats, PerformanceMonitor, SampleType,
    TracingSink, WebhookSink, EVALUATION_WINDOW,
};
use crate::services::authorization_service::AuthorizationEngine;
use crate::services::credit_service::{CreditEngine, CreditOutcome, CreditTransaction};
use crate::services::user_service::UserResolver;
use crate::token::{TokenValidator, ValidatedToken};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Startup budget for best-effort cache warming.
const WARMUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Rows preloaded per warming pattern.
const WARMUP_BATCH: i64 = 256;

/// Aggregate service health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub overall: &'static str,
    pub pools: Vec<PoolHealthReport>,
    pub cache: CacheStats,
    pub credential_gate: GateStats,
    pub reconciliation_backlog: usize,
}

/// Aggregate operational metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsReport {
    pub operations: Vec<OperationStats>,
    pub alerts_active: Vec<Alert>,
    pub pools: Vec<PoolMetricsReport>,
}

/// Receipt for a credit movement.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CreditReceipt {
    pub new_balance: i32,
    pub ledger_entry_id: Option<Uuid>,
}

/// The privileged probe: a bounded read through the auth pool that only
/// succeeds while the service credential is accepted by the datastore.
struct PoolCredentialProbe {
    pools: Arc<PoolManager>,
}

impl CredentialProbe for PoolCredentialProbe {
    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), DbError>> + Send + '_>> {
        Box::pin(async move {
            let mut lease = self.pools.acquire(PoolKind::Auth).await?;
            sqlx::query("SELECT 1")
                .execute(&mut *lease)
                .await
                .map_err(|e| DbError::classify(&e))?;
            Ok(())
        })
    }
}

pub struct AuthzCore {
    config: Config,
    validator: Arc<TokenValidator>,
    gate: Arc<CredentialGate>,
    pools: Arc<PoolManager>,
    cache: Arc<TieredCache>,
    users: Arc<UserResolver>,
    authz: Arc<AuthorizationEngine>,
    credits: Arc<CreditEngine>,
    monitor: Arc<PerformanceMonitor>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AuthzCore {
    /// Construct and start the core: connect pools, attach the cache,
    /// spawn the health, monitoring, and warming tasks.
    pub async fn start(config: Config) -> Result<AuthzCore, CoreError> {
        info!(target: "authz.core", env = ?config.env, "Starting authorization core");

        let validator = Arc::new(TokenValidator::from_config(&config));

        let pools = PoolManager::connect(&config).await.map_err(CoreError::from)?;

        let gate = Arc::new(CredentialGate::new(
            Arc::new(PoolCredentialProbe {
                pools: pools.clone(),
            }),
            config.service_credential_raw(),
            config.service_cred_ttl,
            DEFAULT_PROBE_TIMEOUT,
        ));

        let executor = Arc::new(QueryExecutor::new(pools.clone(), gate.clone()));

        // L2 is optional twice over: unconfigured, or configured but down.
        // The core stays correct without it.
        let l2 = match &config.kv_url {
            Some(url) => match L2Cache::connect(url).await {
                Ok(l2) => Some(l2),
                Err(e) => {
                    warn!(
                        target: "authz.core",
                        error = %e,
                        "L2 cache unavailable at startup; continuing with L1 only"
                    );
                    None
                }
            },
            None => None,
        };
        let cache = Arc::new(TieredCache::new(l2));

        let users = Arc::new(UserResolver::new(
            executor.clone(),
            cache.clone(),
            config.default_user_credits,
            config.emergency_user_allowlist.clone(),
        ));
        let authz = Arc::new(AuthorizationEngine::new(
            executor.clone(),
            cache.clone(),
            config.enable_escalation_guards,
        ));
        let credits = Arc::new(CreditEngine::new(executor.clone(), cache.clone()));

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(TracingSink)];
        if let Some(url) = &config.alert_webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url.clone())));
        }
        let monitor = PerformanceMonitor::new(sinks);

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            pools.clone().health_loop(cancel.child_token()),
        ));

        {
            let cache = cache.clone();
            let pools_for_inputs = pools.clone();
            tasks.push(tokio::spawn(monitor.clone().run(
                cancel.child_token(),
                move || {
                    let stats = cache.stats();
                    let hit_rate = if stats.l1_hit_rate > 0.0 || stats.l2_hit_rate > 0.0 {
                        Some(stats.l1_hit_rate.max(stats.l2_hit_rate))
                    } else {
                        None
                    };
                    let utilization = pools_for_inputs
                        .metrics()
                        .into_iter()
                        .map(|m| m.utilization)
                        .fold(None, |acc: Option<f64>, u| {
                            Some(acc.map_or(u, |a| a.max(u)))
                        });
                    (hit_rate, utilization)
                },
            )));
        }

        {
            let executor = executor.clone();
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                if tokio::time::timeout(WARMUP_TIMEOUT, warm_cache(&executor, &cache))
                    .await
                    .is_err()
                {
                    warn!(
                        target: "authz.core",
                        budget_secs = WARMUP_TIMEOUT.as_secs(),
                        "Cache warming exceeded its budget, continuing cold"
                    );
                }
            }));
        }

        info!(target: "authz.core", "Authorization core started");

        Ok(AuthzCore {
            config,
            validator,
            gate,
            pools,
            cache,
            users,
            authz,
            credits,
            monitor,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Stop background tasks and close every pool.
    pub async fn shutdown(&self) {
        info!(target: "authz.core", "Shutting down authorization core");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let Ok(mut tasks) = self.tasks.lock() else {
                return;
            };
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        for kind in PoolKind::ALL {
            self.pools.pool(kind).close().await;
        }
        info!(target: "authz.core", "Shutdown complete");
    }

    /// Decide whether the caller may perform `op` on a resource.
    ///
    /// A granted decision comes back as `Ok`; a denial surfaces as
    /// `Forbidden` with the decision's reason. Unknown resources are
    /// `NotFound`, never `Forbidden`.
    pub async fn authorize(
        &self,
        token: &str,
        claimed_user_id: Uuid,
        resource_type: ResourceType,
        resource_id: &str,
        op: AccessOp,
        deadline: Option<Duration>,
    ) -> Result<AuthorizationDecision, CoreError> {
        let deadline = deadline.unwrap_or(self.config.auth_deadline);
        let started = Instant::now();

        let result = match tokio::time::timeout(
            deadline,
            self.authorize_inner(token, claimed_user_id, resource_type, resource_id, op),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::DeadlineExceeded),
        };

        let cache_hit = matches!(
            &result,
            Ok(decision)
                if matches!(decision.method, DecisionMethod::CacheL1 | DecisionMethod::CacheL2)
        );
        self.monitor.record(
            OperationSample::new(SampleType::Authorization, started.elapsed(), result.is_ok())
                .with_cache_hit(cache_hit),
        );

        result
    }

    async fn authorize_inner(
        &self,
        token: &str,
        claimed_user_id: Uuid,
        resource_type: ResourceType,
        resource_id: &str,
        op: AccessOp,
    ) -> Result<AuthorizationDecision, CoreError> {
        let validated = self.validate_token(token, claimed_user_id)?;

        // First authenticated access provisions the user record
        self.users
            .ensure_user(validated.user_id, None, Some(&validated))
            .await?;

        let decision = self
            .authz
            .authorize(
                validated.user_id,
                resource_type,
                resource_id,
                op,
                Some(&validated),
            )
            .await?;

        if decision.granted {
            Ok(decision)
        } else {
            Err(CoreError::Forbidden {
                reason: decision.deny_reason.unwrap_or(ForbiddenReason::DefaultDeny),
            })
        }
    }

    /// Fetch the caller's user record, auto-provisioning it when absent.
    pub async fn get_user(
        &self,
        token: &str,
        user_id: Uuid,
        deadline: Option<Duration>,
    ) -> Result<User, CoreError> {
        let deadline = deadline.unwrap_or(self.config.general_deadline);
        let started = Instant::now();

        let result = match tokio::time::timeout(deadline, async {
            let validated = self.validate_token(token, user_id)?;
            self.users
                .ensure_user(validated.user_id, None, Some(&validated))
                .await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::DeadlineExceeded),
        };

        self.monitor.record(OperationSample::new(
            SampleType::UserLookup,
            started.elapsed(),
            result.is_ok(),
        ));

        result
    }

    /// Spend credits: validate, atomically deduct, append a ledger entry.
    #[allow(clippy::too_many_arguments)] // the operation surface is the contract
    pub async fn spend_credits(
        &self,
        token: &str,
        user_id: Uuid,
        amount: i32,
        kind: LedgerKind,
        generation_id: Option<Uuid>,
        idempotency_key: Option<String>,
        deadline: Option<Duration>,
    ) -> Result<CreditReceipt, CoreError> {
        let deadline = deadline.unwrap_or(self.config.general_deadline);
        let started = Instant::now();

        let result = match tokio::time::timeout(deadline, async {
            let validated = self.validate_token(token, user_id)?;
            let tx = CreditTransaction {
                user_id: validated.user_id,
                amount,
                kind,
                generation_id,
                description: format!("{} of {amount} credits", kind.as_str()),
                metadata: serde_json::json!({}),
                idempotency_key,
                token: None,
            };
            self.credits.deduct(tx, Some(&validated)).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::DeadlineExceeded),
        };

        self.monitor.record(OperationSample::new(
            SampleType::CreditTransaction,
            started.elapsed(),
            result.is_ok(),
        ));

        result.map(|outcome| receipt(&outcome))
    }

    /// Grant credits (purchase, refund, bonus, referral).
    #[allow(clippy::too_many_arguments)] // the operation surface is the contract
    pub async fn grant_credits(
        &self,
        token: &str,
        user_id: Uuid,
        amount: i32,
        kind: LedgerKind,
        metadata: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<CreditReceipt, CoreError> {
        let deadline = deadline.unwrap_or(self.config.general_deadline);
        let started = Instant::now();

        let result = match tokio::time::timeout(deadline, async {
            let validated = self.validate_token(token, user_id)?;
            let tx = CreditTransaction {
                user_id: validated.user_id,
                amount,
                kind,
                generation_id: None,
                description: format!("{} of {amount} credits", kind.as_str()),
                metadata,
                idempotency_key: None,
                token: None,
            };
            self.credits.add(tx, Some(&validated)).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::DeadlineExceeded),
        };

        self.monitor.record(OperationSample::new(
            SampleType::CreditTransaction,
            started.elapsed(),
            result.is_ok(),
        ));

        result.map(|outcome| receipt(&outcome))
    }

    /// Aggregate health: pools, cache, credential gate, ledger backlog.
    pub async fn health(&self) -> HealthReport {
        let pools = self.pools.health();
        let overall = match self.pools.overall_health() {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Critical => "critical",
            PoolHealth::Unavailable => "unavailable",
        };

        HealthReport {
            overall,
            pools,
            cache: self.cache.stats(),
            credential_gate: self.gate.stats().await,
            reconciliation_backlog: self.credits.reconciliation_backlog(),
        }
    }

    /// Rolling operation statistics and active alerts.
    pub fn metrics(&self) -> MetricsReport {
        MetricsReport {
            operations: self.monitor.stats(EVALUATION_WINDOW),
            alerts_active: self.monitor.active_alerts(),
            pools: self.pools.metrics(),
        }
    }

    /// Direct component access for hosts that compose their own flows.
    pub fn users(&self) -> &Arc<UserResolver> {
        &self.users
    }

    pub fn authorization(&self) -> &Arc<AuthorizationEngine> {
        &self.authz
    }

    pub fn credits(&self) -> &Arc<CreditEngine> {
        &self.credits
    }

    pub fn validator(&self) -> &Arc<TokenValidator> {
        &self.validator
    }

    fn validate_token(
        &self,
        token: &str,
        claimed_user_id: Uuid,
    ) -> Result<ValidatedToken, CoreError> {
        match self.validator.validate(token, claimed_user_id) {
            Ok(validated) => {
                record_token_validation(validated.variant.as_str(), "success");
                Ok(validated)
            }
            Err(reason) => {
                record_token_validation("unknown", "error");
                Err(CoreError::Unauthenticated { reason })
            }
        }
    }
}

fn receipt(outcome: &CreditOutcome) -> CreditReceipt {
    CreditReceipt {
        new_balance: outcome.new_balance,
        ledger_entry_id: outcome.ledger_entry_id,
    }
}

/// Best-effort warming of hot read patterns: recently active users (by
/// ledger activity) and active team memberships. Runs inside the warmup
/// budget; failures only log.
async fn warm_cache(executor: &Arc<QueryExecutor>, cache: &Arc<TieredCache>) {
    let memberships = QueryRequest::select("team_members", PoolKind::Read, "warmup_memberships")
        .filter("is_active", SqlParam::Bool(true))
        .order_by("joined_at", true)
        .limit(WARMUP_BATCH)
        .with_timeout(BATCH_TIMEOUT)
        .privileged();

    match executor.fetch_all::<TeamMembership>(memberships).await {
        Ok(rows) => {
            let count = rows.len();
            for row in rows {
                let key = repo_key(
                    "team_members",
                    "select",
                    &format!("{}:{}", row.user_id, row.team_id),
                );
                cache.set(&key, &Some(row), CachePriority::High).await;
            }
            info!(
                target: "authz.core",
                warmed = count,
                "Warmed team membership cache"
            );
        }
        Err(e) => warn!(
            target: "authz.core",
            error = %e,
            "Membership warmup query failed"
        ),
    }

    let users = QueryRequest::select("users", PoolKind::Read, "warmup_users")
        .order_by("updated_at", true)
        .limit(WARMUP_BATCH)
        .with_timeout(BATCH_TIMEOUT)
        .privileged();

    match executor.fetch_all::<User>(users).await {
        Ok(rows) => {
            let count = rows.len();
            for row in rows {
                let key = repo_key("users", "select", &row.id.to_string());
                cache.set(&key, &Some(row), CachePriority::High).await;
            }
            info!(
                target: "authz.core",
                warmed = count,
                "Warmed user cache"
            );
        }
        Err(e) => warn!(
            target: "authz.core",
            error = %e,
            "User warmup query failed"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_carries_ledger_id() {
        let outcome = CreditOutcome {
            new_balance: 55,
            ledger_entry_id: Some(Uuid::new_v4()),
        };
        let receipt = receipt(&outcome);
        assert_eq!(receipt.new_balance, 55);
        assert!(receipt.ledger_entry_id.is_some());
    }

    #[test]
    fn test_warmup_budget_is_bounded() {
        assert!(WARMUP_TIMEOUT <= Duration::from_secs(30));
        assert!(WARMUP_BATCH > 0);
    }
}
