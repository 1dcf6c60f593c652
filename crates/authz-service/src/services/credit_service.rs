//! Credit transaction engine.
//!
//! Deductions are a single conditional decrement (`deduct_credits` in the
//! schema): either one row comes back with the new balance, or zero rows
//! mean insufficient funds (or no such user). There is no read-then-write
//! window, so no balance can ever go negative.
//!
//! The ledger trails the balance: a failed append never rolls back a
//! successful deduction. Failed appends land in the reconciliation queue
//! and are re-attempted by `drain_reconciliation`.

use crate::cache::TieredCache;
use crate::db::executor::{QueryExecutor, QueryRequest, SqlParam, ADMIN_TIMEOUT, BATCH_TIMEOUT};
use crate::db::pools::PoolKind;
use crate::errors::CoreError;
use crate::models::{CreditLedgerEntry, LedgerKind, User};
use crate::observability::metrics::{record_credit_transaction, record_ledger_append_failure};
use crate::token::ValidatedToken;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Retry attempts for the conditional decrement on transient errors.
pub const MAX_RETRIES: u32 = 3;

/// Exponential backoff base.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Backoff ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// One requested credit movement.
#[derive(Debug, Clone)]
pub struct CreditTransaction {
    pub user_id: Uuid,
    /// Always positive; direction comes from the operation (deduct/add).
    pub amount: i32,
    pub kind: LedgerKind,
    pub generation_id: Option<Uuid>,
    pub description: String,
    pub metadata: serde_json::Value,
    pub idempotency_key: Option<String>,
    /// Transaction-scoped token; preferred over any ambient one.
    pub token: Option<ValidatedToken>,
}

/// Result of a successful deduction or grant.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CreditOutcome {
    pub new_balance: i32,
    /// `None` when the ledger append failed and was queued for
    /// reconciliation; the balance change itself is committed.
    pub ledger_entry_id: Option<Uuid>,
}

/// Result of a balance pre-check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CreditCheck {
    pub ok: bool,
    pub current_balance: i32,
}

/// Per-transaction outcome of a batch.
#[derive(Debug)]
pub struct BatchItemOutcome {
    pub user_id: Uuid,
    pub result: Result<CreditOutcome, CoreError>,
}

/// Ledger aggregation over a trailing window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageAnalytics {
    pub window_days: i64,
    pub entries: usize,
    pub total_spent: i64,
    pub total_granted: i64,
    pub by_kind: Vec<KindBreakdown>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct KindBreakdown {
    pub kind: String,
    pub count: usize,
    pub total: i64,
}

/// A ledger row that failed to append and awaits reconciliation.
#[derive(Debug, Clone)]
struct PendingLedgerEntry {
    user_id: Uuid,
    amount: i32,
    kind: LedgerKind,
    balance_after: i32,
    generation_id: Option<Uuid>,
    description: String,
    metadata: serde_json::Value,
}

pub struct CreditEngine {
    executor: Arc<QueryExecutor>,
    cache: Arc<TieredCache>,
    reconciliation: Mutex<VecDeque<PendingLedgerEntry>>,
}

impl CreditEngine {
    pub fn new(executor: Arc<QueryExecutor>, cache: Arc<TieredCache>) -> Self {
        Self {
            executor,
            cache,
            reconciliation: Mutex::new(VecDeque::new()),
        }
    }

    /// Balance pre-check: does the user hold at least `required` credits?
    pub async fn validate(
        &self,
        user_id: Uuid,
        required: i32,
        token: Option<&ValidatedToken>,
    ) -> Result<CreditCheck, CoreError> {
        let balance = self
            .read_balance(user_id, token)
            .await?
            .ok_or(CoreError::NotFound { what: "user" })?;
        Ok(CreditCheck {
            ok: balance >= required,
            current_balance: balance,
        })
    }

    /// Atomically deduct `tx.amount` credits and append a usage ledger
    /// entry.
    pub async fn deduct(
        &self,
        tx: CreditTransaction,
        ambient_token: Option<&ValidatedToken>,
    ) -> Result<CreditOutcome, CoreError> {
        let token = tx.token.as_ref().or(ambient_token);
        Self::reject_expired(token)?;

        if tx.amount < 0 {
            return Err(CoreError::internal("deduct amount must be non-negative"));
        }

        // Zero-amount spend: no-op success, no ledger entry
        if tx.amount == 0 {
            let balance = self
                .read_balance(tx.user_id, token)
                .await?
                .ok_or(CoreError::NotFound { what: "user" })?;
            return Ok(CreditOutcome {
                new_balance: balance,
                ledger_entry_id: None,
            });
        }

        // Idempotency: a spend whose key already has a ledger entry returns
        // the recorded outcome instead of deducting twice
        if let Some(key) = &tx.idempotency_key {
            if let Some(entry) = self.find_by_idempotency_key(tx.user_id, key).await? {
                return Ok(CreditOutcome {
                    new_balance: entry.balance_after,
                    ledger_entry_id: Some(entry.id),
                });
            }
        }

        let new_balance = self
            .conditional_update(
                "deduct_credits",
                tx.user_id,
                tx.amount,
                token,
            )
            .await;

        let new_balance = match new_balance {
            Ok(Some(balance)) => balance,
            Ok(None) => {
                // Zero rows: user missing or insufficient funds
                let available = self
                    .read_balance(tx.user_id, token)
                    .await?
                    .ok_or(CoreError::NotFound { what: "user" })?;
                record_credit_transaction(tx.kind.as_str(), "insufficient");
                return Err(CoreError::InsufficientCredits {
                    required: i64::from(tx.amount),
                    available: i64::from(available),
                });
            }
            Err(e) => {
                record_credit_transaction(tx.kind.as_str(), "error");
                return Err(e);
            }
        };

        record_credit_transaction(tx.kind.as_str(), "success");

        // Ledger is a trailing audit log; a failed append is queued, never
        // rolled back into the balance
        let ledger_entry_id = self
            .append_ledger(PendingLedgerEntry {
                user_id: tx.user_id,
                amount: -tx.amount,
                kind: tx.kind,
                balance_after: new_balance,
                generation_id: tx.generation_id,
                description: tx.description.clone(),
                metadata: with_idempotency_key(tx.metadata.clone(), tx.idempotency_key.as_deref()),
            })
            .await;

        self.invalidate_user(tx.user_id);

        Ok(CreditOutcome {
            new_balance,
            ledger_entry_id,
        })
    }

    /// Mirror of [`deduct`](Self::deduct) for credits-in flows (purchase,
    /// refund, bonus, referral).
    pub async fn add(
        &self,
        tx: CreditTransaction,
        ambient_token: Option<&ValidatedToken>,
    ) -> Result<CreditOutcome, CoreError> {
        let token = tx.token.as_ref().or(ambient_token);
        Self::reject_expired(token)?;

        if tx.amount < 0 {
            return Err(CoreError::internal("grant amount must be non-negative"));
        }
        if tx.kind == LedgerKind::Usage {
            return Err(CoreError::internal("usage entries are deductions"));
        }
        if tx.amount == 0 {
            let balance = self
                .read_balance(tx.user_id, token)
                .await?
                .ok_or(CoreError::NotFound { what: "user" })?;
            return Ok(CreditOutcome {
                new_balance: balance,
                ledger_entry_id: None,
            });
        }

        if let Some(key) = &tx.idempotency_key {
            if let Some(entry) = self.find_by_idempotency_key(tx.user_id, key).await? {
                return Ok(CreditOutcome {
                    new_balance: entry.balance_after,
                    ledger_entry_id: Some(entry.id),
                });
            }
        }

        let new_balance = match self
            .conditional_update("grant_credits", tx.user_id, tx.amount, token)
            .await
        {
            Ok(Some(balance)) => balance,
            Ok(None) => {
                record_credit_transaction(tx.kind.as_str(), "error");
                return Err(CoreError::NotFound { what: "user" });
            }
            Err(e) => {
                record_credit_transaction(tx.kind.as_str(), "error");
                return Err(e);
            }
        };

        record_credit_transaction(tx.kind.as_str(), "success");

        let ledger_entry_id = self
            .append_ledger(PendingLedgerEntry {
                user_id: tx.user_id,
                amount: tx.amount,
                kind: tx.kind,
                balance_after: new_balance,
                generation_id: tx.generation_id,
                description: tx.description.clone(),
                metadata: with_idempotency_key(tx.metadata.clone(), tx.idempotency_key.as_deref()),
            })
            .await;

        self.invalidate_user(tx.user_id);

        Ok(CreditOutcome {
            new_balance,
            ledger_entry_id,
        })
    }

    /// Sequential batch processing. Never atomic across users; the result
    /// reports each transaction's outcome individually.
    pub async fn batch_deduct(
        &self,
        transactions: Vec<CreditTransaction>,
        ambient_token: Option<&ValidatedToken>,
    ) -> Vec<BatchItemOutcome> {
        let mut outcomes = Vec::with_capacity(transactions.len());
        for tx in transactions {
            let user_id = tx.user_id;
            let result = self.deduct(tx, ambient_token).await;
            outcomes.push(BatchItemOutcome { user_id, result });
        }
        outcomes
    }

    /// Ledger aggregation over the trailing window.
    pub async fn usage_analytics(
        &self,
        user_id: Uuid,
        window_days: i64,
    ) -> Result<UsageAnalytics, CoreError> {
        let since = chrono::Utc::now() - chrono::Duration::days(window_days.max(0));

        let request = QueryRequest::select("credit_ledger", PoolKind::Analytics, "usage_analytics")
            .filter("user_id", SqlParam::Uuid(user_id))
            .filter_gte("created_at", SqlParam::Timestamp(since))
            .order_by("created_at", true)
            .with_timeout(BATCH_TIMEOUT)
            .privileged();

        let entries = self
            .executor
            .fetch_all::<CreditLedgerEntry>(request)
            .await
            .map_err(CoreError::from)?;

        let mut by_kind: Vec<KindBreakdown> = Vec::new();
        let mut total_spent: i64 = 0;
        let mut total_granted: i64 = 0;

        for entry in &entries {
            let amount = i64::from(entry.amount);
            if amount < 0 {
                total_spent += -amount;
            } else {
                total_granted += amount;
            }

            match by_kind.iter_mut().find(|b| b.kind == entry.kind) {
                Some(breakdown) => {
                    breakdown.count += 1;
                    breakdown.total += amount;
                }
                None => by_kind.push(KindBreakdown {
                    kind: entry.kind.clone(),
                    count: 1,
                    total: amount,
                }),
            }
        }

        Ok(UsageAnalytics {
            window_days,
            entries: entries.len(),
            total_spent,
            total_granted,
            by_kind,
        })
    }

    /// Admin maintenance: force a balance back to its ledger sum, under
    /// SERIALIZABLE with retry on serialization failure.
    pub async fn rebalance_user(&self, user_id: Uuid) -> Result<i32, CoreError> {
        let mut attempt = 0;
        loop {
            let request = QueryRequest::rpc("rebalance_credits", PoolKind::Admin, "rebalance")
                .data("p_user_id", SqlParam::Uuid(user_id))
                .with_timeout(ADMIN_TIMEOUT)
                .serializable()
                .privileged();

            match self.executor.fetch_optional::<(Option<i32>,)>(request).await {
                Ok(Some((Some(balance),))) => {
                    self.invalidate_user(user_id);
                    info!(
                        target: "authz.credits",
                        user_id = %user_id,
                        balance = balance,
                        "Rebalanced user from ledger"
                    );
                    return Ok(balance);
                }
                Ok(_) => return Err(CoreError::NotFound { what: "user" }),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-attempt queued ledger appends. Returns how many remain queued.
    pub async fn drain_reconciliation(&self) -> usize {
        loop {
            let next = {
                let Ok(mut queue) = self.reconciliation.lock() else {
                    return 0;
                };
                queue.pop_front()
            };
            let Some(entry) = next else {
                break;
            };

            if self.try_append_ledger(&entry).await.is_none() {
                // Still failing; put it back and stop for now
                if let Ok(mut queue) = self.reconciliation.lock() {
                    queue.push_front(entry);
                }
                break;
            }
        }

        self.reconciliation
            .lock()
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Count of ledger rows awaiting reconciliation.
    pub fn reconciliation_backlog(&self) -> usize {
        self.reconciliation
            .lock()
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// The conditional balance update, retried on transient driver errors
    /// with jittered exponential backoff.
    async fn conditional_update(
        &self,
        function: &'static str,
        user_id: Uuid,
        amount: i32,
        token: Option<&ValidatedToken>,
    ) -> Result<Option<i32>, CoreError> {
        let mut attempt = 0;
        loop {
            let request = QueryRequest::rpc(function, PoolKind::Write, function)
                .data("p_user_id", SqlParam::Uuid(user_id))
                .data("p_amount", SqlParam::Int4(amount))
                .privileged()
                .with_token(token);

            match self.executor.fetch_optional::<(Option<i32>,)>(request).await {
                Ok(Some((balance,))) => return Ok(balance),
                Ok(None) => return Ok(None),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(
                        target: "authz.credits",
                        user_id = %user_id,
                        attempt = attempt,
                        error = %e,
                        "Transient error during balance update, retrying"
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<CreditLedgerEntry>, CoreError> {
        let request = QueryRequest::select("credit_ledger", PoolKind::Auth, "idempotency_lookup")
            .filter("user_id", SqlParam::Uuid(user_id))
            .filter(
                "metadata ->> 'idempotency_key'",
                SqlParam::Text(key.to_string()),
            )
            .privileged();

        self.executor
            .fetch_optional::<CreditLedgerEntry>(request)
            .await
            .map_err(CoreError::from)
    }

    /// Append a ledger entry; on failure the entry joins the reconciliation
    /// queue and `None` is returned.
    async fn append_ledger(&self, entry: PendingLedgerEntry) -> Option<Uuid> {
        match self.try_append_ledger(&entry).await {
            Some(id) => Some(id),
            None => {
                record_ledger_append_failure();
                warn!(
                    target: "authz.credits",
                    user_id = %entry.user_id,
                    amount = entry.amount,
                    "Ledger append failed; queued for reconciliation"
                );
                if let Ok(mut queue) = self.reconciliation.lock() {
                    queue.push_back(entry);
                }
                None
            }
        }
    }

    async fn try_append_ledger(&self, entry: &PendingLedgerEntry) -> Option<Uuid> {
        let mut request = QueryRequest::insert("credit_ledger", PoolKind::Write, "ledger_append")
            .data("user_id", SqlParam::Uuid(entry.user_id))
            .data("amount", SqlParam::Int4(entry.amount))
            .data("kind", SqlParam::Text(entry.kind.as_str().to_string()))
            .data("balance_after", SqlParam::Int4(entry.balance_after))
            .data("description", SqlParam::Text(entry.description.clone()))
            .data("metadata", SqlParam::Json(entry.metadata.clone()))
            .privileged();
        if let Some(generation_id) = entry.generation_id {
            request = request.data("generation_id", SqlParam::Uuid(generation_id));
        }

        match self.executor.fetch_optional::<CreditLedgerEntry>(request).await {
            Ok(Some(row)) => Some(row.id),
            Ok(None) => None,
            Err(_) => None,
        }
    }

    async fn read_balance(
        &self,
        user_id: Uuid,
        token: Option<&ValidatedToken>,
    ) -> Result<Option<i32>, CoreError> {
        let request = QueryRequest::select("users", PoolKind::Auth, "balance_read")
            .filter("id", SqlParam::Uuid(user_id))
            .privileged()
            .with_token(token);

        Ok(self
            .executor
            .fetch_optional::<User>(request)
            .await
            .map_err(CoreError::from)?
            .map(|user| user.credits_balance))
    }

    fn invalidate_user(&self, user_id: Uuid) {
        self.cache
            .invalidate_pattern(&format!("repo:users:*:{user_id}"));
        self.cache.invalidate_pattern(&format!("perm:{user_id}:*"));
    }

    fn reject_expired(token: Option<&ValidatedToken>) -> Result<(), CoreError> {
        if let Some(token) = token {
            if token.is_expired() {
                return Err(CoreError::Unauthenticated {
                    reason: crate::token::TokenError::Expired,
                });
            }
        }
        Ok(())
    }
}

/// Jittered exponential backoff: base 100 ms doubling per attempt, capped
/// at 2 s, with up to 50% additive jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(BACKOFF_CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
    capped + Duration::from_millis(jitter_ms)
}

/// Merge the idempotency key into ledger metadata, when present.
fn with_idempotency_key(metadata: serde_json::Value, key: Option<&str>) -> serde_json::Value {
    let Some(key) = key else {
        return metadata;
    };
    match metadata {
        serde_json::Value::Object(mut map) => {
            map.insert(
                "idempotency_key".to_string(),
                serde_json::Value::String(key.to_string()),
            );
            serde_json::Value::Object(map)
        }
        other => serde_json::json!({
            "idempotency_key": key,
            "wrapped": other,
        }),
    }
}
