//! User resolver.
//!
//! Looks up (and when missing, auto-provisions) the stable user record
//! behind a validated identity. Fetching is strictly layered:
//!
//! 1. Privileged single-row select
//! 2. Delegated select with the caller's (re-validated) token
//! 3. Auto-provision, privileged first then delegated
//! 4. Emergency direct read through the admin pool for allow-listed
//!    identities - always logged
//!
//! An expired token is rejected before it can ever reach a database
//! connection.

use crate::cache::{repo_key, CachePriority, TieredCache};
use crate::db::executor::{QueryExecutor, QueryRequest, SqlParam, AUTH_SELECT_TIMEOUT};
use crate::db::pools::PoolKind;
use crate::errors::{CoreError, DbError};
use crate::models::{User, UserRole};
use crate::token::{TokenError, ValidatedToken};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct UserResolver {
    executor: Arc<QueryExecutor>,
    cache: Arc<TieredCache>,
    default_user_credits: i32,
    emergency_allowlist: Vec<Uuid>,
}

impl UserResolver {
    pub fn new(
        executor: Arc<QueryExecutor>,
        cache: Arc<TieredCache>,
        default_user_credits: i32,
        emergency_allowlist: Vec<Uuid>,
    ) -> Self {
        Self {
            executor,
            cache,
            default_user_credits,
            emergency_allowlist,
        }
    }

    /// Synthetic address used when auto-provisioning without a claimed email.
    pub fn synthetic_email(user_id: Uuid) -> String {
        format!("{user_id}@autoprovision.local")
    }

    /// Look up a user by id through the cache and the layered fetch.
    ///
    /// `Ok(None)` means the user definitively does not exist; errors mean
    /// the lookup itself failed on every layer.
    pub async fn get_user_by_id(
        &self,
        user_id: Uuid,
        token: Option<&ValidatedToken>,
    ) -> Result<Option<User>, CoreError> {
        let key = repo_key("users", "select", &user_id.to_string());

        let lookup = self
            .cache
            .get_with_fallback::<User, _, _>(&key, CachePriority::High, || {
                self.fetch_layered(user_id, token)
            })
            .await;

        match lookup {
            Ok((user, _level)) => Ok(user),
            Err(e) => {
                // Layer 4: rescue well-known identities through the admin
                // pool, bypassing the cache entirely. Every use is logged.
                if self.emergency_allowlist.contains(&user_id) {
                    warn!(
                        target: "authz.users",
                        user_id = %user_id,
                        "Emergency user lookup engaged (admin pool, cache bypassed)"
                    );
                    return self.fetch_emergency(user_id).await;
                }
                Err(e)
            }
        }
    }

    /// Current credit balance.
    pub async fn get_user_credits(
        &self,
        user_id: Uuid,
        token: Option<&ValidatedToken>,
    ) -> Result<i32, CoreError> {
        match self.get_user_by_id(user_id, token).await? {
            Some(user) => Ok(user.credits_balance),
            None => Err(CoreError::NotFound { what: "user" }),
        }
    }

    /// Idempotent lookup-or-create.
    ///
    /// Two concurrent calls for the same id produce exactly one row: the
    /// loser of the insert race hits the unique violation and re-reads the
    /// winner's row.
    pub async fn ensure_user(
        &self,
        user_id: Uuid,
        claimed_email: Option<&str>,
        token: Option<&ValidatedToken>,
    ) -> Result<User, CoreError> {
        if let Some(user) = self.get_user_by_id(user_id, token).await? {
            return Ok(user);
        }

        // Layer 3: auto-provision, privileged first, then delegated
        let email = claimed_email
            .map(ToString::to_string)
            .unwrap_or_else(|| Self::synthetic_email(user_id));

        let request = QueryRequest::insert("users", PoolKind::Write, "ensure_user")
            .data("id", SqlParam::Uuid(user_id))
            .data("email", SqlParam::Text(email))
            .data("role", SqlParam::Text(UserRole::Viewer.as_str().to_string()))
            .data("credits_balance", SqlParam::Int4(self.default_user_credits))
            .privileged()
            .with_token(token);

        match self.executor.fetch_optional::<User>(request).await {
            Ok(Some(user)) => {
                info!(
                    target: "authz.users",
                    user_id = %user_id,
                    credits = self.default_user_credits,
                    "Auto-provisioned user"
                );
                self.invalidate_user(user_id);
                Ok(user)
            }
            Ok(None) => Err(CoreError::internal("auto-provision returned no row")),
            Err(DbError::UniqueViolation) => {
                // Lost the race; the winner's row is authoritative
                debug!(
                    target: "authz.users",
                    user_id = %user_id,
                    "Auto-provision race lost, re-reading winner row"
                );
                self.invalidate_user(user_id);
                match self.get_user_by_id(user_id, token).await? {
                    Some(user) => Ok(user),
                    None => Err(CoreError::Conflict { what: "user" }),
                }
            }
            Err(e) => {
                warn!(
                    target: "authz.users",
                    user_id = %user_id,
                    error = %e,
                    "Auto-provision failed"
                );
                Err(e.into())
            }
        }
    }

    /// Direct balance write (admin/maintenance path; normal spends go
    /// through the credit engine's atomic decrement).
    pub async fn update_credits(
        &self,
        user_id: Uuid,
        new_balance: i32,
        token: Option<&ValidatedToken>,
    ) -> Result<User, CoreError> {
        Self::reject_expired(token)?;

        let request = QueryRequest::update("users", PoolKind::Write, "update_credits")
            .data("credits_balance", SqlParam::Int4(new_balance))
            .filter("id", SqlParam::Uuid(user_id))
            .privileged()
            .with_token(token);

        let user = self
            .executor
            .fetch_optional::<User>(request)
            .await
            .map_err(|e| self.classify_credit_error(e))?
            .ok_or(CoreError::NotFound { what: "user" })?;

        self.invalidate_user(user_id);
        Ok(user)
    }

    /// Drop cached projections of a user (row and any decisions naming it).
    pub fn invalidate_user(&self, user_id: Uuid) {
        self.cache
            .invalidate_pattern(&format!("repo:users:*:{user_id}"));
        self.cache.invalidate_pattern(&format!("perm:{user_id}:*"));
    }

    /// Layers 1 + 2. Runs as the cache fallback, so a success here is what
    /// gets cached.
    async fn fetch_layered(
        &self,
        user_id: Uuid,
        token: Option<&ValidatedToken>,
    ) -> Result<Option<User>, CoreError> {
        // Layer 1: privileged
        let privileged = QueryRequest::select("users", PoolKind::Auth, "user_by_id")
            .filter("id", SqlParam::Uuid(user_id))
            .with_timeout(AUTH_SELECT_TIMEOUT)
            .privileged()
            .with_token(token);

        let layer1_err = match self.executor.fetch_optional::<User>(privileged).await {
            Ok(found) => return Ok(found),
            Err(e) => {
                debug!(
                    target: "authz.users",
                    user_id = %user_id,
                    error = %e,
                    "Privileged user lookup failed, trying delegated"
                );
                e
            }
        };

        // Layer 2: delegated, with the token re-checked first. An expired
        // token is never placed on a connection.
        if let Some(token) = token {
            Self::reject_expired(Some(token))?;

            let delegated = QueryRequest::select("users", PoolKind::Auth, "user_by_id")
                .filter("id", SqlParam::Uuid(user_id))
                .with_timeout(AUTH_SELECT_TIMEOUT)
                .with_token(Some(token));

            match self.executor.fetch_optional::<User>(delegated).await {
                Ok(found) => return Ok(found),
                // A row-level denial here is informative, not fatal: it is
                // recovered by the next layer (or surfaced as a failed
                // lookup, never as a policy error).
                Err(DbError::RowLevelPolicyDenied) => {
                    debug!(
                        target: "authz.users",
                        user_id = %user_id,
                        "Delegated user lookup denied by row policy"
                    );
                }
                Err(e) => {
                    debug!(
                        target: "authz.users",
                        user_id = %user_id,
                        error = %e,
                        "Delegated user lookup failed"
                    );
                }
            }
        }

        Err(self.classify_credit_error(layer1_err))
    }

    /// Layer 4 body: one admin-pool read, no cache on either side.
    async fn fetch_emergency(&self, user_id: Uuid) -> Result<Option<User>, CoreError> {
        let request = QueryRequest::select("users", PoolKind::Admin, "user_emergency")
            .filter("id", SqlParam::Uuid(user_id))
            .privileged();

        self.executor
            .fetch_optional::<User>(request)
            .await
            .map_err(CoreError::from)
    }

    fn reject_expired(token: Option<&ValidatedToken>) -> Result<(), CoreError> {
        if let Some(token) = token {
            if token.is_expired() {
                return Err(CoreError::Unauthenticated {
                    reason: TokenError::Expired,
                });
            }
        }
        Ok(())
    }

    /// A missing credits column is a deployment misconfiguration, worth a
    /// dedicated log line before the generic internal error.
    fn classify_credit_error(&self, err: DbError) -> CoreError {
        if let DbError::Unknown(message) = &err {
            if message.contains("credits_balance") && message.contains("does not exist") {
                tracing::error!(
                    target: "authz.users",
                    "users.credits_balance column missing; check schema migration state"
                );
            }
        }
        err.into()
    }
}
