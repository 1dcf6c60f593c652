//! Authorization engine.
//!
//! Decides `access(user, resource, op)` with first-match-wins resolution:
//!
//! 1. Cached decision (L1/L2)
//! 2. Materialized-view fast path (generations)
//! 3. Direct ownership check
//! 4. Public visibility (read only)
//! 5. Team visibility via active membership
//! 6. Default deny
//!
//! The engine fails closed: an infrastructure error can delay a decision or
//! surface as `Unavailable`, but it can never produce a spurious grant. An
//! unknown resource is `NotFound`, never `Forbidden`.

use crate::cache::{perm_key, CachePriority, TieredCache};
use crate::db::executor::{QueryExecutor, QueryRequest, SqlParam, AUTHZ_CHECK_TIMEOUT};
use crate::db::pools::PoolKind;
use crate::errors::{CoreError, ForbiddenReason};
use crate::models::{
    AccessOp, AuthorizationContextRow, AuthorizationDecision, DecisionMethod, EffectiveRole,
    Generation, Project, ResourceType, TeamMembership, UserRole, Visibility,
};
use crate::observability::metrics::{record_authorization, record_security_event};
use crate::token::ValidatedToken;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Decision cache TTL (5 minutes).
pub const DECISION_TTL: Duration = Duration::from_secs(300);

/// Operations that require a global admin role regardless of resource
/// ownership.
const ADMIN_OPS: [&str; 4] = [
    "delete_user",
    "modify_permissions",
    "view_logs",
    "system_config",
];

pub struct AuthorizationEngine {
    executor: Arc<QueryExecutor>,
    cache: Arc<TieredCache>,
    guards_enabled: bool,
    /// Last numeric resource id seen per caller, for the enumeration guard.
    last_numeric_ids: Mutex<HashMap<Uuid, u64>>,
}

impl AuthorizationEngine {
    pub fn new(
        executor: Arc<QueryExecutor>,
        cache: Arc<TieredCache>,
        guards_enabled: bool,
    ) -> Self {
        Self {
            executor,
            cache,
            guards_enabled,
            last_numeric_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `user_id` may perform `op` on the given resource.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        resource_id: &str,
        op: AccessOp,
        token: Option<&ValidatedToken>,
    ) -> Result<AuthorizationDecision, CoreError> {
        let started = Instant::now();

        self.check_enumeration(user_id, resource_id, op)?;

        let key = perm_key(
            &user_id.to_string(),
            resource_type.as_str(),
            resource_id,
            op.as_str(),
        );

        // Step 1: cached decision, trusted only while unexpired
        if let Some((raw, level)) = self.cache.get_raw(&key).await {
            if let Ok(mut decision) = serde_json::from_value::<AuthorizationDecision>(raw) {
                if decision.expires_at > Utc::now() {
                    decision.method = match level {
                        crate::cache::CacheLevel::L2 => DecisionMethod::CacheL2,
                        _ => DecisionMethod::CacheL1,
                    };
                    record_authorization(
                        decision.method.as_str(),
                        decision.granted,
                        started.elapsed(),
                    );
                    return Ok(decision);
                }
            }
        }

        let result = self
            .compute_decision(user_id, resource_type, resource_id, op, token)
            .await;

        match &result {
            Ok(decision) => {
                self.cache.set(&key, decision, CachePriority::Critical).await;
                record_authorization(decision.method.as_str(), decision.granted, started.elapsed());
            }
            Err(CoreError::NotFound { .. }) => {
                record_authorization(
                    DecisionMethod::NotFound.as_str(),
                    false,
                    started.elapsed(),
                );
            }
            Err(_) => {
                // Fail closed: errors never grant, and are tagged as such
                record_authorization(DecisionMethod::Error.as_str(), false, started.elapsed());
            }
        }

        result
    }

    /// Drop cached decisions referencing a resource.
    pub fn invalidate_resource(&self, resource_type: ResourceType, resource_id: &str) {
        self.cache.invalidate_pattern(&format!(
            "perm:*:{}:{resource_id}:*",
            resource_type.as_str()
        ));
    }

    /// Drop cached decisions for a user.
    pub fn invalidate_user(&self, user_id: Uuid) {
        self.cache.invalidate_pattern(&format!("perm:{user_id}:*"));
    }

    /// Admin-operation guard: callers below the admin role may not request
    /// admin operations. Advisory unless guards are enabled.
    pub fn guard_admin_op(&self, caller_role: UserRole, op_name: &str) -> Result<(), CoreError> {
        if !ADMIN_OPS.contains(&op_name) || caller_role >= UserRole::Admin {
            return Ok(());
        }

        record_security_event("admin_op_blocked");
        warn!(
            target: "authz.engine",
            op = op_name,
            role = caller_role.as_str(),
            enforced = self.guards_enabled,
            "Admin operation requested below admin role"
        );

        if self.guards_enabled {
            return Err(CoreError::Forbidden {
                reason: ForbiddenReason::PrivilegeEscalationBlocked,
            });
        }
        Ok(())
    }

    /// Enumeration guard: a numeric resource id exactly one above the
    /// caller's previous one is an enumeration signal; write and delete are
    /// blocked.
    fn check_enumeration(
        &self,
        user_id: Uuid,
        resource_id: &str,
        op: AccessOp,
    ) -> Result<(), CoreError> {
        if !self.guards_enabled {
            return Ok(());
        }
        let Ok(numeric) = resource_id.parse::<u64>() else {
            return Ok(());
        };

        let previous = self
            .last_numeric_ids
            .lock()
            .map(|mut ids| ids.insert(user_id, numeric))
            .unwrap_or(None);

        let sequential = previous
            .and_then(|p| p.checked_add(1))
            .map(|expected| expected == numeric)
            .unwrap_or(false);

        if sequential && matches!(op, AccessOp::Write | AccessOp::Delete) {
            record_security_event("enumeration_blocked");
            warn!(
                target: "authz.engine",
                user_id = %user_id,
                "Sequential resource id access blocked for mutating operation"
            );
            return Err(CoreError::Forbidden {
                reason: ForbiddenReason::EnumerationBlocked,
            });
        }
        Ok(())
    }

    async fn compute_decision(
        &self,
        user_id: Uuid,
        resource_type: ResourceType,
        resource_id: &str,
        op: AccessOp,
        token: Option<&ValidatedToken>,
    ) -> Result<AuthorizationDecision, CoreError> {
        let resource_uuid = Uuid::parse_str(resource_id)
            .map_err(|_| CoreError::NotFound { what: "resource" })?;

        // Step 2: materialized-view fast path (generations only)
        if resource_type == ResourceType::Generation {
            match self.context_row(user_id, resource_uuid, token).await {
                Ok(Some(row)) => return Ok(Self::decide_from_context(&row, op)),
                Ok(None) => {}
                Err(e) => {
                    // A view failure downgrades to direct checks, never to a
                    // spurious grant
                    debug!(
                        target: "authz.engine",
                        error = %e,
                        "Authorization context view unavailable, using direct checks"
                    );
                }
            }
        }

        // Steps 3-6: direct checks against the resource row
        match resource_type {
            ResourceType::Generation => {
                let generation = self.generation_row(resource_uuid, token).await?;
                let Some(generation) = generation else {
                    return Err(CoreError::NotFound { what: "generation" });
                };

                if generation.owner_user_id == user_id {
                    return Ok(Self::grant(EffectiveRole::Owner, DecisionMethod::DirectOwnership));
                }
                match generation.visibility() {
                    Visibility::Public if op == AccessOp::Read => {
                        Ok(Self::grant(EffectiveRole::Viewer, DecisionMethod::PublicVisibility))
                    }
                    Visibility::Team => {
                        self.decide_team(user_id, generation.project_id, op, token)
                            .await
                    }
                    Visibility::Private => Ok(Self::deny(
                        ForbiddenReason::OwnerMismatch,
                        DecisionMethod::DefaultDeny,
                    )),
                    _ => Ok(Self::deny(
                        ForbiddenReason::DefaultDeny,
                        DecisionMethod::DefaultDeny,
                    )),
                }
            }
            ResourceType::Project => {
                let project = self.project_row(resource_uuid, token).await?;
                let Some(project) = project else {
                    return Err(CoreError::NotFound { what: "project" });
                };

                if project.owner_user_id == user_id {
                    return Ok(Self::grant(EffectiveRole::Owner, DecisionMethod::DirectOwnership));
                }
                match project.visibility() {
                    Visibility::Public if op == AccessOp::Read => {
                        Ok(Self::grant(EffectiveRole::Viewer, DecisionMethod::PublicVisibility))
                    }
                    Visibility::Team => {
                        self.decide_team_direct(user_id, project.team_id, op, token)
                            .await
                    }
                    Visibility::Private => Ok(Self::deny(
                        ForbiddenReason::OwnerMismatch,
                        DecisionMethod::DefaultDeny,
                    )),
                    _ => Ok(Self::deny(
                        ForbiddenReason::DefaultDeny,
                        DecisionMethod::DefaultDeny,
                    )),
                }
            }
        }
    }

    /// Step 5 for generations: resolve the resource's project, then its
    /// team, then the caller's active membership.
    async fn decide_team(
        &self,
        user_id: Uuid,
        project_id: Option<Uuid>,
        op: AccessOp,
        token: Option<&ValidatedToken>,
    ) -> Result<AuthorizationDecision, CoreError> {
        let Some(project_id) = project_id else {
            return Ok(Self::deny(
                ForbiddenReason::NotTeamMember,
                DecisionMethod::TeamVisibility,
            ));
        };
        let project = self.project_row(project_id, token).await?;
        let team_id = project.and_then(|p| p.team_id);
        self.decide_team_direct(user_id, team_id, op, token).await
    }

    async fn decide_team_direct(
        &self,
        user_id: Uuid,
        team_id: Option<Uuid>,
        op: AccessOp,
        token: Option<&ValidatedToken>,
    ) -> Result<AuthorizationDecision, CoreError> {
        let Some(team_id) = team_id else {
            return Ok(Self::deny(
                ForbiddenReason::NotTeamMember,
                DecisionMethod::TeamVisibility,
            ));
        };

        // Membership reads are hot (every team-visibility decision) and
        // warmable, so they go through the tiered cache
        let key = crate::cache::repo_key(
            "team_members",
            "select",
            &format!("{user_id}:{team_id}"),
        );
        let (membership, _level) = self
            .cache
            .get_with_fallback::<TeamMembership, _, _>(&key, CachePriority::High, || async move {
                let request =
                    QueryRequest::select("team_members", PoolKind::Auth, "team_membership")
                        .filter("user_id", SqlParam::Uuid(user_id))
                        .filter("team_id", SqlParam::Uuid(team_id))
                        .filter("is_active", SqlParam::Bool(true))
                        .with_timeout(AUTHZ_CHECK_TIMEOUT)
                        .privileged()
                        .with_token(token);

                self.executor
                    .fetch_optional::<TeamMembership>(request)
                    .await
                    .map_err(CoreError::from)
            })
            .await?;

        let Some(membership) = membership else {
            return Ok(Self::deny(
                ForbiddenReason::NotTeamMember,
                DecisionMethod::TeamVisibility,
            ));
        };

        let team_role = membership.team_role();
        if team_role.allows(op) {
            Ok(Self::grant(
                EffectiveRole::from_team_role(team_role),
                DecisionMethod::TeamVisibility,
            ))
        } else {
            Ok(Self::deny(
                ForbiddenReason::RoleInsufficient,
                DecisionMethod::TeamVisibility,
            ))
        }
    }

    /// Decision from a pre-joined context row. A row only exists for pairs
    /// with at least read access, so denials here are role shortfalls.
    fn decide_from_context(row: &AuthorizationContextRow, op: AccessOp) -> AuthorizationDecision {
        let granted = match op {
            AccessOp::Read => row.has_read_access,
            AccessOp::Write => row.has_write_access,
            AccessOp::Delete => row.is_owner,
        };

        if granted {
            Self::grant(row.effective_role(), DecisionMethod::MaterializedView)
        } else {
            Self::deny(
                ForbiddenReason::RoleInsufficient,
                DecisionMethod::MaterializedView,
            )
        }
    }

    async fn context_row(
        &self,
        user_id: Uuid,
        generation_id: Uuid,
        token: Option<&ValidatedToken>,
    ) -> Result<Option<AuthorizationContextRow>, CoreError> {
        let request = QueryRequest::select(
            "mv_user_authorization_context",
            PoolKind::Auth,
            "authz_context",
        )
        .filter("user_id", SqlParam::Uuid(user_id))
        .filter("generation_id", SqlParam::Uuid(generation_id))
        .with_timeout(AUTHZ_CHECK_TIMEOUT)
        .privileged()
        .with_token(token);

        self.executor
            .fetch_optional::<AuthorizationContextRow>(request)
            .await
            .map_err(CoreError::from)
    }

    async fn generation_row(
        &self,
        id: Uuid,
        token: Option<&ValidatedToken>,
    ) -> Result<Option<Generation>, CoreError> {
        let request = QueryRequest::select("generations", PoolKind::Auth, "generation_by_id")
            .filter("id", SqlParam::Uuid(id))
            .with_timeout(AUTHZ_CHECK_TIMEOUT)
            .privileged()
            .with_token(token);

        self.executor
            .fetch_optional::<Generation>(request)
            .await
            .map_err(CoreError::from)
    }

    async fn project_row(
        &self,
        id: Uuid,
        token: Option<&ValidatedToken>,
    ) -> Result<Option<Project>, CoreError> {
        let request = QueryRequest::select("projects", PoolKind::Auth, "project_by_id")
            .filter("id", SqlParam::Uuid(id))
            .with_timeout(AUTHZ_CHECK_TIMEOUT)
            .privileged()
            .with_token(token);

        self.executor
            .fetch_optional::<Project>(request)
            .await
            .map_err(CoreError::from)
    }

    fn grant(role: EffectiveRole, method: DecisionMethod) -> AuthorizationDecision {
        let now = Utc::now();
        AuthorizationDecision {
            granted: true,
            effective_role: Some(role),
            method,
            deny_reason: None,
            computed_at: now,
            expires_at: now
                + chrono::Duration::from_std(DECISION_TTL)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    fn deny(reason: ForbiddenReason, method: DecisionMethod) -> AuthorizationDecision {
        let now = Utc::now();
        AuthorizationDecision {
            granted: false,
            effective_role: None,
            method,
            deny_reason: Some(reason),
            computed_at: now,
            expires_at: now
                + chrono::Duration::from_std(DECISION_TTL)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }
}
