//! Data models for the authorization core.
//!
//! Database-backed structs keep enum-ish columns as `String` (how the rows
//! come back from Postgres) and expose typed accessors; purely in-process
//! types (decisions, operations) use real enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Global role of a user account. Ordering matters: roles are monotonically
/// non-decreasing except by admin action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Viewer,
    User,
    Admin,
    Service,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Viewer => "viewer",
            UserRole::User => "user",
            UserRole::Admin => "admin",
            UserRole::Service => "service",
        }
    }

    /// Unknown values default to the least-privileged role.
    pub fn parse(s: &str) -> UserRole {
        match s {
            "user" => UserRole::User,
            "admin" => UserRole::Admin,
            "service" => UserRole::Service,
            _ => UserRole::Viewer,
        }
    }
}

/// User record (maps to users table).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub credits_balance: i32,
    pub role: String,
    pub profile: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn user_role(&self) -> UserRole {
        UserRole::parse(&self.role)
    }
}

/// Resource visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Team,
    Public,
}

impl Visibility {
    pub fn parse(s: &str) -> Visibility {
        match s {
            "team" => Visibility::Team,
            "public" => Visibility::Public,
            _ => Visibility::Private,
        }
    }
}

/// Project record (maps to projects table).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub visibility: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn visibility(&self) -> Visibility {
        Visibility::parse(&self.visibility)
    }
}

/// Generation record (maps to generations table).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Generation {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub project_id: Option<Uuid>,
    pub status: String,
    pub visibility: String,
    pub model_id: String,
    pub output_urls: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Generation {
    pub fn visibility(&self) -> Visibility {
        Visibility::parse(&self.visibility)
    }
}

/// Role of a user inside a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Owner,
    Editor,
    Viewer,
}

impl TeamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamRole::Owner => "owner",
            TeamRole::Editor => "editor",
            TeamRole::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> TeamRole {
        match s {
            "owner" => TeamRole::Owner,
            "editor" => TeamRole::Editor,
            _ => TeamRole::Viewer,
        }
    }

    /// Team role → operation mapping: owner can do everything, editor can
    /// read and write, viewer can only read.
    pub fn allows(&self, op: AccessOp) -> bool {
        match self {
            TeamRole::Owner => true,
            TeamRole::Editor => matches!(op, AccessOp::Read | AccessOp::Write),
            TeamRole::Viewer => matches!(op, AccessOp::Read),
        }
    }
}

/// Team membership record (maps to team_members table).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TeamMembership {
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub role: String,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}

impl TeamMembership {
    pub fn team_role(&self) -> TeamRole {
        TeamRole::parse(&self.role)
    }
}

/// Kind of a credit ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Purchase,
    Usage,
    Refund,
    Bonus,
    Referral,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Purchase => "purchase",
            LedgerKind::Usage => "usage",
            LedgerKind::Refund => "refund",
            LedgerKind::Bonus => "bonus",
            LedgerKind::Referral => "referral",
        }
    }
}

/// Append-only credit ledger entry (maps to credit_ledger table).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct CreditLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i32,
    pub kind: String,
    pub balance_after: i32,
    pub generation_id: Option<Uuid>,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The resource kinds the authorization engine decides over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Generation,
    Project,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Generation => "generation",
            ResourceType::Project => "project",
        }
    }
}

/// Operation requested on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessOp {
    Read,
    Write,
    Delete,
}

impl AccessOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessOp::Read => "read",
            AccessOp::Write => "write",
            AccessOp::Delete => "delete",
        }
    }
}

/// Role the caller holds relative to a specific resource; may differ from
/// the caller's global role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveRole {
    Owner,
    Editor,
    Viewer,
}

impl EffectiveRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveRole::Owner => "owner",
            EffectiveRole::Editor => "editor",
            EffectiveRole::Viewer => "viewer",
        }
    }

    pub fn from_team_role(role: TeamRole) -> EffectiveRole {
        match role {
            TeamRole::Owner => EffectiveRole::Owner,
            TeamRole::Editor => EffectiveRole::Editor,
            TeamRole::Viewer => EffectiveRole::Viewer,
        }
    }
}

/// How an authorization decision was produced. Used as a one-line method tag
/// for observability and carried inside cached decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    CacheL1,
    CacheL2,
    MaterializedView,
    DirectOwnership,
    PublicVisibility,
    TeamVisibility,
    DefaultDeny,
    NotFound,
    Error,
}

impl DecisionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMethod::CacheL1 => "cache_l1",
            DecisionMethod::CacheL2 => "cache_l2",
            DecisionMethod::MaterializedView => "materialized_view",
            DecisionMethod::DirectOwnership => "direct_ownership",
            DecisionMethod::PublicVisibility => "public_visibility",
            DecisionMethod::TeamVisibility => "team_visibility",
            DecisionMethod::DefaultDeny => "default_deny",
            DecisionMethod::NotFound => "not_found",
            DecisionMethod::Error => "error",
        }
    }
}

/// Outcome of an authorization check. Cached for five minutes unless a write
/// to the referenced entities invalidates it first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub granted: bool,
    pub effective_role: Option<EffectiveRole>,
    pub method: DecisionMethod,
    /// Why the decision denied, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<crate::errors::ForbiddenReason>,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One row of mv_user_authorization_context, the pre-joined fast path for
/// generation decisions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthorizationContextRow {
    pub user_id: Uuid,
    pub generation_id: Uuid,
    pub is_owner: bool,
    pub has_read_access: bool,
    pub has_write_access: bool,
    pub effective_role: String,
    pub computed_at: DateTime<Utc>,
}

impl AuthorizationContextRow {
    pub fn effective_role(&self) -> EffectiveRole {
        match self.effective_role.as_str() {
            "owner" => EffectiveRole::Owner,
            "editor" => EffectiveRole::Editor,
            _ => EffectiveRole::Viewer,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_role_ordering_is_monotonic() {
        assert!(UserRole::Viewer < UserRole::User);
        assert!(UserRole::User < UserRole::Admin);
        assert!(UserRole::Admin < UserRole::Service);
    }

    #[test]
    fn test_user_role_parse_defaults_to_viewer() {
        assert_eq!(UserRole::parse("admin"), UserRole::Admin);
        assert_eq!(UserRole::parse("nonsense"), UserRole::Viewer);
        assert_eq!(UserRole::parse(""), UserRole::Viewer);
    }

    #[test]
    fn test_team_role_operation_mapping() {
        assert!(TeamRole::Owner.allows(AccessOp::Read));
        assert!(TeamRole::Owner.allows(AccessOp::Write));
        assert!(TeamRole::Owner.allows(AccessOp::Delete));

        assert!(TeamRole::Editor.allows(AccessOp::Read));
        assert!(TeamRole::Editor.allows(AccessOp::Write));
        assert!(!TeamRole::Editor.allows(AccessOp::Delete));

        assert!(TeamRole::Viewer.allows(AccessOp::Read));
        assert!(!TeamRole::Viewer.allows(AccessOp::Write));
        assert!(!TeamRole::Viewer.allows(AccessOp::Delete));
    }

    #[test]
    fn test_decision_method_tags() {
        assert_eq!(DecisionMethod::CacheL1.as_str(), "cache_l1");
        assert_eq!(DecisionMethod::MaterializedView.as_str(), "materialized_view");
        assert_eq!(DecisionMethod::DefaultDeny.as_str(), "default_deny");
        assert_eq!(DecisionMethod::NotFound.as_str(), "not_found");
    }

    #[test]
    fn test_decision_serialization_round_trip() {
        let decision = AuthorizationDecision {
            granted: true,
            effective_role: Some(EffectiveRole::Owner),
            method: DecisionMethod::MaterializedView,
            deny_reason: None,
            computed_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };

        let json = serde_json::to_string(&decision).unwrap();
        let restored: AuthorizationDecision = serde_json::from_str(&json).unwrap();
        assert!(restored.granted);
        assert_eq!(restored.effective_role, Some(EffectiveRole::Owner));
        assert_eq!(restored.method, DecisionMethod::MaterializedView);
    }

    #[test]
    fn test_visibility_parse() {
        assert_eq!(Visibility::parse("public"), Visibility::Public);
        assert_eq!(Visibility::parse("team"), Visibility::Team);
        assert_eq!(Visibility::parse("private"), Visibility::Private);
        assert_eq!(Visibility::parse("garbage"), Visibility::Private);
    }

    #[test]
    fn test_ledger_kind_strings() {
        assert_eq!(LedgerKind::Usage.as_str(), "usage");
        assert_eq!(LedgerKind::Purchase.as_str(), "purchase");
        assert_eq!(LedgerKind::Referral.as_str(), "referral");
    }
}
