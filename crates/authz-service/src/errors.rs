//! Error types for the authorization core.
//!
//! Two layers of errors exist on purpose:
//!
//! - [`CoreError`] is the caller-visible taxonomy. Every variant carries a
//!   stable machine-readable code; the `Display` text is a log-only human
//!   message and is never part of the contract.
//! - [`DbError`] and [`crate::token::TokenError`] are internal. They are
//!   classified from raw driver/library errors at the component boundary and
//!   re-tagged into `CoreError` before they can reach a caller. Raw driver
//!   errors never leak.

use thiserror::Error;
use uuid::Uuid;

/// Reason attached to a `Forbidden` decision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ForbiddenReason {
    OwnerMismatch,
    NotPublic,
    NotTeamMember,
    RoleInsufficient,
    PrivilegeEscalationBlocked,
    EnumerationBlocked,
    DefaultDeny,
}

impl ForbiddenReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForbiddenReason::OwnerMismatch => "owner_mismatch",
            ForbiddenReason::NotPublic => "not_public",
            ForbiddenReason::NotTeamMember => "not_team_member",
            ForbiddenReason::RoleInsufficient => "role_insufficient",
            ForbiddenReason::PrivilegeEscalationBlocked => "privilege_escalation_blocked",
            ForbiddenReason::EnumerationBlocked => "enumeration_blocked",
            ForbiddenReason::DefaultDeny => "default_deny",
        }
    }
}

/// Internal database error classification.
///
/// Produced by the query executor from raw sqlx errors; consumed by the
/// services, which either recover locally (e.g. a row-level policy denial
/// during auto-provision moves to the next resolver layer) or re-tag into
/// [`CoreError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("query timed out after {timeout_ms} ms during {op}")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("row-level policy denied the query")]
    RowLevelPolicyDenied,

    #[error("foreign key violation")]
    ForeignKeyViolation,

    #[error("unique violation")]
    UniqueViolation,

    #[error("privileged credential rejected: {0}")]
    CredentialRejected(String),

    #[error("database error: {0}")]
    Unknown(String),
}

impl DbError {
    /// Classify a raw sqlx error. The raw message survives only inside the
    /// variant payload, which is logged and never surfaced.
    pub fn classify(err: &sqlx::Error) -> DbError {
        match err {
            sqlx::Error::PoolTimedOut => DbError::Unavailable("pool acquire timed out".into()),
            sqlx::Error::PoolClosed => DbError::Unavailable("pool closed".into()),
            sqlx::Error::Io(e) => DbError::Unavailable(format!("io: {e}")),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                let message = db.message().to_string();
                match code.as_str() {
                    // insufficient_privilege: RLS refused the statement
                    "42501" => DbError::RowLevelPolicyDenied,
                    "23503" => DbError::ForeignKeyViolation,
                    "23505" => DbError::UniqueViolation,
                    // statement_timeout fires as query_canceled
                    "57014" => DbError::Timeout {
                        op: "statement",
                        timeout_ms: 0,
                    },
                    // serialization failure / deadlock: transient, retryable
                    "40001" | "40P01" | "08000" | "08006" => {
                        DbError::Unavailable(format!("transient: {message}"))
                    }
                    _ if is_credential_rejection(&message) => {
                        DbError::CredentialRejected(message)
                    }
                    _ => DbError::Unknown(message),
                }
            }
            other => DbError::Unknown(other.to_string()),
        }
    }

    /// Transient errors are worth retrying with backoff (deadlocks,
    /// serialization failures, dropped connections, pool exhaustion).
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

/// Message patterns that mean the privileged service credential itself was
/// rejected, rather than the query. These flip the credential gate to
/// delegated-only mode.
pub fn is_credential_rejection(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("invalid api key")
        || lower.contains("database error granting user")
        || lower.contains("jwt")
        || lower.contains("token is invalid")
}

/// Caller-visible error taxonomy.
///
/// `Display` text is the log-only human message; callers should branch on the
/// variant or on [`CoreError::code`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed: {reason}")]
    Unauthenticated { reason: crate::token::TokenError },

    #[error("access denied: {}", reason.as_str())]
    Forbidden { reason: ForbiddenReason },

    #[error("{what} not found")]
    NotFound { what: &'static str },

    #[error("conflict on {what}; safe to retry")]
    Conflict { what: &'static str },

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("temporarily unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("internal error, correlation id {correlation_id}")]
    Internal { correlation_id: Uuid },
}

impl CoreError {
    /// Construct an `Internal` error, logging the underlying cause once with
    /// the correlation id that the caller will see.
    pub fn internal(cause: impl std::fmt::Display) -> CoreError {
        let correlation_id = Uuid::new_v4();
        tracing::error!(
            target: "authz.errors",
            correlation_id = %correlation_id,
            cause = %cause,
            "Internal error"
        );
        CoreError::Internal { correlation_id }
    }

    pub fn unavailable(detail: impl Into<String>) -> CoreError {
        CoreError::Unavailable {
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code for callers and for metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated { .. } => "UNAUTHENTICATED",
            CoreError::Forbidden { .. } => "FORBIDDEN",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Conflict { .. } => "CONFLICT",
            CoreError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            CoreError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            CoreError::Unavailable { .. } => "UNAVAILABLE",
            CoreError::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether a caller retry (with backoff) can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict { .. }
                | CoreError::Unavailable { .. }
                | CoreError::DeadlineExceeded
        )
    }
}

/// Boundary re-tagging of internal database errors.
impl From<DbError> for CoreError {
    fn from(err: DbError) -> CoreError {
        match err {
            DbError::Timeout { .. } | DbError::Unavailable(_) => CoreError::Unavailable {
                detail: err.to_string(),
            },
            DbError::RowLevelPolicyDenied => CoreError::Forbidden {
                reason: ForbiddenReason::DefaultDeny,
            },
            DbError::UniqueViolation => CoreError::Conflict { what: "row" },
            DbError::ForeignKeyViolation | DbError::Unknown(_) => CoreError::internal(err),
            DbError::CredentialRejected(_) => CoreError::Unavailable {
                detail: "privileged credential rejected".into(),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_reason_strings() {
        assert_eq!(ForbiddenReason::OwnerMismatch.as_str(), "owner_mismatch");
        assert_eq!(ForbiddenReason::DefaultDeny.as_str(), "default_deny");
        assert_eq!(
            ForbiddenReason::PrivilegeEscalationBlocked.as_str(),
            "privilege_escalation_blocked"
        );
    }

    #[test]
    fn test_credential_rejection_patterns() {
        assert!(is_credential_rejection("Invalid API key"));
        assert!(is_credential_rejection("Database error granting user"));
        assert!(is_credential_rejection("JWT expired"));
        assert!(!is_credential_rejection("relation does not exist"));
        assert!(!is_credential_rejection("syntax error at or near"));
    }

    #[test]
    fn test_db_error_retags_to_core() {
        let core: CoreError = DbError::UniqueViolation.into();
        assert_eq!(core.code(), "CONFLICT");

        let core: CoreError = DbError::RowLevelPolicyDenied.into();
        assert_eq!(core.code(), "FORBIDDEN");

        let core: CoreError = DbError::Unavailable("pool closed".into()).into();
        assert_eq!(core.code(), "UNAVAILABLE");

        let core: CoreError = DbError::Timeout {
            op: "select",
            timeout_ms: 1000,
        }
        .into();
        assert_eq!(core.code(), "UNAVAILABLE");
    }

    #[test]
    fn test_unknown_db_error_does_not_leak_message() {
        let raw = "ERROR: column users.shadow_credits does not exist";
        let core: CoreError = DbError::Unknown(raw.to_string()).into();
        // The caller-facing rendering carries the correlation id only
        assert!(!core.to_string().contains("shadow_credits"));
        assert_eq!(core.code(), "INTERNAL");
    }

    #[test]
    fn test_retryability() {
        assert!(CoreError::Conflict { what: "user" }.is_retryable());
        assert!(CoreError::unavailable("cache down").is_retryable());
        assert!(CoreError::DeadlineExceeded.is_retryable());
        assert!(!CoreError::Forbidden {
            reason: ForbiddenReason::DefaultDeny
        }
        .is_retryable());
        assert!(!CoreError::InsufficientCredits {
            required: 45,
            available: 5
        }
        .is_retryable());
    }
}
