//! JWT plumbing shared between the token validator and the resolvers that
//! re-check tokens before delegated database calls.
//!
//! This module provides:
//! - Size limits for DoS prevention
//! - Clock skew constants for `iat`/`nbf` validation
//! - Key ID extraction from JWT headers
//! - Strict expiry and skewed issued-at checks
//! - The claims structure carried by caller tokens
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Expiry is strict: a token whose `exp` equals the current second is
//!   already rejected
//! - Generic error messages prevent information leakage; details are logged
//!   at debug level only
//! - The `sub` and `email` fields in [`Claims`] are redacted in Debug output

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// This limit prevents denial-of-service attacks via oversized tokens. JWTs
/// larger than this size are rejected BEFORE any parsing or cryptographic
/// operations. Typical caller tokens are 300-800 bytes.
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Clock skew tolerance applied to `nbf` and `iat` (30 seconds).
///
/// Tokens issued or becoming valid up to this far in the future are still
/// accepted, to tolerate minor clock drift between the issuer and this
/// service. Expiry gets NO such tolerance.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Maximum allowed clock skew tolerance (5 minutes).
///
/// Prevents misconfiguration that could weaken security by allowing
/// excessively large clock skew tolerance.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during structural JWT validation.
///
/// Note: Error messages are intentionally generic to prevent information
/// leakage. Detailed information is logged at debug level for troubleshooting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token is missing the `kid` header needed for key lookup.
    #[error("The access token is invalid or expired")]
    MissingKid,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,

    /// Token `nbf` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    NotYetValid,

    /// Token `exp` claim is in the past (or exactly now — expiry is strict).
    #[error("The access token is invalid or expired")]
    Expired,
}

// =============================================================================
// Claims
// =============================================================================

/// Caller token claims structure.
///
/// The subject is the caller's user id. `sub` and `email` are redacted in
/// Debug output so claims can ride through `tracing` fields safely.
#[derive(Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id as a UUID string) - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Not-before timestamp (Unix epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// Issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Audience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// Caller email - redacted in Debug output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Role claim ("viewer", "user", "admin", "service").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl fmt::Debug for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("nbf", &self.nbf)
            .field("iss", &self.iss)
            .field("aud", &self.aud)
            .field("email", &"[REDACTED]")
            .field("role", &self.role)
            .finish()
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Extract the `kid` (key ID) from a JWT header without verifying the
/// signature.
///
/// Used to look up the correct verification key when multiple keys may be
/// valid (e.g., during issuer key rotation).
///
/// # Security
///
/// - Token size is checked BEFORE any parsing (denial-of-service prevention)
/// - This function does NOT validate the token signature; the token MUST
///   still be verified after fetching the key
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds `MAX_JWT_SIZE_BYTES`
/// - `MalformedToken` - Token is not valid JWT format
/// - `MissingKid` - Token header doesn't contain a non-empty `kid`
pub fn extract_kid(token: &str) -> Result<String, JwtValidationError> {
    // Check token size first (DoS prevention)
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    // JWT format: header.payload.signature
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        tracing::debug!(
            target: "common.jwt",
            parts = parts.len(),
            "Token rejected: invalid JWT format"
        );
        return Err(JwtValidationError::MalformedToken);
    }

    let header_part = parts.first().ok_or(JwtValidationError::MalformedToken)?;
    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT header base64");
        JwtValidationError::MalformedToken
    })?;

    let header: serde_json::Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT header JSON");
        JwtValidationError::MalformedToken
    })?;

    // Reject empty kid values for defense-in-depth
    let kid = header
        .get("kid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingKid)?;

    Ok(kid)
}

/// Validate the `exp` (expiration) claim.
///
/// Expiry is STRICT: a token is valid only while `now < exp`. A token whose
/// `exp` equals the current second is rejected. No clock skew is applied to
/// expiry.
///
/// # Errors
///
/// Returns `JwtValidationError::Expired` when `exp <= now`.
pub fn validate_exp(exp: i64) -> Result<(), JwtValidationError> {
    validate_exp_at(exp, chrono::Utc::now().timestamp())
}

/// Deterministic `exp` validation against an explicit `now` timestamp.
///
/// Prefer [`validate_exp`] in production code. This variant exists so that
/// the strict boundary can be unit-tested without wall-clock dependence.
pub fn validate_exp_at(exp: i64, now: i64) -> Result<(), JwtValidationError> {
    if exp <= now {
        tracing::debug!(
            target: "common.jwt",
            exp = exp,
            now = now,
            "Token rejected: expired"
        );
        return Err(JwtValidationError::Expired);
    }
    Ok(())
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// Rejects tokens with `iat` too far in the future, which could indicate a
/// token pre-generation attack, clock desynchronization, or manipulation.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if `iat` is more than
/// `clock_skew` in the future.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    validate_iat_at(iat, clock_skew, chrono::Utc::now().timestamp())
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // Safe cast: clock_skew is bounded to MAX_CLOCK_SKEW (300 seconds)
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Validate the `nbf` (not-before) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::NotYetValid` if `nbf` is more than
/// `clock_skew` in the future.
pub fn validate_nbf(nbf: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    validate_nbf_at(nbf, clock_skew, chrono::Utc::now().timestamp())
}

/// Deterministic `nbf` validation against an explicit `now` timestamp.
pub fn validate_nbf_at(
    nbf: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;

    if nbf > now + clock_skew_secs {
        tracing::debug!(
            target: "common.jwt",
            nbf = nbf,
            now = now,
            "Token rejected: not yet valid"
        );
        return Err(JwtValidationError::NotYetValid);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn make_token(header: &str) -> String {
        let h = URL_SAFE_NO_PAD.encode(header);
        let p = URL_SAFE_NO_PAD.encode(r#"{"sub":"u"}"#);
        format!("{h}.{p}.sig")
    }

    #[test]
    fn test_extract_kid_success() {
        let token = make_token(r#"{"alg":"RS256","kid":"key-1"}"#);
        assert_eq!(extract_kid(&token).unwrap(), "key-1");
    }

    #[test]
    fn test_extract_kid_missing() {
        let token = make_token(r#"{"alg":"RS256"}"#);
        assert_eq!(
            extract_kid(&token).unwrap_err(),
            JwtValidationError::MissingKid
        );
    }

    #[test]
    fn test_extract_kid_empty_rejected() {
        let token = make_token(r#"{"alg":"RS256","kid":""}"#);
        assert_eq!(
            extract_kid(&token).unwrap_err(),
            JwtValidationError::MissingKid
        );
    }

    #[test]
    fn test_extract_kid_too_large() {
        let token = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert_eq!(
            extract_kid(&token).unwrap_err(),
            JwtValidationError::TokenTooLarge
        );
    }

    #[test]
    fn test_extract_kid_wrong_segment_count() {
        assert_eq!(
            extract_kid("only.two").unwrap_err(),
            JwtValidationError::MalformedToken
        );
        assert_eq!(
            extract_kid("a.b.c.d").unwrap_err(),
            JwtValidationError::MalformedToken
        );
    }

    #[test]
    fn test_exp_boundary_is_strict() {
        let now = 1_700_000_000;
        // exp == now is already expired
        assert_eq!(
            validate_exp_at(now, now).unwrap_err(),
            JwtValidationError::Expired
        );
        // one second of remaining validity is accepted
        assert!(validate_exp_at(now + 1, now).is_ok());
        assert_eq!(
            validate_exp_at(now - 10, now).unwrap_err(),
            JwtValidationError::Expired
        );
    }

    #[test]
    fn test_iat_within_skew_accepted() {
        let now = 1_700_000_000;
        assert!(validate_iat_at(now + 30, DEFAULT_CLOCK_SKEW, now).is_ok());
        assert!(validate_iat_at(now - 3600, DEFAULT_CLOCK_SKEW, now).is_ok());
    }

    #[test]
    fn test_iat_beyond_skew_rejected() {
        let now = 1_700_000_000;
        assert_eq!(
            validate_iat_at(now + 31, DEFAULT_CLOCK_SKEW, now).unwrap_err(),
            JwtValidationError::IatTooFarInFuture
        );
    }

    #[test]
    fn test_nbf_beyond_skew_rejected() {
        let now = 1_700_000_000;
        assert!(validate_nbf_at(now + 30, DEFAULT_CLOCK_SKEW, now).is_ok());
        assert_eq!(
            validate_nbf_at(now + 31, DEFAULT_CLOCK_SKEW, now).unwrap_err(),
            JwtValidationError::NotYetValid
        );
    }

    #[test]
    fn test_claims_debug_redacts_identity() {
        let claims = Claims {
            sub: "9f1c1a4e-0000-0000-0000-000000000000".to_string(),
            exp: 1_700_000_000,
            iat: Some(1_699_999_000),
            nbf: None,
            iss: Some("https://issuer.example".to_string()),
            aud: Some("authenticated".to_string()),
            email: Some("alice@example.com".to_string()),
            role: Some("user".to_string()),
        };

        let debug = format!("{claims:?}");
        assert!(!debug.contains("9f1c1a4e"));
        assert!(!debug.contains("alice@example.com"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_claims_round_trip() {
        let json = r#"{"sub":"abc","exp":123,"role":"admin"}"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.sub, "abc");
        assert_eq!(claims.exp, 123);
        assert_eq!(claims.role.as_deref(), Some("admin"));
        assert!(claims.iat.is_none());
    }
}
