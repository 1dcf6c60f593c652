//! Bearer token classification and validation.
//!
//! Incoming bearer strings are one of four variants, decided by a structure
//! test and matched exhaustively (no duck typing):
//!
//! 1. Signed JWT - three base64url segments, verified against the issuer
//! 2. Opaque provider token - `supabase_token_<uuid>`, trusted identity
//!    assertion whose UUID must equal the claimed user id
//! 3. Development token - `mock_token_` / `dev_token_`, accepted only when
//!    the runtime is explicitly configured non-production
//! 4. Unknown - rejected
//!
//! The validator is pure and synchronous. Its only lookup is the in-process
//! key store; it never touches the database.

use crate::config::{Config, Environment};
use crate::models::UserRole;
use chrono::{DateTime, TimeZone, Utc};
use common::jwt::{self, Claims, MAX_JWT_SIZE_BYTES};
use common::secret::ExposeSecret;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// How long a fetched verification key stays usable before the caller must
/// re-fetch it from the identity provider.
pub const KEY_TTL: Duration = Duration::from_secs(3_600);

const PROVIDER_PREFIX: &str = "supabase_token_";
const DEV_PREFIXES: [&str; 2] = ["mock_token_", "dev_token_"];

/// Why a token was rejected. Surfaced to callers as
/// `CoreError::Unauthenticated { reason }`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token_malformed")]
    Malformed,

    #[error("token_expired")]
    Expired,

    #[error("token_not_yet_valid")]
    NotYetValid,

    #[error("token_signature_invalid")]
    SignatureInvalid,

    #[error("token_issuer_unknown")]
    IssuerUnknown,

    #[error("token_audience_mismatch")]
    AudienceMismatch,

    #[error("token_rejected_in_production")]
    RejectedInProduction,

    #[error("token_subject_mismatch")]
    SubjectMismatch,
}

/// Structural variant of a bearer string, decided before any verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerToken {
    SignedJwt,
    Provider { user_id: Uuid },
    Dev { user_id: Option<Uuid> },
    Unknown,
}

impl BearerToken {
    /// Classify a raw bearer string by prefix/structure. Classification
    /// never fails; invalid content inside a recognized shape surfaces
    /// later, during validation.
    pub fn classify(raw: &str) -> BearerToken {
        if let Some(rest) = raw.strip_prefix(PROVIDER_PREFIX) {
            return match Uuid::parse_str(rest) {
                Ok(user_id) => BearerToken::Provider { user_id },
                Err(_) => BearerToken::Unknown,
            };
        }

        for prefix in DEV_PREFIXES {
            if let Some(rest) = raw.strip_prefix(prefix) {
                return BearerToken::Dev {
                    user_id: Uuid::parse_str(rest).ok(),
                };
            }
        }

        if raw.split('.').count() == 3 && !raw.is_empty() {
            return BearerToken::SignedJwt;
        }

        BearerToken::Unknown
    }
}

/// Variant tag carried on a validated token, for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVariant {
    Jwt,
    Provider,
    Dev,
}

impl TokenVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenVariant::Jwt => "jwt",
            TokenVariant::Provider => "provider",
            TokenVariant::Dev => "dev",
        }
    }
}

/// A successfully validated bearer token.
///
/// `raw` is kept so delegated database calls can place the token on the
/// connection; it is redacted in Debug output.
#[derive(Clone)]
pub struct ValidatedToken {
    pub user_id: Uuid,
    pub role: UserRole,
    pub expires_at: Option<DateTime<Utc>>,
    pub variant: TokenVariant,
    pub raw: String,
}

impl fmt::Debug for ValidatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedToken")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .field("variant", &self.variant)
            .field("raw", &"[REDACTED]")
            .finish()
    }
}

impl ValidatedToken {
    /// Strict expiry re-check. Used by resolvers immediately before a
    /// delegated database call: an expired token must never reach a
    /// connection, even if it validated earlier in the request.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => exp.timestamp() <= Utc::now().timestamp(),
            None => false,
        }
    }
}

/// In-process store of asymmetric verification keys, keyed by `kid`.
///
/// Keys are pushed in by whatever fetches them from the identity provider
/// and expire after [`KEY_TTL`]; lookup is a bounded in-process read.
pub struct KeyStore {
    keys: RwLock<HashMap<String, (DecodingKey, Instant)>>,
    ttl: Duration,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new(KEY_TTL)
    }
}

impl KeyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, kid: impl Into<String>, key: DecodingKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(kid.into(), (key, Instant::now()));
        }
    }

    pub fn get(&self, kid: &str) -> Option<DecodingKey> {
        let keys = self.keys.read().ok()?;
        let (key, inserted_at) = keys.get(kid)?;
        if inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(key.clone())
    }
}

/// Pure bearer token validator.
pub struct TokenValidator {
    env: Environment,
    allow_mock_tokens: bool,
    issuer: String,
    audience: String,
    allowed_algs: Vec<Algorithm>,
    symmetric_key: Option<DecodingKey>,
    keys: KeyStore,
}

impl TokenValidator {
    pub fn from_config(config: &Config) -> Self {
        let allowed_algs = config
            .token_algs
            .iter()
            .filter_map(|a| match a.as_str() {
                "HS256" => Some(Algorithm::HS256),
                "RS256" => Some(Algorithm::RS256),
                "ES256" => Some(Algorithm::ES256),
                _ => None,
            })
            .collect();

        let symmetric_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.expose_secret().as_bytes()));

        Self {
            env: config.env,
            allow_mock_tokens: config.allow_mock_tokens,
            issuer: config.token_issuer.clone(),
            audience: config.token_audience.clone(),
            allowed_algs,
            symmetric_key,
            keys: KeyStore::default(),
        }
    }

    /// Register an asymmetric verification key fetched from the issuer.
    pub fn register_key(&self, kid: impl Into<String>, key: DecodingKey) {
        self.keys.insert(kid, key);
    }

    /// Validate a bearer string against a caller-claimed user id.
    pub fn validate(
        &self,
        raw: &str,
        claimed_user_id: Uuid,
    ) -> Result<ValidatedToken, TokenError> {
        match BearerToken::classify(raw) {
            BearerToken::SignedJwt => self.validate_jwt(raw, claimed_user_id),
            BearerToken::Provider { user_id } => {
                // Trusted identity assertion; the carried UUID must equal the
                // claimed identity.
                if user_id != claimed_user_id {
                    tracing::warn!(
                        target: "authz.token",
                        "Provider token subject does not match claimed user id"
                    );
                    return Err(TokenError::SubjectMismatch);
                }
                Ok(ValidatedToken {
                    user_id,
                    role: UserRole::User,
                    expires_at: None,
                    variant: TokenVariant::Provider,
                    raw: raw.to_string(),
                })
            }
            BearerToken::Dev { user_id } => {
                if !self.allow_mock_tokens || self.env != Environment::Dev {
                    return Err(TokenError::RejectedInProduction);
                }
                Ok(ValidatedToken {
                    user_id: user_id.unwrap_or(claimed_user_id),
                    role: UserRole::User,
                    expires_at: None,
                    variant: TokenVariant::Dev,
                    raw: raw.to_string(),
                })
            }
            BearerToken::Unknown => Err(TokenError::Malformed),
        }
    }

    fn validate_jwt(
        &self,
        raw: &str,
        claimed_user_id: Uuid,
    ) -> Result<ValidatedToken, TokenError> {
        if raw.len() > MAX_JWT_SIZE_BYTES {
            return Err(TokenError::Malformed);
        }

        let header = decode_header(raw).map_err(|_| TokenError::Malformed)?;

        if !self.allowed_algs.contains(&header.alg) {
            tracing::debug!(
                target: "authz.token",
                alg = ?header.alg,
                "Token rejected: algorithm not in allow-list"
            );
            return Err(TokenError::SignatureInvalid);
        }

        let key = match header.alg {
            Algorithm::HS256 => self
                .symmetric_key
                .clone()
                .ok_or(TokenError::IssuerUnknown)?,
            _ => {
                let kid = jwt::extract_kid(raw).map_err(|_| TokenError::Malformed)?;
                self.keys.get(&kid).ok_or(TokenError::IssuerUnknown)?
            }
        };

        // Expiry and skew are validated manually below: expiry must be
        // strict (no leeway) while nbf/iat get the 30 s skew.
        let mut validation = Validation::new(header.alg);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;

        let data =
            decode::<Claims>(raw, &key, &validation).map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    TokenError::SignatureInvalid
                }
                _ => TokenError::Malformed,
            })?;
        let claims = data.claims;

        match claims.iss.as_deref() {
            Some(iss) if iss == self.issuer => {}
            _ => return Err(TokenError::IssuerUnknown),
        }

        match claims.aud.as_deref() {
            Some(aud) if aud == self.audience => {}
            _ => return Err(TokenError::AudienceMismatch),
        }

        jwt::validate_exp(claims.exp).map_err(|_| TokenError::Expired)?;
        if let Some(nbf) = claims.nbf {
            jwt::validate_nbf(nbf, jwt::DEFAULT_CLOCK_SKEW)
                .map_err(|_| TokenError::NotYetValid)?;
        }
        if let Some(iat) = claims.iat {
            jwt::validate_iat(iat, jwt::DEFAULT_CLOCK_SKEW)
                .map_err(|_| TokenError::NotYetValid)?;
        }

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Malformed)?;
        if user_id != claimed_user_id {
            tracing::warn!(
                target: "authz.token",
                "JWT subject does not match claimed user id"
            );
            return Err(TokenError::SubjectMismatch);
        }

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(TokenError::Malformed)?;

        Ok(ValidatedToken {
            user_id,
            role: claims
                .role
                .as_deref()
                .map(UserRole::parse)
                .unwrap_or(UserRole::Viewer),
            expires_at: Some(expires_at),
            variant: TokenVariant::Jwt,
            raw: raw.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::collections::HashMap as StdHashMap;

    const TEST_SECRET: &str = "unit-test-secret";
    const TEST_ISSUER: &str = "https://issuer.example";

    fn validator(env: &str, allow_mock: bool) -> TokenValidator {
        let mut vars = StdHashMap::new();
        vars.insert("AUTHZ_ENV".into(), env.into());
        vars.insert("DATABASE_URL".into(), "postgres://localhost/db".into());
        vars.insert("SERVICE_CREDENTIAL".into(), "svc".into());
        vars.insert("TOKEN_ISSUER".into(), TEST_ISSUER.into());
        vars.insert("JWT_SECRET".into(), TEST_SECRET.into());
        if allow_mock {
            vars.insert("ALLOW_MOCK_TOKENS".into(), "true".into());
        }
        let config = Config::from_vars(&vars).unwrap();
        TokenValidator::from_config(&config)
    }

    fn sign(claims: &Claims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn valid_claims(sub: Uuid) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            sub: sub.to_string(),
            exp: now + 3600,
            iat: Some(now),
            nbf: None,
            iss: Some(TEST_ISSUER.to_string()),
            aud: Some("authenticated".to_string()),
            email: Some("caller@example.com".to_string()),
            role: Some("user".to_string()),
        }
    }

    #[test]
    fn test_classify_variants() {
        let id = Uuid::new_v4();
        assert_eq!(
            BearerToken::classify(&format!("supabase_token_{id}")),
            BearerToken::Provider { user_id: id }
        );
        assert_eq!(
            BearerToken::classify(&format!("mock_token_{id}")),
            BearerToken::Dev { user_id: Some(id) }
        );
        assert_eq!(
            BearerToken::classify("dev_token_whatever"),
            BearerToken::Dev { user_id: None }
        );
        assert_eq!(BearerToken::classify("a.b.c"), BearerToken::SignedJwt);
        assert_eq!(BearerToken::classify("not a token"), BearerToken::Unknown);
        assert_eq!(
            BearerToken::classify("supabase_token_not-a-uuid"),
            BearerToken::Unknown
        );
    }

    #[test]
    fn test_valid_jwt_accepted() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();
        let token = sign(&valid_claims(sub));

        let validated = v.validate(&token, sub).unwrap();
        assert_eq!(validated.user_id, sub);
        assert_eq!(validated.role, UserRole::User);
        assert_eq!(validated.variant, TokenVariant::Jwt);
        assert!(!validated.is_expired());
    }

    #[test]
    fn test_expired_jwt_rejected_strict_boundary() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();

        // exp exactly now: already rejected
        let mut claims = valid_claims(sub);
        claims.exp = Utc::now().timestamp();
        assert_eq!(
            v.validate(&sign(&claims), sub).unwrap_err(),
            TokenError::Expired
        );

        // ten seconds in the past
        claims.exp = Utc::now().timestamp() - 10;
        assert_eq!(
            v.validate(&sign(&claims), sub).unwrap_err(),
            TokenError::Expired
        );
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &valid_claims(sub),
            &EncodingKey::from_secret(b"a-different-secret"),
        )
        .unwrap();

        assert_eq!(
            v.validate(&token, sub).unwrap_err(),
            TokenError::SignatureInvalid
        );
    }

    #[test]
    fn test_disallowed_algorithm_rejected() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();
        let token = encode(
            &Header::new(Algorithm::HS384),
            &valid_claims(sub),
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        assert_eq!(
            v.validate(&token, sub).unwrap_err(),
            TokenError::SignatureInvalid
        );
    }

    #[test]
    fn test_issuer_mismatch_rejected() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();
        let mut claims = valid_claims(sub);
        claims.iss = Some("https://evil.example".to_string());
        assert_eq!(
            v.validate(&sign(&claims), sub).unwrap_err(),
            TokenError::IssuerUnknown
        );
    }

    #[test]
    fn test_audience_mismatch_rejected() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();
        let mut claims = valid_claims(sub);
        claims.aud = Some("other-service".to_string());
        assert_eq!(
            v.validate(&sign(&claims), sub).unwrap_err(),
            TokenError::AudienceMismatch
        );
    }

    #[test]
    fn test_nbf_beyond_skew_rejected() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();
        let mut claims = valid_claims(sub);
        claims.nbf = Some(Utc::now().timestamp() + 120);
        assert_eq!(
            v.validate(&sign(&claims), sub).unwrap_err(),
            TokenError::NotYetValid
        );
    }

    #[test]
    fn test_jwt_subject_must_match_claimed() {
        let v = validator("prod", false);
        let sub = Uuid::new_v4();
        let token = sign(&valid_claims(sub));
        assert_eq!(
            v.validate(&token, Uuid::new_v4()).unwrap_err(),
            TokenError::SubjectMismatch
        );
    }

    #[test]
    fn test_provider_token_uuid_must_match_claimed() {
        let v = validator("prod", false);
        let id = Uuid::new_v4();
        let token = format!("supabase_token_{id}");

        let validated = v.validate(&token, id).unwrap();
        assert_eq!(validated.user_id, id);
        assert_eq!(validated.variant, TokenVariant::Provider);
        assert!(validated.expires_at.is_none());

        assert_eq!(
            v.validate(&token, Uuid::new_v4()).unwrap_err(),
            TokenError::SubjectMismatch
        );
    }

    #[test]
    fn test_dev_token_rejected_in_production() {
        let v = validator("prod", false);
        let id = Uuid::new_v4();
        assert_eq!(
            v.validate(&format!("mock_token_{id}"), id).unwrap_err(),
            TokenError::RejectedInProduction
        );
    }

    #[test]
    fn test_dev_token_accepted_in_dev() {
        let v = validator("dev", true);
        let id = Uuid::new_v4();
        let validated = v.validate(&format!("dev_token_{id}"), id).unwrap();
        assert_eq!(validated.user_id, id);
        assert_eq!(validated.variant, TokenVariant::Dev);
    }

    #[test]
    fn test_dev_token_requires_opt_in_even_in_dev() {
        let v = validator("dev", false);
        let id = Uuid::new_v4();
        assert_eq!(
            v.validate(&format!("dev_token_{id}"), id).unwrap_err(),
            TokenError::RejectedInProduction
        );
    }

    #[test]
    fn test_unknown_token_rejected() {
        let v = validator("prod", false);
        assert_eq!(
            v.validate("garbage", Uuid::new_v4()).unwrap_err(),
            TokenError::Malformed
        );
    }

    #[test]
    fn test_oversized_token_rejected() {
        let v = validator("prod", false);
        let token = format!("{}.{}.{}", "a".repeat(4000), "b".repeat(4000), "c");
        assert_eq!(
            v.validate(&token, Uuid::new_v4()).unwrap_err(),
            TokenError::Malformed
        );
    }

    #[test]
    fn test_key_store_ttl_expiry() {
        let store = KeyStore::new(Duration::from_millis(0));
        store.insert("kid-1", DecodingKey::from_secret(b"k"));
        // TTL of zero: the key is already stale on the next lookup
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get("kid-1").is_none());

        let store = KeyStore::new(Duration::from_secs(60));
        store.insert("kid-1", DecodingKey::from_secret(b"k"));
        assert!(store.get("kid-1").is_some());
        assert!(store.get("kid-2").is_none());
    }

    #[test]
    fn test_validated_token_debug_redacts_raw() {
        let v = validator("dev", true);
        let id = Uuid::new_v4();
        let raw = format!("mock_token_{id}");
        let validated = v.validate(&raw, id).unwrap();
        let debug = format!("{validated:?}");
        assert!(!debug.contains(&raw));
        assert!(debug.contains("[REDACTED]"));
    }
}
