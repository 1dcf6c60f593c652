//! Service configuration.
//!
//! Configuration is read once at startup; there is no hot reload. The
//! `from_vars` constructor exists so tests can exercise every validation
//! path without touching the process environment.

use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Credits granted to an auto-provisioned user when not configured.
pub const DEFAULT_USER_CREDITS: i32 = 100;

/// Privileged credential validity cache TTL (24 hours).
pub const DEFAULT_SERVICE_CRED_TTL: Duration = Duration::from_secs(86_400);

/// Default caller deadline for authorization decisions.
pub const DEFAULT_AUTH_DEADLINE_MS: u64 = 500;

/// Default caller deadline for general operations.
pub const DEFAULT_GENERAL_DEADLINE_MS: u64 = 5_000;

/// Token algorithms the validator may be configured to accept.
const SUPPORTED_TOKEN_ALGS: [&str; 3] = ["HS256", "RS256", "ES256"];

/// Runtime environment. Dev-mode tokens are only ever accepted in `Dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Environment> {
        match s {
            "dev" | "development" => Some(Environment::Dev),
            "staging" => Some(Environment::Staging),
            "prod" | "production" => Some(Environment::Prod),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Prod)
    }
}

/// Per-pool sizing override, keyed by pool name ("auth", "read", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizeOverride {
    pub min: u32,
    pub max: u32,
}

/// Application configuration with secure handling of sensitive fields.
///
/// `service_credential` and `jwt_secret` are wrapped in `SecretString`
/// (automatic redaction, explicit `.expose_secret()`); `database_url` and
/// `kv_url` are redacted in Debug output since connection strings may carry
/// credentials.
pub struct Config {
    pub env: Environment,
    pub database_url: String,
    pub pool_overrides: HashMap<String, PoolSizeOverride>,
    /// Privileged service credential for the credential gate.
    pub service_credential: SecretString,
    pub service_cred_ttl: Duration,
    /// L2 cache endpoint. `None` disables L2 entirely.
    pub kv_url: Option<String>,
    pub kv_pool_max: u32,
    pub default_user_credits: i32,
    pub token_issuer: String,
    pub token_audience: String,
    pub token_algs: Vec<String>,
    /// Symmetric verification secret, required when HS256 is allowed.
    pub jwt_secret: Option<SecretString>,
    pub allow_mock_tokens: bool,
    pub auth_deadline: Duration,
    pub general_deadline: Duration,
    pub alert_webhook_url: Option<String>,
    /// Well-known identities eligible for the emergency resolver path.
    pub emergency_user_allowlist: Vec<Uuid>,
    pub enable_escalation_guards: bool,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            env: self.env,
            database_url: self.database_url.clone(),
            pool_overrides: self.pool_overrides.clone(),
            service_credential: self.service_credential.clone(),
            service_cred_ttl: self.service_cred_ttl,
            kv_url: self.kv_url.clone(),
            kv_pool_max: self.kv_pool_max,
            default_user_credits: self.default_user_credits,
            token_issuer: self.token_issuer.clone(),
            token_audience: self.token_audience.clone(),
            token_algs: self.token_algs.clone(),
            jwt_secret: self.jwt_secret.clone(),
            allow_mock_tokens: self.allow_mock_tokens,
            auth_deadline: self.auth_deadline,
            general_deadline: self.general_deadline,
            alert_webhook_url: self.alert_webhook_url.clone(),
            emergency_user_allowlist: self.emergency_user_allowlist.clone(),
            enable_escalation_guards: self.enable_escalation_guards,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("env", &self.env)
            .field("database_url", &"[REDACTED]")
            .field("pool_overrides", &self.pool_overrides)
            .field("service_credential", &"[REDACTED]")
            .field("service_cred_ttl", &self.service_cred_ttl)
            .field("kv_url", &self.kv_url.as_ref().map(|_| "[REDACTED]"))
            .field("kv_pool_max", &self.kv_pool_max)
            .field("default_user_credits", &self.default_user_credits)
            .field("token_issuer", &self.token_issuer)
            .field("token_audience", &self.token_audience)
            .field("token_algs", &self.token_algs)
            .field("jwt_secret", &"[REDACTED]")
            .field("allow_mock_tokens", &self.allow_mock_tokens)
            .field("auth_deadline", &self.auth_deadline)
            .field("general_deadline", &self.general_deadline)
            .field("alert_webhook_url", &self.alert_webhook_url)
            .field("emergency_user_allowlist", &self.emergency_user_allowlist)
            .field("enable_escalation_guards", &self.enable_escalation_guards)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Mock tokens must not be enabled in production")]
    MockTokensInProduction,

    #[error("Token algorithm {0} is not supported (allowed: HS256, RS256, ES256)")]
    UnsupportedTokenAlg(String),

    #[error("JWT_SECRET is required when HS256 is in TOKEN_ALGS")]
    MissingJwtSecret,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let env = match vars.get("AUTHZ_ENV") {
            Some(v) => Environment::parse(v).ok_or_else(|| ConfigError::InvalidValue {
                key: "AUTHZ_ENV".into(),
                reason: format!("expected dev/staging/prod, got '{v}'"),
            })?,
            None => Environment::Prod,
        };

        let database_url = vars
            .get("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
            .clone();

        let service_credential = vars
            .get("SERVICE_CREDENTIAL")
            .ok_or_else(|| ConfigError::MissingEnvVar("SERVICE_CREDENTIAL".to_string()))?
            .clone();

        let service_cred_ttl = match vars.get("SERVICE_CRED_TTL_S") {
            Some(v) => Duration::from_secs(parse_u64("SERVICE_CRED_TTL_S", v)?),
            None => DEFAULT_SERVICE_CRED_TTL,
        };

        let kv_url = vars.get("KV_URL").cloned();
        let kv_pool_max = match vars.get("KV_POOL_MAX") {
            Some(v) => u32::try_from(parse_u64("KV_POOL_MAX", v)?).map_err(|_| {
                ConfigError::InvalidValue {
                    key: "KV_POOL_MAX".into(),
                    reason: "out of range".into(),
                }
            })?,
            None => 16,
        };

        let default_user_credits = match vars.get("DEFAULT_USER_CREDITS") {
            Some(v) => {
                let n: i32 = v.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "DEFAULT_USER_CREDITS".into(),
                    reason: format!("{e}"),
                })?;
                if n < 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "DEFAULT_USER_CREDITS".into(),
                        reason: format!("must be non-negative, got {n}"),
                    });
                }
                n
            }
            None => DEFAULT_USER_CREDITS,
        };

        let token_issuer = vars
            .get("TOKEN_ISSUER")
            .ok_or_else(|| ConfigError::MissingEnvVar("TOKEN_ISSUER".to_string()))?
            .clone();

        let token_audience = vars
            .get("TOKEN_AUDIENCE")
            .cloned()
            .unwrap_or_else(|| "authenticated".to_string());

        let token_algs: Vec<String> = vars
            .get("TOKEN_ALGS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec!["HS256".to_string()]);

        for alg in &token_algs {
            if !SUPPORTED_TOKEN_ALGS.contains(&alg.as_str()) {
                return Err(ConfigError::UnsupportedTokenAlg(alg.clone()));
            }
        }

        let jwt_secret = vars.get("JWT_SECRET").cloned().map(SecretString::from);
        if token_algs.iter().any(|a| a == "HS256") && jwt_secret.is_none() {
            return Err(ConfigError::MissingJwtSecret);
        }

        let allow_mock_tokens = vars
            .get("ALLOW_MOCK_TOKENS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if allow_mock_tokens && env.is_production() {
            return Err(ConfigError::MockTokensInProduction);
        }

        if allow_mock_tokens {
            warn!(
                target: "authz.config",
                "Mock tokens are ENABLED; this must never appear outside development"
            );
        }

        let auth_deadline = Duration::from_millis(match vars.get("AUTH_DEADLINE_MS") {
            Some(v) => parse_u64("AUTH_DEADLINE_MS", v)?,
            None => DEFAULT_AUTH_DEADLINE_MS,
        });

        let general_deadline = Duration::from_millis(match vars.get("GENERAL_DEADLINE_MS") {
            Some(v) => parse_u64("GENERAL_DEADLINE_MS", v)?,
            None => DEFAULT_GENERAL_DEADLINE_MS,
        });

        let alert_webhook_url = vars.get("ALERT_WEBHOOK_URL").cloned();

        let emergency_user_allowlist = match vars.get("EMERGENCY_USER_ALLOWLIST") {
            Some(v) => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Uuid::parse_str(s).map_err(|e| ConfigError::InvalidValue {
                        key: "EMERGENCY_USER_ALLOWLIST".into(),
                        reason: format!("'{s}': {e}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let enable_escalation_guards = vars
            .get("ENABLE_ESCALATION_GUARDS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let pool_overrides = parse_pool_overrides(vars)?;

        Ok(Config {
            env,
            database_url,
            pool_overrides,
            service_credential: SecretString::from(service_credential),
            service_cred_ttl,
            kv_url,
            kv_pool_max,
            default_user_credits,
            token_issuer,
            token_audience,
            token_algs,
            jwt_secret,
            allow_mock_tokens,
            auth_deadline,
            general_deadline,
            alert_webhook_url,
            emergency_user_allowlist,
            enable_escalation_guards,
        })
    }

    /// Raw credential bytes for the gate's probe and fingerprint.
    pub fn service_credential_raw(&self) -> &str {
        self.service_credential.expose_secret()
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("{e}"),
    })
}

/// Parse DB_POOL_<NAME>_MIN / DB_POOL_<NAME>_MAX pairs into sizing overrides.
fn parse_pool_overrides(
    vars: &HashMap<String, String>,
) -> Result<HashMap<String, PoolSizeOverride>, ConfigError> {
    let mut overrides = HashMap::new();

    for name in ["auth", "read", "write", "analytics", "admin", "batch"] {
        let upper = name.to_uppercase();
        let min_key = format!("DB_POOL_{upper}_MIN");
        let max_key = format!("DB_POOL_{upper}_MAX");

        let min = vars.get(&min_key);
        let max = vars.get(&max_key);
        if min.is_none() && max.is_none() {
            continue;
        }

        let (min, max) = match (min, max) {
            (Some(min), Some(max)) => (
                u32::try_from(parse_u64(&min_key, min)?).unwrap_or(u32::MAX),
                u32::try_from(parse_u64(&max_key, max)?).unwrap_or(u32::MAX),
            ),
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: format!("DB_POOL_{upper}_MIN/MAX"),
                    reason: "both min and max must be set together".into(),
                })
            }
        };

        if min > max || max == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("DB_POOL_{upper}_MIN/MAX"),
                reason: format!("invalid sizing min={min} max={max}"),
            });
        }

        overrides.insert(name.to_string(), PoolSizeOverride { min, max });
    }

    Ok(overrides)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn minimal_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("AUTHZ_ENV".into(), "dev".into());
        vars.insert(
            "DATABASE_URL".into(),
            "postgres://localhost:5432/authz".into(),
        );
        vars.insert("SERVICE_CREDENTIAL".into(), "svc-secret".into());
        vars.insert("TOKEN_ISSUER".into(), "https://issuer.example".into());
        vars.insert("JWT_SECRET".into(), "shared-secret".into());
        vars
    }

    #[test]
    fn test_minimal_config_loads_with_defaults() {
        let config = Config::from_vars(&minimal_vars()).unwrap();

        assert_eq!(config.env, Environment::Dev);
        assert_eq!(config.default_user_credits, DEFAULT_USER_CREDITS);
        assert_eq!(config.service_cred_ttl, DEFAULT_SERVICE_CRED_TTL);
        assert_eq!(config.token_algs, vec!["HS256".to_string()]);
        assert_eq!(config.token_audience, "authenticated");
        assert!(!config.allow_mock_tokens);
        assert!(config.enable_escalation_guards);
        assert!(config.kv_url.is_none());
        assert!(config.emergency_user_allowlist.is_empty());
        assert_eq!(
            config.auth_deadline,
            Duration::from_millis(DEFAULT_AUTH_DEADLINE_MS)
        );
    }

    #[test]
    fn test_missing_database_url_fails() {
        let mut vars = minimal_vars();
        vars.remove("DATABASE_URL");
        let err = Config::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "DATABASE_URL"));
    }

    #[test]
    fn test_mock_tokens_refused_in_production() {
        let mut vars = minimal_vars();
        vars.insert("AUTHZ_ENV".into(), "prod".into());
        vars.insert("ALLOW_MOCK_TOKENS".into(), "true".into());
        let err = Config::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MockTokensInProduction));
    }

    #[test]
    fn test_mock_tokens_allowed_in_dev() {
        let mut vars = minimal_vars();
        vars.insert("ALLOW_MOCK_TOKENS".into(), "true".into());
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.allow_mock_tokens);
    }

    #[test]
    fn test_unsupported_alg_rejected() {
        let mut vars = minimal_vars();
        vars.insert("TOKEN_ALGS".into(), "HS256,none".into());
        let err = Config::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedTokenAlg(a) if a == "none"));
    }

    #[test]
    fn test_hs256_requires_secret() {
        let mut vars = minimal_vars();
        vars.remove("JWT_SECRET");
        let err = Config::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingJwtSecret));
    }

    #[test]
    fn test_asymmetric_only_needs_no_secret() {
        let mut vars = minimal_vars();
        vars.remove("JWT_SECRET");
        vars.insert("TOKEN_ALGS".into(), "RS256,ES256".into());
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn test_pool_overrides_parsed() {
        let mut vars = minimal_vars();
        vars.insert("DB_POOL_AUTH_MIN".into(), "4".into());
        vars.insert("DB_POOL_AUTH_MAX".into(), "40".into());
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(
            config.pool_overrides.get("auth"),
            Some(&PoolSizeOverride { min: 4, max: 40 })
        );
        assert!(config.pool_overrides.get("read").is_none());
    }

    #[test]
    fn test_pool_override_requires_both_bounds() {
        let mut vars = minimal_vars();
        vars.insert("DB_POOL_WRITE_MAX".into(), "10".into());
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_pool_override_rejects_min_above_max() {
        let mut vars = minimal_vars();
        vars.insert("DB_POOL_READ_MIN".into(), "50".into());
        vars.insert("DB_POOL_READ_MAX".into(), "5".into());
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_emergency_allowlist_parsed() {
        let mut vars = minimal_vars();
        let id = Uuid::new_v4();
        vars.insert("EMERGENCY_USER_ALLOWLIST".into(), format!("{id}, "));
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.emergency_user_allowlist, vec![id]);
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let mut vars = minimal_vars();
        vars.insert("KV_URL".into(), "redis://:hunter2@localhost:6379".into());
        let config = Config::from_vars(&vars).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("svc-secret"));
        assert!(!debug.contains("shared-secret"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("postgres://"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_unknown_env_rejected() {
        let mut vars = minimal_vars();
        vars.insert("AUTHZ_ENV".into(), "qa".into());
        assert!(Config::from_vars(&vars).is_err());
    }
}
