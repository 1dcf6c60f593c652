//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use these types
//! for all sensitive values like bearer tokens, service credentials, and
//! signing secrets.
//!
//! # Compile-Time Safety
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so any
//! code that derives `Debug` on a struct containing secrets automatically
//! gets safe logging behavior. This makes it **impossible** to accidentally
//! log secrets via `{:?}` or tracing.
//!
//! # Memory Safety
//!
//! Secrets are automatically zeroized when dropped, preventing sensitive
//! data from lingering in memory after use.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct ServiceCredential {
//!     key_id: String,
//!     secret: SecretString,  // Safe: Debug shows "[REDACTED]"
//! }
//!
//! let cred = ServiceCredential {
//!     key_id: "svc-main".to_string(),
//!     secret: SecretString::from("hunter2"),
//! };
//!
//! // This is safe - the secret is redacted
//! println!("{:?}", cred);
//!
//! // To access the actual value, you must explicitly call expose_secret()
//! let raw: &str = cred.secret.expose_secret();
//! # let _ = raw;
//! ```
//!
//! # Usage Guidelines
//!
//! Use `SecretString` for:
//! - The privileged service credential
//! - Bearer tokens held longer than a single call
//! - Symmetric JWT signing secrets
//!
//! Use `SecretBox<T>` for custom secret types (e.g., binary key material).

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};
