//! Privileged service credential gate.
//!
//! The core talks to the datastore in two modes: privileged (service
//! credential, bypasses row-level policies) and delegated (caller token,
//! policies active). This module owns the single piece of state deciding
//! which mode is currently usable, so no call site ever probes the
//! credential on its own.
//!
//! Validity is cached for 24 hours, keyed by a fingerprint of the
//! credential. A cache miss triggers exactly one probe (a bounded privileged
//! read); concurrent callers coalesce on the state mutex and observe the
//! probe's result. Any privileged query that fails with a credential
//! rejection flips the gate to delegated-only immediately, and a re-probe is
//! not attempted for at least 60 seconds.

use crate::errors::DbError;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Probe timeout (3 seconds by default).
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Minimum wait before re-probing after a demotion.
pub const REPROBE_BACKOFF: Duration = Duration::from_secs(60);

/// Current query mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Privileged,
    DelegatedOnly,
}

impl GateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateMode::Privileged => "privileged",
            GateMode::DelegatedOnly => "delegated_only",
        }
    }
}

/// A bounded privileged read that succeeds only if the service credential is
/// accepted by the datastore.
pub trait CredentialProbe: Send + Sync {
    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), DbError>> + Send + '_>>;
}

/// Gate statistics for the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GateStats {
    pub mode: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub last_probe_ms: Option<u64>,
    pub consecutive_failures: u32,
}

struct GateState {
    mode: GateMode,
    validated_at: Option<Instant>,
    last_probe_ms: Option<u64>,
    consecutive_failures: u32,
    reprobe_not_before: Option<Instant>,
    hits: u64,
    misses: u64,
    demotion_logged: bool,
}

pub struct CredentialGate {
    probe: Arc<dyn CredentialProbe>,
    /// SHA-256 prefix of the credential, for log correlation only.
    fingerprint: String,
    ttl: Duration,
    probe_timeout: Duration,
    state: Mutex<GateState>,
}

impl CredentialGate {
    pub fn new(
        probe: Arc<dyn CredentialProbe>,
        credential: &str,
        ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            fingerprint: fingerprint(credential),
            ttl,
            probe_timeout,
            state: Mutex::new(GateState {
                mode: GateMode::DelegatedOnly,
                validated_at: None,
                last_probe_ms: None,
                consecutive_failures: 0,
                reprobe_not_before: None,
                hits: 0,
                misses: 0,
                demotion_logged: false,
            }),
        }
    }

    /// Current query mode, probing on cache miss.
    ///
    /// The state mutex is held across the probe, so concurrent callers
    /// coalesce: one probe runs, the rest observe its result as a cache hit.
    pub async fn mode(&self) -> GateMode {
        let mut state = self.state.lock().await;

        if let Some(validated_at) = state.validated_at {
            if state.mode == GateMode::Privileged && validated_at.elapsed() < self.ttl {
                state.hits += 1;
                return GateMode::Privileged;
            }
        }

        if let Some(not_before) = state.reprobe_not_before {
            if Instant::now() < not_before {
                state.hits += 1;
                return GateMode::DelegatedOnly;
            }
        }

        state.misses += 1;
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, self.probe.probe()).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        state.last_probe_ms = Some(elapsed_ms);

        match outcome {
            Ok(Ok(())) => {
                if state.mode == GateMode::DelegatedOnly {
                    info!(
                        target: "authz.credential",
                        credential = %self.fingerprint,
                        probe_ms = elapsed_ms,
                        "Privileged credential accepted, promoting to privileged mode"
                    );
                }
                state.mode = GateMode::Privileged;
                state.validated_at = Some(Instant::now());
                state.consecutive_failures = 0;
                state.reprobe_not_before = None;
                state.demotion_logged = false;
                GateMode::Privileged
            }
            Ok(Err(e)) => {
                self.demote_locked(&mut state, &format!("probe failed: {e}"));
                GateMode::DelegatedOnly
            }
            Err(_) => {
                self.demote_locked(
                    &mut state,
                    &format!("probe timed out after {:?}", self.probe_timeout),
                );
                GateMode::DelegatedOnly
            }
        }
    }

    /// Drop the cached validity; the next `mode()` call probes again.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.validated_at = None;
        state.reprobe_not_before = None;
    }

    /// Report a credential-rejection error observed on a live privileged
    /// query. Flips to delegated-only immediately; the transition is logged
    /// exactly once per demotion.
    pub async fn record_privileged_failure(&self, err: &DbError) {
        if !matches!(err, DbError::CredentialRejected(_)) {
            return;
        }
        let mut state = self.state.lock().await;
        self.demote_locked(&mut state, &err.to_string());
    }

    pub async fn stats(&self) -> GateStats {
        let state = self.state.lock().await;
        let total = state.hits + state.misses;
        GateStats {
            mode: state.mode.as_str(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                state.hits as f64 / total as f64
            },
            last_probe_ms: state.last_probe_ms,
            consecutive_failures: state.consecutive_failures,
        }
    }

    fn demote_locked(&self, state: &mut GateState, cause: &str) {
        state.consecutive_failures += 1;
        state.validated_at = None;
        state.reprobe_not_before = Some(Instant::now() + REPROBE_BACKOFF);

        // The privileged→delegated transition must never be silent
        if state.mode == GateMode::Privileged || !state.demotion_logged {
            warn!(
                target: "authz.credential",
                credential = %self.fingerprint,
                consecutive_failures = state.consecutive_failures,
                cause = %cause,
                "Privileged credential rejected, demoting to delegated-only mode"
            );
            state.demotion_logged = true;
        }
        state.mode = GateMode::DelegatedOnly;
    }
}

/// Short SHA-256 fingerprint of a credential, safe to log.
fn fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    let prefix = digest.get(..4).unwrap_or(&digest);
    hex::encode(prefix)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
        delay: Duration,
    }

    impl FakeProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
                delay,
            })
        }
    }

    impl CredentialProbe for FakeProbe {
        fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), DbError>> + Send + '_>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    Err(DbError::CredentialRejected("invalid api key".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn gate(probe: Arc<FakeProbe>) -> CredentialGate {
        CredentialGate::new(
            probe,
            "svc-credential",
            Duration::from_secs(86_400),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_probe_result_is_cached() {
        let probe = FakeProbe::new();
        let g = gate(probe.clone());

        assert_eq!(g.mode().await, GateMode::Privileged);
        assert_eq!(g.mode().await, GateMode::Privileged);
        assert_eq!(g.mode().await, GateMode::Privileged);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let stats = g.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_coalesce_on_single_probe() {
        let probe = FakeProbe::slow(Duration::from_millis(20));
        let g = Arc::new(gate(probe.clone()));

        let (a, b, c) = tokio::join!(g.mode(), g.mode(), g.mode());
        assert_eq!(a, GateMode::Privileged);
        assert_eq!(b, GateMode::Privileged);
        assert_eq!(c, GateMode::Privileged);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_demotes_with_backoff() {
        let probe = FakeProbe::new();
        probe.fail.store(true, Ordering::SeqCst);
        let g = gate(probe.clone());

        assert_eq!(g.mode().await, GateMode::DelegatedOnly);
        // Within the 60 s backoff the gate answers from cache
        assert_eq!(g.mode().await, GateMode::DelegatedOnly);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let stats = g.stats().await;
        assert_eq!(stats.mode, "delegated_only");
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_demotes() {
        let probe = FakeProbe::slow(Duration::from_secs(10));
        let g = gate(probe);

        assert_eq!(g.mode().await, GateMode::DelegatedOnly);
        let stats = g.stats().await;
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_live_rejection_flips_gate() {
        let probe = FakeProbe::new();
        let g = gate(probe.clone());
        assert_eq!(g.mode().await, GateMode::Privileged);

        g.record_privileged_failure(&DbError::CredentialRejected("invalid api key".into()))
            .await;

        // Demoted, and the backoff prevents an immediate re-probe
        assert_eq!(g.mode().await, GateMode::DelegatedOnly);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_credential_errors_do_not_flip_gate() {
        let probe = FakeProbe::new();
        let g = gate(probe);
        assert_eq!(g.mode().await, GateMode::Privileged);

        g.record_privileged_failure(&DbError::Unavailable("connection reset".into()))
            .await;
        assert_eq!(g.mode().await, GateMode::Privileged);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reprobe() {
        let probe = FakeProbe::new();
        let g = gate(probe.clone());
        assert_eq!(g.mode().await, GateMode::Privileged);
        g.invalidate().await;
        assert_eq!(g.mode().await, GateMode::Privileged);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fingerprint_is_short_and_stable() {
        let a = fingerprint("credential-a");
        let b = fingerprint("credential-a");
        let c = fingerprint("credential-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
        assert!(!a.contains("credential"));
    }
}
