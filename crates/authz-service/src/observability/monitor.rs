//! Performance monitor.
//!
//! Every core operation pushes a sample into a bounded ring buffer. A
//! background loop aggregates the last five minutes every 30 seconds and
//! compares the aggregates against fixed thresholds; breaches raise alerts
//! through pluggable sinks. An alert that resolves and re-enters within
//! five minutes is not re-emitted.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Ring buffer capacity.
pub const SAMPLE_CAPACITY: usize = 10_000;

/// Evaluation cadence.
pub const EVALUATION_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregation window.
pub const EVALUATION_WINDOW: Duration = Duration::from_secs(300);

/// Minimum samples before a rule can fire.
pub const MIN_SAMPLES: usize = 3;

/// Suppression window: a resolved alert re-entering within this interval is
/// reactivated silently.
pub const REEMIT_SUPPRESSION: Duration = Duration::from_secs(300);

/// Category of a sampled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    Authorization,
    UserLookup,
    CreditTransaction,
    CacheLookup,
    General,
}

impl SampleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleType::Authorization => "authorization",
            SampleType::UserLookup => "user_lookup",
            SampleType::CreditTransaction => "credit_transaction",
            SampleType::CacheLookup => "cache_lookup",
            SampleType::General => "general",
        }
    }

    const ALL: [SampleType; 5] = [
        SampleType::Authorization,
        SampleType::UserLookup,
        SampleType::CreditTransaction,
        SampleType::CacheLookup,
        SampleType::General,
    ];
}

/// One operation sample.
#[derive(Debug, Clone)]
pub struct OperationSample {
    pub recorded_at: Instant,
    pub sample_type: SampleType,
    pub latency_ms: f64,
    pub success: bool,
    pub cache_hit: Option<bool>,
    pub context: Option<&'static str>,
}

impl OperationSample {
    pub fn new(sample_type: SampleType, latency: Duration, success: bool) -> Self {
        Self {
            recorded_at: Instant::now(),
            sample_type,
            latency_ms: latency.as_secs_f64() * 1_000.0,
            success,
            cache_hit: None,
            context: None,
        }
    }

    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = Some(hit);
        self
    }

    pub fn with_context(mut self, context: &'static str) -> Self {
        self.context = Some(context);
        self
    }
}

/// Rolling statistics for one sample type.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationStats {
    pub sample_type: &'static str,
    pub count: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
    pub cache_hit_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Active,
    Resolved,
}

/// A threshold alert.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub rule: String,
    pub severity: AlertSeverity,
    pub state: AlertState,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Destination for alert transitions. Implementations must not block; slow
/// delivery (webhooks) is spawned.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &Alert);
}

/// Sink that logs alert transitions.
pub struct TracingSink;

impl AlertSink for TracingSink {
    fn emit(&self, alert: &Alert) {
        match (alert.state, alert.severity) {
            (AlertState::Resolved, _) => info!(
                target: "authz.monitor",
                rule = %alert.rule,
                "Alert resolved"
            ),
            (AlertState::Active, AlertSeverity::Warning) => warn!(
                target: "authz.monitor",
                rule = %alert.rule,
                message = %alert.message,
                "Performance alert"
            ),
            (AlertState::Active, _) => error!(
                target: "authz.monitor",
                rule = %alert.rule,
                severity = alert.severity.as_str(),
                message = %alert.message,
                "Performance alert"
            ),
        }
    }
}

/// Sink that POSTs alert transitions to a webhook.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

impl AlertSink for WebhookSink {
    fn emit(&self, alert: &Alert) {
        let client = self.client.clone();
        let url = self.url.clone();
        let body = serde_json::json!({
            "rule": alert.rule,
            "severity": alert.severity.as_str(),
            "state": alert.state,
            "message": alert.message,
            "raised_at": alert.raised_at,
            "resolved_at": alert.resolved_at,
        });

        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                warn!(
                    target: "authz.monitor",
                    error = %e,
                    "Alert webhook delivery failed"
                );
            }
        });
    }
}

struct AlertEntry {
    alert: Alert,
    last_emitted: Option<Instant>,
    resolved_at_instant: Option<Instant>,
}

pub struct PerformanceMonitor {
    samples: Mutex<VecDeque<OperationSample>>,
    alerts: Mutex<HashMap<String, AlertEntry>>,
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl PerformanceMonitor {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_CAPACITY)),
            alerts: Mutex::new(HashMap::new()),
            sinks,
        })
    }

    /// Push one sample. Oldest samples fall off past the capacity.
    pub fn record(&self, sample: OperationSample) {
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        if samples.len() >= SAMPLE_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Rolling statistics per sample type over the given window.
    pub fn stats(&self, window: Duration) -> Vec<OperationStats> {
        let Ok(samples) = self.samples.lock() else {
            return Vec::new();
        };
        let cutoff = Instant::now().checked_sub(window);

        SampleType::ALL
            .iter()
            .filter_map(|sample_type| {
                let in_window: Vec<&OperationSample> = samples
                    .iter()
                    .filter(|s| {
                        s.sample_type == *sample_type
                            && cutoff.map(|c| s.recorded_at >= c).unwrap_or(true)
                    })
                    .collect();

                if in_window.is_empty() {
                    return None;
                }

                let mut latencies: Vec<f64> =
                    in_window.iter().map(|s| s.latency_ms).collect();
                latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

                let count = in_window.len();
                let avg = latencies.iter().sum::<f64>() / count as f64;
                let errors = in_window.iter().filter(|s| !s.success).count();
                let cache_samples: Vec<bool> =
                    in_window.iter().filter_map(|s| s.cache_hit).collect();

                Some(OperationStats {
                    sample_type: sample_type.as_str(),
                    count,
                    avg_latency_ms: avg,
                    p95_latency_ms: percentile(&latencies, 0.95),
                    p99_latency_ms: percentile(&latencies, 0.99),
                    error_rate: errors as f64 / count as f64,
                    cache_hit_rate: if cache_samples.is_empty() {
                        None
                    } else {
                        Some(
                            cache_samples.iter().filter(|h| **h).count() as f64
                                / cache_samples.len() as f64,
                        )
                    },
                })
            })
            .collect()
    }

    /// Currently active alerts.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| {
                alerts
                    .values()
                    .filter(|entry| entry.alert.state == AlertState::Active)
                    .map(|entry| entry.alert.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evaluate all threshold rules over the last-five-minutes window.
    ///
    /// `max_pool_utilization` comes from the pool manager's snapshot and
    /// `cache_hit_rate` from the tiered cache; both are inputs rather than
    /// lookups so the monitor stays dependency-free.
    pub fn evaluate(&self, cache_hit_rate: Option<f64>, max_pool_utilization: Option<f64>) {
        let stats = self.stats(EVALUATION_WINDOW);
        let mut breaches: HashMap<String, (AlertSeverity, String)> = HashMap::new();

        for stat in &stats {
            if stat.count < MIN_SAMPLES {
                continue;
            }

            if stat.sample_type == "authorization" {
                let severity = if stat.avg_latency_ms > 100.0 {
                    Some(AlertSeverity::Emergency)
                } else if stat.avg_latency_ms > 50.0 {
                    Some(AlertSeverity::Critical)
                } else if stat.avg_latency_ms > 20.0 {
                    Some(AlertSeverity::Warning)
                } else {
                    None
                };
                if let Some(severity) = severity {
                    breaches.insert(
                        "auth_latency".into(),
                        (
                            severity,
                            format!("authorization avg latency {:.1} ms", stat.avg_latency_ms),
                        ),
                    );
                }
            } else if stat.avg_latency_ms > 50.0 {
                breaches
                    .entry("general_latency".into())
                    .or_insert((
                        AlertSeverity::Warning,
                        format!(
                            "{} avg latency {:.1} ms",
                            stat.sample_type, stat.avg_latency_ms
                        ),
                    ));
            }

            let error_severity = if stat.error_rate > 0.05 {
                Some(AlertSeverity::Critical)
            } else if stat.error_rate > 0.02 {
                Some(AlertSeverity::Warning)
            } else {
                None
            };
            if let Some(severity) = error_severity {
                let key = format!("error_rate:{}", stat.sample_type);
                breaches.insert(
                    key,
                    (
                        severity,
                        format!(
                            "{} error rate {:.1}%",
                            stat.sample_type,
                            stat.error_rate * 100.0
                        ),
                    ),
                );
            }
        }

        if let Some(rate) = cache_hit_rate {
            let severity = if rate < 0.85 {
                Some(AlertSeverity::Critical)
            } else if rate < 0.90 {
                Some(AlertSeverity::Warning)
            } else {
                None
            };
            if let Some(severity) = severity {
                breaches.insert(
                    "cache_hit_rate".into(),
                    (severity, format!("cache hit rate {:.1}%", rate * 100.0)),
                );
            }
        }

        if let Some(utilization) = max_pool_utilization {
            let severity = if utilization > 0.90 {
                Some(AlertSeverity::Critical)
            } else if utilization > 0.80 {
                Some(AlertSeverity::Warning)
            } else {
                None
            };
            if let Some(severity) = severity {
                breaches.insert(
                    "pool_utilization".into(),
                    (
                        severity,
                        format!("pool utilization {:.0}%", utilization * 100.0),
                    ),
                );
            }
        }

        self.apply_breaches(breaches);
    }

    fn apply_breaches(&self, breaches: HashMap<String, (AlertSeverity, String)>) {
        let mut to_emit: Vec<Alert> = Vec::new();
        {
            let Ok(mut alerts) = self.alerts.lock() else {
                return;
            };
            let now = Instant::now();

            for (rule, (severity, message)) in &breaches {
                match alerts.get_mut(rule) {
                    Some(entry) if entry.alert.state == AlertState::Active => {
                        // Escalations are always emitted
                        if *severity > entry.alert.severity {
                            entry.alert.severity = *severity;
                            entry.alert.message = message.clone();
                            entry.last_emitted = Some(now);
                            to_emit.push(entry.alert.clone());
                        } else {
                            entry.alert.message = message.clone();
                        }
                    }
                    Some(entry) => {
                        // Re-entry after resolve
                        let suppressed = entry
                            .resolved_at_instant
                            .map(|t| now.duration_since(t) < REEMIT_SUPPRESSION)
                            .unwrap_or(false);
                        entry.alert.state = AlertState::Active;
                        entry.alert.severity = *severity;
                        entry.alert.message = message.clone();
                        entry.alert.raised_at = Utc::now();
                        entry.alert.resolved_at = None;
                        if !suppressed {
                            entry.last_emitted = Some(now);
                            to_emit.push(entry.alert.clone());
                        }
                    }
                    None => {
                        let alert = Alert {
                            rule: rule.clone(),
                            severity: *severity,
                            state: AlertState::Active,
                            message: message.clone(),
                            raised_at: Utc::now(),
                            resolved_at: None,
                        };
                        alerts.insert(
                            rule.clone(),
                            AlertEntry {
                                alert: alert.clone(),
                                last_emitted: Some(now),
                                resolved_at_instant: None,
                            },
                        );
                        to_emit.push(alert);
                    }
                }
            }

            // Resolve anything active that no longer breaches
            for (rule, entry) in alerts.iter_mut() {
                if entry.alert.state == AlertState::Active && !breaches.contains_key(rule) {
                    entry.alert.state = AlertState::Resolved;
                    entry.alert.resolved_at = Some(Utc::now());
                    entry.resolved_at_instant = Some(now);
                    to_emit.push(entry.alert.clone());
                }
            }
        }

        for alert in &to_emit {
            for sink in &self.sinks {
                sink.emit(alert);
            }
        }
    }

    /// Background evaluation loop. Exits when the cancellation token fires.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        inputs: impl Fn() -> (Option<f64>, Option<f64>) + Send + 'static,
    ) {
        let mut interval = tokio::time::interval(EVALUATION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (cache_hit_rate, pool_utilization) = inputs();
                    self.evaluate(cache_hit_rate, pool_utilization);
                }
                _ = cancel.cancelled() => {
                    info!(
                        target: "authz.monitor",
                        "Performance monitor received shutdown signal, exiting"
                    );
                    break;
                }
            }
        }
    }
}

/// Nearest-rank percentile over a pre-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted.get(index).copied().unwrap_or(0.0)
}
