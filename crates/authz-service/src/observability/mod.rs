//! Observability for the authorization core.
//!
//! Two layers:
//! - `metrics` exports Prometheus-style counters/histograms/gauges through
//!   the `metrics` facade, with bounded label cardinality.
//! - `monitor` keeps an in-process rolling window of operation samples and
//!   raises threshold alerts through pluggable sinks.
//!
//! # Privacy
//!
//! Nothing in this module ever logs tokens, credentials, or raw driver
//! error text; samples carry classified error codes only.

pub mod metrics;
pub mod monitor;

pub use monitor::{
    Alert, AlertSeverity, AlertSink, AlertState, OperationSample, PerformanceMonitor, SampleType,
    TracingSink, WebhookSink,
};
